//! Property-based tests for content-derived message identifiers.
//!
//! Uses proptest to verify:
//! 1. Deriving an id is deterministic for a given subject and timestamp.
//! 2. Distinct millisecond timestamps yield distinct ids.
//! 3. Every derived id is a base58 SHA2-256 multihash.
//! 4. Wire timestamps convert back to the exact instant.
//! 5. Random bytes never cause a panic in `decode_payload`.

use bazaar_chat_proto::codec;
use bazaar_chat_proto::message::{MessageId, WireTimestamp};
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;

/// Strategy for millisecond-precision timestamps between 2001 and 2286.
fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (1_000_000_000_000_i64..10_000_000_000_000).prop_map(|millis| {
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    })
}

proptest! {
    #[test]
    fn derive_is_deterministic(subject in "[a-zA-Z0-9 ]{0,40}", ts in arb_timestamp()) {
        prop_assert_eq!(MessageId::derive(&subject, &ts), MessageId::derive(&subject, &ts));
    }

    #[test]
    fn distinct_timestamps_give_distinct_ids(
        subject in "[a-z]{0,10}",
        ts in arb_timestamp(),
        offset in 1_i64..1_000_000,
    ) {
        let later = ts + chrono::TimeDelta::milliseconds(offset);
        prop_assert_ne!(MessageId::derive(&subject, &ts), MessageId::derive(&subject, &later));
    }

    #[test]
    fn derived_ids_are_sha256_multihashes(subject in ".{0,40}", ts in arb_timestamp()) {
        let id = MessageId::derive(&subject, &ts);
        prop_assert!(id.as_str().starts_with("Qm"));
        let bytes = bs58::decode(id.as_str()).into_vec().unwrap();
        prop_assert_eq!(bytes.len(), 34);
        prop_assert_eq!(bytes[0], 0x12);
        prop_assert_eq!(bytes[1], 0x20);
    }

    #[test]
    fn wire_timestamp_is_exact(ts in arb_timestamp(), nanos in 0_u32..1_000_000) {
        let precise = ts + chrono::TimeDelta::nanoseconds(i64::from(nanos));
        let wire = WireTimestamp::from(precise);
        prop_assert_eq!(wire.to_datetime().unwrap(), precise);
    }

    #[test]
    fn random_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = codec::decode_payload(&bytes);
    }
}
