//! Property-based tests for the conversation cache.
//!
//! Applies random sequences of inserts, updates, re-timestamps and removals
//! and checks after every step that:
//! 1. `unread` equals the number of inbound unread messages.
//! 2. The ordering, once built, lists every message exactly once in
//!    ascending (timestamp, id) order, however it was maintained.
//! 3. A conversation never exists without messages.

use bazaar_chat::chat::{ConversationCache, Message};
use bazaar_chat::transport::PeerId;
use bazaar_chat_proto::message::MessageId;
use chrono::{TimeZone, Utc};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    /// Insert or replace message `id`.
    Upsert {
        id: u8,
        seconds: i64,
        outgoing: bool,
        read: bool,
    },
    /// Flip the read flag of message `id` if present.
    ToggleRead { id: u8 },
    /// Remove message `id`.
    Remove { id: u8 },
    /// Read the ordering, materializing it.
    ReadSorted,
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0_u8..16, 0_i64..8, any::<bool>(), any::<bool>()).prop_map(
            |(id, seconds, outgoing, read)| Op::Upsert { id, seconds, outgoing, read }
        ),
        2 => (0_u8..16).prop_map(|id| Op::ToggleRead { id }),
        1 => (0_u8..16).prop_map(|id| Op::Remove { id }),
        1 => Just(Op::ReadSorted),
    ]
}

fn peer() -> PeerId {
    PeerId::new("QmVendor")
}

fn message_id(id: u8) -> MessageId {
    MessageId::parse(format!("Qm{id:02}")).unwrap()
}

fn message(id: u8, seconds: i64, outgoing: bool, read: bool) -> Message {
    Message {
        message_id: message_id(id),
        peer_id: peer(),
        subject: String::new(),
        body: format!("body {id}"),
        timestamp: Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(),
        outgoing,
        read,
        sending: false,
        sent: true,
        rev: None,
    }
}

fn check_invariants(cache: &ConversationCache) -> Result<(), TestCaseError> {
    let Some(conversation) = cache.get(&peer()) else {
        return Ok(());
    };
    prop_assert!(!conversation.is_empty());

    let expected_unread = conversation
        .messages()
        .values()
        .filter(|m| m.is_unread())
        .count();
    prop_assert_eq!(conversation.unread(), expected_unread);

    if conversation.is_sorted_materialized() {
        let mut expected: Vec<&Message> = conversation.messages().values().collect();
        expected.sort_by(|a, b| {
            (a.timestamp, &a.message_id).cmp(&(b.timestamp, &b.message_id))
        });
        let expected: Vec<MessageId> = expected.into_iter().map(|m| m.message_id.clone()).collect();
        prop_assert_eq!(conversation.sorted(), expected.as_slice());
    }
    Ok(())
}

proptest! {
    #[test]
    fn cache_invariants_hold(ops in prop::collection::vec(arb_op(), 1..120)) {
        let mut cache = ConversationCache::new();
        for op in ops {
            match op {
                Op::Upsert { id, seconds, outgoing, read } => {
                    cache.set_message(&peer(), message(id, seconds, outgoing, read));
                }
                Op::ToggleRead { id } => {
                    let current = cache
                        .get(&peer())
                        .and_then(|c| c.message(&message_id(id)).cloned());
                    if let Some(current) = current {
                        let read = !current.read;
                        cache.set_message(&peer(), Message { read, ..current });
                    }
                }
                Op::Remove { id } => {
                    cache.remove_message(&peer(), &message_id(id));
                }
                Op::ReadSorted => {
                    if let Some(conversation) = cache.conversation(&peer()) {
                        let _ = conversation.sorted();
                    }
                }
            }
            check_invariants(&cache)?;
        }
    }

    #[test]
    fn lazy_and_incremental_orders_agree(ops in prop::collection::vec(arb_op(), 1..80)) {
        let mut eager = ConversationCache::new();
        let mut lazy = ConversationCache::new();
        for op in ops {
            if let Op::Upsert { id, seconds, outgoing, read } = op {
                eager.set_message(&peer(), message(id, seconds, outgoing, read));
                lazy.set_message(&peer(), message(id, seconds, outgoing, read));
                if let Some(conversation) = eager.conversation(&peer()) {
                    let _ = conversation.sorted();
                }
            }
        }
        let eager_order = eager.get(&peer()).map(|c| c.sorted().to_vec());
        let lazy_order = lazy.get(&peer()).map(|c| c.sorted().to_vec());
        prop_assert_eq!(eager_order, lazy_order);
    }
}
