//! Chat payload types exchanged between marketplace peers.
//!
//! A chat message travels as a [`ChatPayload`] inside a [`DirectMessage`]
//! tagged with [`MessageType::Chat`]. Identifiers are content-derived (see
//! [`MessageId::derive`]) so any node can deduplicate a message without
//! consulting the transport.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Multihash function code for SHA2-256.
const MULTIHASH_SHA2_256: u8 = 0x12;

/// Digest length of SHA2-256 in bytes, as carried in the multihash header.
const SHA2_256_LEN: u8 = 32;

/// Errors produced when building or interpreting payload values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// A message identifier was empty.
    #[error("message id must be a non-empty string")]
    EmptyMessageId,

    /// A wire timestamp does not describe a representable instant.
    #[error("invalid wire timestamp ({seconds}s, {nanos}ns)")]
    InvalidTimestamp {
        /// Seconds component as received.
        seconds: i64,
        /// Nanoseconds component as received.
        nanos: i32,
    },
}

/// Content-derived message identifier.
///
/// Rendered as a base58 multihash (`Qm...`) of the SHA2-256 digest of
/// `subject + "!" + timestamp`, so the same `(subject, timestamp)` pair
/// always yields the same identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Derives the identifier for a message created at `timestamp`.
    #[must_use]
    pub fn derive(subject: &str, timestamp: &DateTime<Utc>) -> Self {
        let combination = format!("{subject}!{}", to_iso8601(timestamp));
        let digest = Sha256::digest(combination.as_bytes());

        let mut multihash = Vec::with_capacity(2 + digest.len());
        multihash.push(MULTIHASH_SHA2_256);
        multihash.push(SHA2_256_LEN);
        multihash.extend_from_slice(&digest);

        Self(bs58::encode(multihash).into_string())
    }

    /// Wraps an identifier received from a peer or read back from storage.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::EmptyMessageId`] if `id` is empty.
    pub fn parse(id: impl Into<String>) -> Result<Self, PayloadError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PayloadError::EmptyMessageId);
        }
        Ok(Self(id))
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Renders a timestamp as ISO-8601 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn to_iso8601(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time truncated to whole milliseconds.
///
/// Message timestamps are millisecond-precision so that the rendered
/// ISO-8601 form (and therefore the derived [`MessageId`]) round-trips.
#[must_use]
pub fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Two-field timestamp used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTimestamp {
    /// Whole seconds since the UNIX epoch.
    pub seconds: i64,
    /// Sub-second part in nanoseconds.
    pub nanos: i32,
}

impl WireTimestamp {
    /// Converts back into a UTC instant.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError::InvalidTimestamp`] for negative nanos or an
    /// out-of-range instant.
    pub fn to_datetime(self) -> Result<DateTime<Utc>, PayloadError> {
        let invalid = PayloadError::InvalidTimestamp {
            seconds: self.seconds,
            nanos: self.nanos,
        };
        let nanos = u32::try_from(self.nanos).map_err(|_| invalid.clone())?;
        DateTime::from_timestamp(self.seconds, nanos).ok_or(invalid)
    }
}

impl From<DateTime<Utc>> for WireTimestamp {
    fn from(timestamp: DateTime<Utc>) -> Self {
        Self {
            seconds: timestamp.timestamp(),
            nanos: i32::try_from(timestamp.timestamp_subsec_nanos()).unwrap_or_default(),
        }
    }
}

/// Distinguishes real chat messages from secondary chat signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChatFlag {
    /// A message authored by the peer.
    #[default]
    Message,
    /// The peer is typing.
    Typing,
    /// The peer has read the conversation.
    Read,
}

/// Body of a [`MessageType::Chat`] direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Content-derived identifier chosen by the sender.
    pub message_id: MessageId,
    /// Subject the message belongs to (empty for direct chat).
    pub subject: String,
    /// Message text.
    pub message: String,
    /// Creation time of the message.
    pub timestamp: WireTimestamp,
    /// Whether this is a message or a typing/read signal.
    pub flag: ChatFlag,
}

/// Kind of a direct message between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// Peer chat (payload is a [`ChatPayload`]).
    Chat,
    /// Any other marketplace message kind, opaque to chat.
    Other(u32),
}

/// A message delivered by the transport from a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    /// Kind of the message.
    pub message_type: MessageType,
    /// Identifier of the sending peer.
    pub peer_id: String,
    /// Encoded payload, interpreted according to `message_type`.
    pub payload: Vec<u8>,
}
