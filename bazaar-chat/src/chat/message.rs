//! The cached chat message and its delivery state.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use bazaar_chat_proto::message::{MessageId, to_iso8601};

use crate::store::{Revision, StoredMessage};
use crate::transport::PeerId;

/// Number of characters of a message body shown in log lines.
const PREVIEW_CHARS: usize = 10;

/// Delivery state of a message, derived from its flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryState {
    /// Inbound message from the peer.
    Received,
    /// Outgoing message currently being transmitted.
    Sending,
    /// Outgoing message handed to the transport successfully.
    Sent,
    /// Outgoing message whose last send attempt failed (or never ran).
    Failed,
}

/// One chat message as held by the conversation cache.
///
/// Everything except `read`, `sending`, `sent` and the store revision is
/// fixed once the message exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Content-derived identifier.
    #[serde(rename = "messageID")]
    pub message_id: MessageId,
    /// The remote peer of the conversation.
    #[serde(rename = "peerID")]
    pub peer_id: PeerId,
    /// Subject the message belongs to.
    pub subject: String,
    /// Message text.
    #[serde(rename = "message")]
    pub body: String,
    /// Creation time, ordered ascending within a conversation.
    #[serde(serialize_with = "serialize_iso8601")]
    pub timestamp: DateTime<Utc>,
    /// Whether the local user authored the message.
    pub outgoing: bool,
    /// Whether the local user has read the message.
    pub read: bool,
    /// Whether a send of this message is in flight.
    pub sending: bool,
    /// Whether the message reached the transport.
    pub sent: bool,
    /// Revision of the persisted chat-message record, if there is one.
    #[serde(skip)]
    pub rev: Option<Revision>,
}

fn serialize_iso8601<S: Serializer>(timestamp: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&to_iso8601(timestamp))
}

impl Message {
    /// Rebuild a cached message from a persisted record.
    #[must_use]
    pub fn from_stored(record: StoredMessage, rev: Option<Revision>, sending: bool, sent: bool) -> Self {
        Self {
            message_id: record.message_id,
            peer_id: record.peer_id,
            subject: record.subject,
            body: record.body,
            timestamp: record.timestamp,
            outgoing: record.outgoing,
            read: record.read,
            sending,
            sent,
            rev,
        }
    }

    /// The persisted shape of this message.
    #[must_use]
    pub fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            message_id: self.message_id.clone(),
            peer_id: self.peer_id.clone(),
            subject: self.subject.clone(),
            body: self.body.clone(),
            timestamp: self.timestamp,
            outgoing: self.outgoing,
            read: self.read,
        }
    }

    /// Inbound and not yet read.
    #[must_use]
    pub const fn is_unread(&self) -> bool {
        !self.outgoing && !self.read
    }

    /// Current delivery state.
    #[must_use]
    pub const fn delivery_state(&self) -> DeliveryState {
        if !self.outgoing {
            DeliveryState::Received
        } else if self.sending {
            DeliveryState::Sending
        } else if self.sent {
            DeliveryState::Sent
        } else {
            DeliveryState::Failed
        }
    }

    /// Ordering key within a conversation: timestamp, then id.
    pub(crate) fn sort_key(&self) -> (&DateTime<Utc>, &MessageId) {
        (&self.timestamp, &self.message_id)
    }
}

/// Short preview of a message body for log lines.
#[must_use]
pub fn preview(body: &str) -> String {
    let mut chars = body.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}
