//! Change notifications published to the UI layer.
//!
//! Two kinds of change are published on the engine's event channel:
//! conversation-level summaries (unread count, newest message, removal) and
//! message-level deltas for the conversation the user has open. Both can be
//! merged with a newer change of the same kind, which is what the
//! [`coalesce`](super::coalesce) module relies on.

use std::collections::BTreeMap;

use serde::Serialize;

use bazaar_chat_proto::message::MessageId;

use super::message::Message;
use crate::transport::PeerId;

/// Merge a newer pending change into this one.
pub trait Coalesce {
    /// Fold `newer` into `self`; fields set in `newer` win.
    fn coalesce(&mut self, newer: Self);
}

/// Summary fields of a conversation that changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationData {
    /// New unread count, if it changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread: Option<usize>,
    /// New newest message, if it changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

impl ConversationData {
    /// Whether no field changed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.unread.is_none() && self.last_message.is_none()
    }
}

/// A conversation was updated or removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationChange {
    /// Peer of the conversation.
    #[serde(rename = "peerID")]
    pub peer_id: PeerId,
    /// The conversation no longer exists.
    pub removed: bool,
    /// Changed fields; empty when `removed` is set.
    pub data: ConversationData,
}

impl ConversationChange {
    /// A change removing the conversation with `peer_id`.
    #[must_use]
    pub fn removed(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            removed: true,
            data: ConversationData::default(),
        }
    }
}

impl Coalesce for ConversationChange {
    fn coalesce(&mut self, newer: Self) {
        self.removed = newer.removed;
        if newer.removed {
            self.data = ConversationData::default();
            return;
        }
        if newer.data.unread.is_some() {
            self.data.unread = newer.data.unread;
        }
        if newer.data.last_message.is_some() {
            self.data.last_message = newer.data.last_message;
        }
    }
}

/// Message-level changes in the active conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveMessagesChange {
    /// Inserted or updated messages.
    pub messages: BTreeMap<MessageId, Message>,
    /// Ids of removed messages.
    pub removed: Vec<MessageId>,
    /// Full ordering, present when it changed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sorted: Option<Vec<MessageId>>,
    /// The change is only read-flag flips and may be debounced.
    pub unread_update: bool,
}

impl Coalesce for ActiveMessagesChange {
    fn coalesce(&mut self, newer: Self) {
        self.messages.extend(newer.messages);
        for id in newer.removed {
            self.messages.remove(&id);
            if !self.removed.contains(&id) {
                self.removed.push(id);
            }
        }
        if newer.sorted.is_some() {
            self.sorted = newer.sorted;
        }
        self.unread_update &= newer.unread_update;
    }
}

/// Notification published on the engine's event channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ChatEvent {
    /// A conversation summary changed.
    ConversationChanged(ConversationChange),
    /// Messages of the active conversation changed.
    ActiveMessagesChanged(ActiveMessagesChange),
}
