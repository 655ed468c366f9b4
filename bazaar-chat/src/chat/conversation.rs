//! Per-peer conversation cache.
//!
//! A [`Conversation`] holds every message exchanged with one peer, its
//! unread count and a lazily materialized ordering. The ordering is only
//! built the first time someone asks for it; once built it is maintained
//! incrementally by inserting new messages from the tail.
//!
//! Conversations are shared as `Arc<Conversation>` snapshots. Mutation goes
//! through [`Arc::make_mut`], so a snapshot handed out to a reader is never
//! changed underneath it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use bazaar_chat_proto::message::MessageId;

use super::message::Message;
use crate::store::Revision;
use crate::transport::PeerId;

/// Message ids of a conversation in ascending (timestamp, id) order.
///
/// Empty until first read; [`SortedOrder::get_or_build`] materializes it.
#[derive(Debug, Clone, Default)]
pub struct SortedOrder(OnceLock<Vec<MessageId>>);

impl SortedOrder {
    fn get_or_build(&self, messages: &HashMap<MessageId, Message>) -> &[MessageId] {
        self.0.get_or_init(|| {
            let mut ordered: Vec<&Message> = messages.values().collect();
            ordered.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
            ordered.into_iter().map(|m| m.message_id.clone()).collect()
        })
    }

    fn is_materialized(&self) -> bool {
        self.0.get().is_some()
    }
}

/// All messages exchanged with one peer.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: HashMap<MessageId, Message>,
    unread: usize,
    sorted: SortedOrder,
}

impl Conversation {
    /// Messages keyed by id.
    #[must_use]
    pub const fn messages(&self) -> &HashMap<MessageId, Message> {
        &self.messages
    }

    /// Look up one message.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Number of inbound messages not yet read.
    #[must_use]
    pub const fn unread(&self) -> usize {
        self.unread
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the conversation holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Message ids oldest first. Builds the ordering on first use.
    pub fn sorted(&self) -> &[MessageId] {
        self.sorted.get_or_build(&self.messages)
    }

    /// Whether the ordering has been built yet.
    #[must_use]
    pub fn is_sorted_materialized(&self) -> bool {
        self.sorted.is_materialized()
    }

    /// The newest message.
    pub fn last_message(&self) -> Option<&Message> {
        self.sorted().last().and_then(|id| self.messages.get(id))
    }

    /// Insert or replace a message, returning the previous version.
    fn upsert(&mut self, message: Message) -> Option<Message> {
        let previous = self.messages.get(&message.message_id);
        let was_unread = previous.is_some_and(Message::is_unread);
        let previous_timestamp = previous.map(|p| p.timestamp);

        match (was_unread, message.is_unread()) {
            (false, true) => self.unread += 1,
            (true, false) => self.unread = self.unread.saturating_sub(1),
            _ => {}
        }

        let reposition = previous_timestamp != Some(message.timestamp);
        if let Some(order) = self.sorted.0.get_mut()
            && reposition
        {
            if previous_timestamp.is_some() {
                order.retain(|id| *id != message.message_id);
            }
            // New messages are almost always the newest, so scan from the tail.
            let key = message.sort_key();
            let mut at = order.len();
            while at > 0 {
                let earlier = self
                    .messages
                    .get(&order[at - 1])
                    .map(Message::sort_key);
                if earlier.is_some_and(|earlier| key < earlier) {
                    at -= 1;
                } else {
                    break;
                }
            }
            order.insert(at, message.message_id.clone());
        }

        self.messages.insert(message.message_id.clone(), message)
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let removed = self.messages.remove(id)?;
        if removed.is_unread() {
            self.unread = self.unread.saturating_sub(1);
        }
        if let Some(order) = self.sorted.0.get_mut() {
            order.retain(|sorted_id| sorted_id != id);
        }
        Some(removed)
    }

    fn set_revision(&mut self, id: &MessageId, rev: Option<Revision>) -> bool {
        match self.messages.get_mut(id) {
            Some(message) => {
                message.rev = rev;
                true
            }
            None => false,
        }
    }
}

/// Conversations of the logged-in user, keyed by peer.
#[derive(Debug, Clone, Default)]
pub struct ConversationCache {
    conversations: HashMap<PeerId, Arc<Conversation>>,
}

impl ConversationCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the conversation with `peer`.
    #[must_use]
    pub fn get(&self, peer: &PeerId) -> Option<Arc<Conversation>> {
        self.conversations.get(peer).cloned()
    }

    /// Borrow the conversation with `peer` without taking a snapshot.
    #[must_use]
    pub fn conversation(&self, peer: &PeerId) -> Option<&Conversation> {
        self.conversations.get(peer).map(AsRef::as_ref)
    }

    /// Every conversation.
    #[must_use]
    pub const fn all(&self) -> &HashMap<PeerId, Arc<Conversation>> {
        &self.conversations
    }

    /// Number of conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether there are no conversations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Insert or replace a message in the conversation with `peer`,
    /// creating the conversation if needed. Returns the previous version.
    pub fn set_message(&mut self, peer: &PeerId, message: Message) -> Option<Message> {
        let conversation = self.conversations.entry(peer.clone()).or_default();
        Arc::make_mut(conversation).upsert(message)
    }

    /// Remove a message. A conversation left empty is dropped.
    pub fn remove_message(&mut self, peer: &PeerId, id: &MessageId) -> Option<Message> {
        let conversation = self.conversations.get_mut(peer)?;
        if !conversation.messages.contains_key(id) {
            return None;
        }
        let removed = Arc::make_mut(conversation).remove(id);
        if conversation.is_empty() {
            self.conversations.remove(peer);
        }
        removed
    }

    /// Record the store revision of a message without touching anything
    /// else. Returns `false` if the message is not cached.
    pub fn set_revision(&mut self, peer: &PeerId, id: &MessageId, rev: Option<Revision>) -> bool {
        let Some(conversation) = self.conversations.get_mut(peer) else {
            return false;
        };
        if !conversation.messages.contains_key(id) {
            return false;
        }
        Arc::make_mut(conversation).set_revision(id, rev)
    }
}
