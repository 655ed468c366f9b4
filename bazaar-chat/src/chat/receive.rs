//! Receive pipeline methods for [`ChatSyncEngine`].
//!
//! Inbound chat messages are persisted before they are shown, so a message
//! in the cache always has a store record. Typing and read signals share the
//! chat message type but are not messages and are ignored here.

use bazaar_chat_proto::codec;
use bazaar_chat_proto::message::{ChatFlag, DirectMessage, MessageId, MessageType};

use crate::store::{Collection, MessageStore, StoredMessage};
use crate::transport::{PeerId, Transport};

use super::message::preview;
use super::{ChatError, ChatSyncEngine, Message, Mutation, apply_locked};

impl<S: MessageStore, T: Transport> ChatSyncEngine<S, T> {
    /// Process one direct message delivered by the transport.
    ///
    /// Returns the id of the stored message, or `None` when the message was
    /// not a new chat message (other message type, typing or read signal,
    /// malformed payload, duplicate). A message arriving while its
    /// conversation is open and visible is stored as read.
    ///
    /// # Errors
    ///
    /// Propagates load failures and returns [`ChatError::Store`] if the
    /// message cannot be persisted, in which case it is not cached either.
    pub async fn handle_direct_message(&self, direct: DirectMessage) -> Result<Option<MessageId>, ChatError> {
        if direct.message_type != MessageType::Chat {
            tracing::trace!(message_type = ?direct.message_type, "ignoring non-chat direct message");
            return Ok(None);
        }
        let peer = PeerId::new(direct.peer_id);

        let payload = match codec::decode_payload(&direct.payload) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "dropping undecodable chat payload");
                return Ok(None);
            }
        };
        if payload.flag != ChatFlag::Message {
            tracing::trace!(peer = %peer, flag = ?payload.flag, "ignoring chat signal");
            return Ok(None);
        }
        let timestamp = match payload.timestamp.to_datetime() {
            Ok(timestamp) => timestamp,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "dropping chat message with bad timestamp");
                return Ok(None);
            }
        };
        if payload.message_id.as_str().is_empty() {
            tracing::warn!(peer = %peer, "dropping chat message without an id");
            return Ok(None);
        }

        self.ensure_loaded().await?;

        let read = {
            let state = self.state.lock();
            let duplicate = state
                .cache()?
                .conversation(&peer)
                .is_some_and(|c| c.message(&payload.message_id).is_some());
            if duplicate {
                tracing::debug!(peer = %peer, message_id = %payload.message_id, "ignoring duplicate chat message");
                return Ok(None);
            }
            state.active.is_viewing(&peer)
        };

        let record = StoredMessage {
            message_id: payload.message_id,
            peer_id: peer.clone(),
            subject: payload.subject,
            body: payload.message,
            timestamp,
            outgoing: false,
            read,
        };

        let handle = self
            .store
            .insert(Collection::ChatMessages, &record)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    peer = %peer,
                    message = %preview(&record.body),
                    error = %e,
                    "unable to save inbound message"
                );
            })?;

        let id = record.message_id.clone();
        let immediate = {
            let mut state = self.state.lock();
            // A concurrent delivery of the same message may have got here first.
            let raced = state
                .cache()?
                .conversation(&peer)
                .and_then(|c| c.message(&id))
                .is_some_and(|cached| cached.rev >= handle.rev);
            if raced {
                tracing::debug!(peer = %peer, message_id = %id, "inbound message already cached");
                return Ok(None);
            }
            let message = Message::from_stored(record, handle.rev, false, true);
            let changes = apply_locked(&mut state, &peer, Mutation::Upsert(message))?;
            self.queue_locked(changes)
        };
        self.publish(immediate).await;
        tracing::debug!(peer = %peer, message_id = %id, "inbound message stored");
        Ok(Some(id))
    }
}
