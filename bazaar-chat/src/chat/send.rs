//! Send pipeline methods for [`ChatSyncEngine`].
//!
//! Sending a message walks through these steps:
//! 1. Reserve the message id in the in-flight registry
//! 2. Show the message in the cache as sending
//! 3. Save it to the unsent store (best-effort)
//! 4. Hand it to the transport, racing a logout
//! 5. Save it to the sent store and drop the unsent record
//!
//! A transport failure leaves the message in the cache as failed and in the
//! unsent store, from where [`retry_message`](ChatSyncEngine::retry_message)
//! picks it up.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use bazaar_chat_proto::message::{ChatFlag, ChatPayload, MessageId, MessageType, WireTimestamp, timestamp_now};

use crate::store::{Collection, MessageStore, RecordHandle, StoreError};
use crate::transport::{PeerId, Transport, TransportError};

use super::message::preview;
use super::{ChatError, ChatSyncEngine, Message, Mutation, SessionState, validate_id};

/// Errors that can occur when sending a message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The message body was empty.
    #[error("message body must not be empty")]
    EmptyBody,

    /// A send of this message is already in flight.
    #[error("message {0} is already being sent")]
    AlreadyInFlight(MessageId),

    /// A precondition of the send failed (cache, lookup, validation).
    #[error(transparent)]
    Chat(#[from] ChatError),

    /// The transport could not deliver the message. It is kept as failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The message was delivered but could not be saved as sent.
    #[error("message delivered but not saved: {0}")]
    Persist(StoreError),

    /// The user logged out before the transport finished.
    #[error("send cancelled by logout")]
    Cancelled,
}

/// Reservation of a message id in the in-flight registry.
///
/// Released on drop, so every exit path (including cancellation of the
/// calling future) clears the registry entry.
struct InFlight<'a> {
    state: &'a Mutex<SessionState>,
    peer: PeerId,
    id: MessageId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(ids) = state.in_flight.get_mut(&self.peer) {
            ids.remove(&self.id);
            if ids.is_empty() {
                state.in_flight.remove(&self.peer);
            }
        }
    }
}

impl<S: MessageStore, T: Transport> ChatSyncEngine<S, T> {
    /// Send a new message to `peer`.
    ///
    /// The message id is derived from `subject` and the creation time; if
    /// that id is already taken the timestamp is moved forward one
    /// millisecond at a time until it is free.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Transport`] if delivery failed (the message
    /// stays cached as failed), [`SendError::Persist`] if it was delivered
    /// but could not be saved as sent, [`SendError::Cancelled`] on logout,
    /// and [`SendError::Chat`] for load failures.
    pub async fn send_message(&self, peer: &PeerId, subject: &str, body: &str) -> Result<MessageId, SendError> {
        if body.is_empty() {
            return Err(SendError::EmptyBody);
        }
        self.ensure_loaded().await?;

        let (reservation, timestamp) = {
            let mut state = self.state.lock();
            let mut timestamp = timestamp_now();
            let mut id = MessageId::derive(subject, &timestamp);
            loop {
                let cached = state
                    .cache()?
                    .conversation(peer)
                    .is_some_and(|c| c.message(&id).is_some());
                if !cached && !state.is_in_flight(peer, &id) {
                    break;
                }
                timestamp += TimeDelta::milliseconds(1);
                id = MessageId::derive(subject, &timestamp);
            }
            state.in_flight.entry(peer.clone()).or_default().insert(id.clone());
            (
                InFlight {
                    state: &self.state,
                    peer: peer.clone(),
                    id,
                },
                timestamp,
            )
        };

        let message = Message {
            message_id: reservation.id.clone(),
            peer_id: peer.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
            timestamp,
            outgoing: true,
            read: false,
            sending: true,
            sent: false,
            rev: None,
        };
        self.transmit(reservation, message, timestamp).await
    }

    /// Send a failed message again under the same id.
    ///
    /// The wire payload carries a fresh timestamp; the cached timestamp is
    /// only updated once the transport accepts the message.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Chat`] with [`ChatError::NotFound`] for an
    /// unknown message or [`ChatError::InvalidMessage`] for an inbound or
    /// already sent one, [`SendError::AlreadyInFlight`] if it is being sent,
    /// and otherwise the errors of [`send_message`](Self::send_message).
    pub async fn retry_message(&self, peer: &PeerId, message_id: &MessageId) -> Result<MessageId, SendError> {
        validate_id(message_id)?;
        self.ensure_loaded().await?;

        let (reservation, message) = {
            let mut state = self.state.lock();
            let message = state
                .cache()?
                .conversation(peer)
                .and_then(|c| c.message(message_id))
                .cloned()
                .ok_or_else(|| ChatError::NotFound(message_id.clone()))?;
            if !message.outgoing || message.sent {
                return Err(ChatError::InvalidMessage(format!(
                    "message {message_id} is not a failed outgoing message"
                ))
                .into());
            }
            if state.is_in_flight(peer, message_id) {
                return Err(SendError::AlreadyInFlight(message_id.clone()));
            }
            state
                .in_flight
                .entry(peer.clone())
                .or_default()
                .insert(message_id.clone());
            (
                InFlight {
                    state: &self.state,
                    peer: peer.clone(),
                    id: message_id.clone(),
                },
                message,
            )
        };

        tracing::debug!(peer = %peer, message_id = %message_id, "retrying message");
        self.transmit(reservation, message, timestamp_now()).await
    }

    /// Delete an outgoing message that was never sent.
    ///
    /// Removes its unsent-store record (best-effort) and the cached message.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidMessage`] for an empty id, an inbound or
    /// sent message, [`ChatError::InFlight`] while it is being sent and
    /// [`ChatError::NotFound`] if it is not cached.
    pub async fn cancel_message(&self, peer: &PeerId, message_id: &MessageId) -> Result<(), ChatError> {
        validate_id(message_id)?;
        self.ensure_loaded().await?;

        {
            let state = self.state.lock();
            if state.is_in_flight(peer, message_id) {
                return Err(ChatError::InFlight(message_id.clone()));
            }
            let message = state
                .cache()?
                .conversation(peer)
                .and_then(|c| c.message(message_id))
                .ok_or_else(|| ChatError::NotFound(message_id.clone()))?;
            if !message.outgoing || message.sent {
                return Err(ChatError::InvalidMessage(format!(
                    "message {message_id} was not an unsent outgoing message"
                )));
            }
        }

        let handle = RecordHandle::for_message(Collection::UnsentChatMessages, message_id);
        if let Err(e) = self.store.remove(&handle).await {
            tracing::warn!(message_id = %message_id, error = %e, "unable to remove unsent record");
        }
        self.apply(peer, Mutation::Remove(message_id.clone())).await
    }

    async fn transmit(
        &self,
        reservation: InFlight<'_>,
        message: Message,
        wire_timestamp: DateTime<Utc>,
    ) -> Result<MessageId, SendError> {
        let peer = reservation.peer.clone();
        let message_id = reservation.id.clone();
        let mut session = self.session_watch();

        self.apply(
            &peer,
            Mutation::Upsert(Message {
                sending: true,
                sent: false,
                ..message.clone()
            }),
        )
        .await?;

        let record = crate::store::StoredMessage {
            timestamp: wire_timestamp,
            ..message.to_stored()
        };
        let unsent = match self.store.insert(Collection::UnsentChatMessages, &record).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(
                    peer = %peer,
                    message = %preview(&message.body),
                    error = %e,
                    "unable to save message in the unsent store"
                );
                None
            }
        };

        let payload = ChatPayload {
            message_id: message_id.clone(),
            subject: message.subject.clone(),
            message: message.body.clone(),
            timestamp: WireTimestamp::from(wire_timestamp),
            flag: ChatFlag::Message,
        };
        let outcome = tokio::select! {
            result = self.transport.send(MessageType::Chat, &peer, &payload) => Some(result),
            _ = session.changed() => None,
        };
        drop(reservation);

        match outcome {
            None => {
                tracing::info!(peer = %peer, message_id = %message_id, "send cancelled by logout");
                return Err(SendError::Cancelled);
            }
            Some(Err(e)) => {
                tracing::warn!(
                    peer = %peer,
                    message = %preview(&message.body),
                    error = %e,
                    "message send failed"
                );
                self.update_quietly(
                    &peer,
                    Message {
                        sending: false,
                        sent: false,
                        ..message
                    },
                )
                .await;
                return Err(SendError::Transport(e));
            }
            Some(Ok(())) => {}
        }

        let delivered = Message {
            timestamp: wire_timestamp,
            sending: false,
            sent: true,
            ..message
        };
        match self.store.insert(Collection::ChatMessages, &record).await {
            Ok(handle) => {
                self.update_quietly(
                    &peer,
                    Message {
                        rev: handle.rev,
                        ..delivered
                    },
                )
                .await;
            }
            Err(e) => {
                tracing::error!(
                    peer = %peer,
                    message = %preview(&delivered.body),
                    error = %e,
                    "unable to save sent message"
                );
                self.update_quietly(&peer, delivered).await;
                return Err(SendError::Persist(e));
            }
        }

        if let Some(handle) = unsent
            && let Err(e) = self.store.remove(&handle).await
        {
            tracing::debug!(message_id = %message_id, error = %e, "unable to remove unsent record");
        }

        tracing::debug!(peer = %peer, message_id = %message_id, "message sent");
        Ok(message_id)
    }

    /// Update a cached message, ignoring a cache dropped by logout.
    async fn update_quietly(&self, peer: &PeerId, message: Message) {
        let id = message.message_id.clone();
        if let Err(e) = self.apply(peer, Mutation::Upsert(message)).await {
            tracing::debug!(message_id = %id, error = %e, "cached message not updated");
        }
    }
}
