//! Chat synchronization engine.
//!
//! [`ChatSyncEngine`] keeps an in-memory cache of every conversation of the
//! logged-in user, backed by an encrypted [`MessageStore`], and keeps it in
//! sync with three sources of change: messages the user sends (see
//! [`send`]), chat messages arriving from peers (see [`receive`]) and bulk
//! read marking. Every cache mutation is turned into change notifications
//! that are published, debounced where needed, on the channel returned by
//! [`ChatSyncEngine::new`].
//!
//! The cache is populated lazily by the first operation that needs it and
//! dropped on logout.

pub mod coalesce;
pub mod conversation;
pub mod events;
pub mod message;
pub mod receive;
pub mod send;
pub mod slices;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};

use bazaar_chat_proto::message::MessageId;

use crate::config::{ChatConfig, CorruptRecordPolicy};
use crate::crypto::{CryptoError, Crypter};
use crate::store::{Collection, EncryptedDoc, MessageStore, RecordHandle, StoreError, StoredMessage};
use crate::transport::{PeerId, Transport};

pub use coalesce::Coalescer;
pub use conversation::{Conversation, ConversationCache};
pub use events::{
    ActiveMessagesChange, ChatEvent, Coalesce, ConversationChange, ConversationData,
};
pub use message::{DeliveryState, Message};
pub use send::SendError;

/// Errors returned by cache and synchronization operations.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The operation needs the conversation cache, which is not loaded.
    #[error("chat data must be loaded before it can be modified")]
    CacheNotLoaded,

    /// The message or id supplied is not acceptable.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No cached message has this id.
    #[error("message {0} not found")]
    NotFound(MessageId),

    /// The message is currently being sent.
    #[error("message {0} is being sent")]
    InFlight(MessageId),

    /// A persisted record could not be decrypted during the initial load.
    #[error("failed to load chat record {id}: {source}")]
    Load {
        /// Document id of the record.
        id: String,
        /// Decryption failure.
        source: CryptoError,
    },

    /// The user logged out while the operation was running.
    #[error("the chat session ended")]
    SessionEnded,

    /// The message store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A record could not be sealed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Session lifecycle events the engine reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The user logged out; all session state must go.
    Logout,
}

/// The conversation the user is looking at, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveConversation {
    /// Peer of the open conversation.
    pub peer_id: Option<PeerId>,
    /// Whether the chat panel is visible.
    pub chat_open: bool,
}

impl ActiveConversation {
    /// Whether a message from `peer` arriving now is seen immediately.
    #[must_use]
    pub fn is_viewing(&self, peer: &PeerId) -> bool {
        self.chat_open && self.peer_id.as_ref() == Some(peer)
    }
}

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Peer of the conversation.
    #[serde(rename = "peerID")]
    pub peer_id: PeerId,
    /// Unread inbound messages.
    pub unread: usize,
    /// Newest message.
    pub last_message: Option<Message>,
}

/// Messages of one conversation in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationMessages {
    /// Message ids oldest first.
    pub sorted: Vec<MessageId>,
    /// Messages keyed by id.
    pub messages: BTreeMap<MessageId, Message>,
}

impl ConversationMessages {
    fn of(conversation: &Conversation) -> Self {
        Self {
            sorted: conversation.sorted().to_vec(),
            messages: conversation
                .messages()
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect(),
        }
    }

    /// Messages in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.sorted.iter().filter_map(|id| self.messages.get(id))
    }
}

/// Change to apply to one cached conversation.
pub(crate) enum Mutation {
    Upsert(Message),
    Remove(MessageId),
}

/// Notifications produced by one mutation.
#[derive(Debug, Default)]
pub(crate) struct Changes {
    conversation: Option<ConversationChange>,
    active: Option<ActiveMessagesChange>,
}

#[derive(Default)]
struct SessionState {
    cache: Option<ConversationCache>,
    active: ActiveConversation,
    in_flight: HashMap<PeerId, HashSet<MessageId>>,
}

impl SessionState {
    fn cache(&self) -> Result<&ConversationCache, ChatError> {
        self.cache.as_ref().ok_or(ChatError::CacheNotLoaded)
    }

    fn is_in_flight(&self, peer: &PeerId, id: &MessageId) -> bool {
        self.in_flight.get(peer).is_some_and(|ids| ids.contains(id))
    }
}

/// Keeps the conversation cache, the message store and the UI in sync.
pub struct ChatSyncEngine<S: MessageStore, T: Transport> {
    store: S,
    transport: T,
    config: ChatConfig,
    state: Mutex<SessionState>,
    /// Serializes cache population so concurrent callers load once.
    load_gate: tokio::sync::Mutex<()>,
    coalescer: Coalescer,
    /// Bumped on every logout; in-flight work watches it to abort.
    session: watch::Sender<u64>,
}

impl<S: MessageStore, T: Transport> ChatSyncEngine<S, T> {
    /// Create an engine over `store` and `transport`.
    ///
    /// Returns the engine and the receiver of its [`ChatEvent`]s. Must be
    /// called from within a Tokio runtime.
    pub fn new(store: S, transport: T, config: ChatConfig) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let coalescer = Coalescer::spawn(config.coalesce_window, event_tx);
        let (session, _) = watch::channel(0);
        let engine = Self {
            store,
            transport,
            config,
            state: Mutex::new(SessionState::default()),
            load_gate: tokio::sync::Mutex::new(()),
            coalescer,
            session,
        };
        (engine, event_rx)
    }

    /// The backing message store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The transport used for outgoing messages.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// The engine configuration.
    pub const fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Whether the conversation cache is currently populated.
    pub fn is_loaded(&self) -> bool {
        self.state.lock().cache.is_some()
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Populate the cache from the store unless it already is.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] if a collection cannot be listed,
    /// [`ChatError::Load`] for an undecryptable record under
    /// [`CorruptRecordPolicy::Abort`], or [`ChatError::SessionEnded`] if the
    /// user logged out while loading.
    pub async fn ensure_loaded(&self) -> Result<(), ChatError> {
        if self.is_loaded() {
            return Ok(());
        }
        let _gate = self.load_gate.lock().await;
        if self.is_loaded() {
            return Ok(());
        }

        let generation = *self.session.borrow();
        let started = Instant::now();
        let records = self.load_records().await?;

        let mut state = self.state.lock();
        if *self.session.borrow() != generation {
            tracing::debug!("session ended during chat load, discarding result");
            return Err(ChatError::SessionEnded);
        }

        let mut cache = ConversationCache::new();
        let count = records.len();
        for loaded in records {
            let peer = loaded.record.peer_id.clone();
            let sending = state.is_in_flight(&peer, &loaded.record.message_id);
            let sent = !loaded.unsent && !sending;
            let rev = if loaded.unsent { None } else { loaded.rev };
            cache.set_message(&peer, Message::from_stored(loaded.record, rev, sending, sent));
        }

        tracing::info!(
            messages = count,
            conversations = cache.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "chat data loaded"
        );
        state.cache = Some(cache);
        Ok(())
    }

    async fn load_records(&self) -> Result<Vec<LoadedRecord>, ChatError> {
        let (sent, unsent) = tokio::try_join!(
            self.store.list_all(Collection::ChatMessages),
            self.store.list_all(Collection::UnsentChatMessages),
        )?;

        // Unsent first so a record present in both collections loads as sent.
        let docs: Vec<(EncryptedDoc, bool)> = unsent
            .into_iter()
            .map(|doc| (doc, true))
            .chain(sent.into_iter().map(|doc| (doc, false)))
            .filter(|(doc, _)| !doc.is_meta())
            .collect();

        let crypter = self.store.crypter();
        let opened = slices::map_in_slices(docs, self.config.ops_per_slice, |(doc, unsent)| {
            let record = doc.decrypt(crypter);
            (doc.id, doc.rev, unsent, record)
        })
        .await;

        let mut records = Vec::with_capacity(opened.len());
        for (id, rev, unsent, record) in opened {
            match record {
                Ok(record) => records.push(LoadedRecord { record, rev, unsent }),
                Err(source) => match self.config.corrupt_records {
                    CorruptRecordPolicy::Skip => {
                        tracing::warn!(document = %id, error = %source, "skipping unreadable chat record");
                    }
                    CorruptRecordPolicy::Abort => {
                        tracing::error!(document = %id, error = %source, "unreadable chat record, aborting load");
                        return Err(ChatError::Load { id, source });
                    }
                },
            }
        }
        Ok(records)
    }

    // -----------------------------------------------------------------------
    // Read models
    // -----------------------------------------------------------------------

    /// Every conversation, loading the cache first if needed.
    ///
    /// # Errors
    ///
    /// Propagates load failures, see [`ensure_loaded`](Self::ensure_loaded).
    pub async fn chat_data(&self) -> Result<HashMap<PeerId, Arc<Conversation>>, ChatError> {
        self.ensure_loaded().await?;
        Ok(self.state.lock().cache()?.all().clone())
    }

    /// Snapshot of the conversation with `peer`, loading the cache first if
    /// needed.
    ///
    /// # Errors
    ///
    /// Propagates load failures, see [`ensure_loaded`](Self::ensure_loaded).
    pub async fn conversation(&self, peer: &PeerId) -> Result<Option<Arc<Conversation>>, ChatError> {
        self.ensure_loaded().await?;
        self.cached_conversation(peer)
    }

    /// Snapshot of the conversation with `peer` without loading.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::CacheNotLoaded`] if the cache is not populated.
    pub fn cached_conversation(&self, peer: &PeerId) -> Result<Option<Arc<Conversation>>, ChatError> {
        Ok(self.state.lock().cache()?.get(peer))
    }

    /// The conversation list, newest activity first.
    ///
    /// # Errors
    ///
    /// Propagates load failures, see [`ensure_loaded`](Self::ensure_loaded).
    pub async fn conversations(&self) -> Result<Vec<ConversationSummary>, ChatError> {
        self.ensure_loaded().await?;
        let state = self.state.lock();
        let mut summaries: Vec<ConversationSummary> = state
            .cache()?
            .all()
            .iter()
            .map(|(peer, conversation)| ConversationSummary {
                peer_id: peer.clone(),
                unread: conversation.unread(),
                last_message: conversation.last_message().cloned(),
            })
            .collect();
        summaries.sort_by(|a, b| {
            let newest = |s: &ConversationSummary| s.last_message.as_ref().map(|m| m.timestamp);
            newest(b).cmp(&newest(a)).then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        Ok(summaries)
    }

    /// Messages exchanged with `peer` in display order; empty if none.
    ///
    /// # Errors
    ///
    /// Propagates load failures, see [`ensure_loaded`](Self::ensure_loaded).
    pub async fn conversation_messages(&self, peer: &PeerId) -> Result<ConversationMessages, ChatError> {
        Ok(self
            .conversation(peer)
            .await?
            .map(|c| ConversationMessages::of(&c))
            .unwrap_or_default())
    }

    // -----------------------------------------------------------------------
    // Active conversation
    // -----------------------------------------------------------------------

    /// Make `peer` the active conversation and return its messages.
    ///
    /// # Errors
    ///
    /// Propagates load failures, see [`ensure_loaded`](Self::ensure_loaded).
    pub async fn activate_conversation(&self, peer: &PeerId) -> Result<ConversationMessages, ChatError> {
        self.ensure_loaded().await?;
        self.state.lock().active.peer_id = Some(peer.clone());
        tracing::debug!(peer = %peer, "conversation activated");
        self.conversation_messages(peer).await
    }

    /// Clear the active conversation.
    pub fn deactivate_conversation(&self) {
        self.state.lock().active.peer_id = None;
    }

    /// Record whether the chat panel is visible.
    pub fn set_chat_open(&self, open: bool) {
        self.state.lock().active.chat_open = open;
    }

    /// The current active-conversation state.
    pub fn active_conversation(&self) -> ActiveConversation {
        self.state.lock().active.clone()
    }

    // -----------------------------------------------------------------------
    // Cache mutation
    // -----------------------------------------------------------------------

    /// Insert or update one cached message and publish the resulting changes.
    ///
    /// Does not persist anything.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::CacheNotLoaded`] if the cache is not populated
    /// and [`ChatError::InvalidMessage`] if the message has no id or belongs
    /// to another peer.
    pub async fn set_message(&self, peer: &PeerId, message: Message) -> Result<(), ChatError> {
        validate_id(&message.message_id)?;
        if message.peer_id != *peer {
            return Err(ChatError::InvalidMessage(format!(
                "message {} belongs to {}, not {peer}",
                message.message_id, message.peer_id
            )));
        }
        self.apply(peer, Mutation::Upsert(message)).await
    }

    /// Remove one cached message and publish the resulting changes.
    ///
    /// Removing an unknown message is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::CacheNotLoaded`] if the cache is not populated
    /// and [`ChatError::InvalidMessage`] for an empty id.
    pub async fn remove_message(&self, peer: &PeerId, message_id: &MessageId) -> Result<(), ChatError> {
        validate_id(message_id)?;
        self.apply(peer, Mutation::Remove(message_id.clone())).await
    }

    pub(crate) async fn apply(&self, peer: &PeerId, mutation: Mutation) -> Result<(), ChatError> {
        let immediate = {
            let mut state = self.state.lock();
            let changes = apply_locked(&mut state, peer, mutation)?;
            self.queue_locked(changes)
        };
        self.publish(immediate).await;
        Ok(())
    }

    /// Hand debounced changes to the coalescer and return the change that
    /// must be published at once, if any.
    ///
    /// Called with the state lock held so changes are queued in the order
    /// they were applied to the cache.
    pub(crate) fn queue_locked(&self, changes: Changes) -> Option<ActiveMessagesChange> {
        if let Some(change) = changes.conversation {
            self.coalescer.conversation_changed(change);
        }
        match changes.active {
            Some(change) if change.unread_update => {
                self.coalescer.read_flipped(change);
                None
            }
            immediate => immediate,
        }
    }

    pub(crate) async fn publish(&self, immediate: Option<ActiveMessagesChange>) {
        if let Some(change) = immediate {
            self.coalescer.active_changed(change).await;
        }
    }

    /// Record store revisions after a write without publishing anything.
    pub(crate) fn refresh_revisions(&self, peer: &PeerId, handles: &[RecordHandle]) {
        let mut state = self.state.lock();
        let Some(cache) = state.cache.as_mut() else {
            return;
        };
        for handle in handles {
            let Ok(id) = MessageId::parse(handle.id.as_str()) else {
                continue;
            };
            cache.set_revision(peer, &id, handle.rev);
        }
    }

    // -----------------------------------------------------------------------
    // Mark read
    // -----------------------------------------------------------------------

    /// Mark every unread message from `peer` read, in the cache and then in
    /// the store.
    ///
    /// The cache is updated first so the UI reflects the change at once;
    /// only records that already exist in the store are rewritten, in one
    /// batch. Returns the number of messages marked read.
    ///
    /// # Errors
    ///
    /// Propagates load failures and returns [`ChatError::Crypto`] or
    /// [`ChatError::Store`] if the batch write fails. The cache keeps the
    /// read state either way.
    pub async fn mark_conversation_read(&self, peer: &PeerId) -> Result<usize, ChatError> {
        self.ensure_loaded().await?;
        let started = Instant::now();

        let unread: Vec<Message> = match self.cached_conversation(peer)? {
            Some(conversation) => conversation
                .messages()
                .values()
                .filter(|m| m.is_unread())
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        if unread.is_empty() {
            return Ok(0);
        }

        let results = join_all(
            unread
                .iter()
                .map(|m| self.mark_read_locally(peer, &m.message_id)),
        )
        .await;
        let marked = results
            .into_iter()
            .filter(|result| matches!(result, Ok(true)))
            .count();

        let persisted: Vec<Message> = unread.into_iter().filter(|m| m.rev.is_some()).collect();
        if persisted.is_empty() {
            return Ok(marked);
        }

        let crypter = self.store.crypter();
        let docs = slices::map_in_slices(persisted, self.config.ops_per_slice, |message| {
            let record = StoredMessage {
                read: true,
                ..message.to_stored()
            };
            crypter.seal(&record).map(|sealed| EncryptedDoc {
                id: message.message_id.as_str().to_string(),
                rev: message.rev,
                sealed,
            })
        })
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

        let handles = self
            .store
            .bulk_write(Collection::ChatMessages, docs)
            .await
            .inspect_err(|e| {
                tracing::error!(peer = %peer, error = %e, "unable to persist read state");
            })?;
        self.refresh_revisions(peer, &handles);

        tracing::info!(
            peer = %peer,
            marked,
            persisted = handles.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "conversation marked read"
        );
        Ok(marked)
    }

    async fn mark_read_locally(&self, peer: &PeerId, id: &MessageId) -> Result<bool, ChatError> {
        let immediate = {
            let mut state = self.state.lock();
            let current = state
                .cache()?
                .conversation(peer)
                .and_then(|c| c.message(id))
                .filter(|m| m.is_unread())
                .cloned();
            let Some(current) = current else {
                return Ok(false);
            };
            let changes = apply_locked(
                &mut state,
                peer,
                Mutation::Upsert(Message {
                    read: true,
                    ..current
                }),
            )?;
            self.queue_locked(changes)
        };
        self.publish(immediate).await;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Drop all session state: the cache, the in-flight registry, the
    /// active conversation and unpublished changes. In-flight sends are
    /// cancelled.
    pub fn logout(&self) {
        {
            let mut state = self.state.lock();
            *state = SessionState::default();
        }
        self.session.send_modify(|generation| *generation = generation.wrapping_add(1));
        self.coalescer.discard_pending();
        tracing::info!("chat session cleared");
    }

    /// Call [`logout`](Self::logout) whenever `events` delivers
    /// [`SessionEvent::Logout`].
    ///
    /// The listener stops when the sending side of `events` is dropped.
    pub fn watch_session(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> tokio::task::JoinHandle<()>
    where
        S: 'static,
        T: 'static,
    {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Logout) => engine.logout(),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Only logout is ever broadcast, so a gap means one was missed.
                        tracing::warn!(missed, "session events lagged, clearing session");
                        engine.logout();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub(crate) fn session_watch(&self) -> watch::Receiver<u64> {
        self.session.subscribe()
    }

    /// Whether a send of `id` to `peer` is in flight.
    pub fn is_in_flight(&self, peer: &PeerId, id: &MessageId) -> bool {
        self.state.lock().is_in_flight(peer, id)
    }

    /// Number of sends in flight across all peers.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.values().map(HashSet::len).sum()
    }
}

struct LoadedRecord {
    record: StoredMessage,
    rev: Option<crate::store::Revision>,
    unsent: bool,
}

pub(crate) fn validate_id(id: &MessageId) -> Result<(), ChatError> {
    if id.as_str().is_empty() {
        return Err(ChatError::InvalidMessage("message id must not be empty".into()));
    }
    Ok(())
}

/// Apply `mutation` to the cache and compute the notifications it causes.
fn apply_locked(state: &mut SessionState, peer: &PeerId, mutation: Mutation) -> Result<Changes, ChatError> {
    let active = state.active.peer_id.as_ref() == Some(peer);
    let cache = state.cache.as_mut().ok_or(ChatError::CacheNotLoaded)?;

    let (before_unread, before_last) = cache
        .conversation(peer)
        .map_or((None, None), |c| (Some(c.unread()), c.last_message().cloned()));

    let mut changes = Changes::default();
    match mutation {
        Mutation::Upsert(message) => {
            let id = message.message_id.clone();
            let previous = cache.set_message(peer, message);
            let Some(current) = cache.conversation(peer) else {
                return Ok(changes);
            };
            changes.conversation = summary_change(peer, before_unread, before_last.as_ref(), current);

            if active && let Some(updated) = current.message(&id) {
                let inserted = previous.is_none();
                let moved = previous.as_ref().is_some_and(|p| p.timestamp != updated.timestamp);
                let read_flip = previous.as_ref().is_some_and(|p| {
                    p.read != updated.read
                        && Message {
                            read: updated.read,
                            ..p.clone()
                        } == *updated
                });
                changes.active = Some(ActiveMessagesChange {
                    messages: BTreeMap::from([(id, updated.clone())]),
                    removed: Vec::new(),
                    sorted: (inserted || moved).then(|| current.sorted().to_vec()),
                    unread_update: read_flip,
                });
            }
        }
        Mutation::Remove(id) => {
            if cache.remove_message(peer, &id).is_none() {
                return Ok(changes);
            }
            let current = cache.conversation(peer);
            changes.conversation = match current {
                None => Some(ConversationChange::removed(peer.clone())),
                Some(current) => summary_change(peer, before_unread, before_last.as_ref(), current),
            };
            if active {
                changes.active = Some(ActiveMessagesChange {
                    removed: vec![id],
                    sorted: Some(current.map(|c| c.sorted().to_vec()).unwrap_or_default()),
                    ..ActiveMessagesChange::default()
                });
            }
        }
    }
    Ok(changes)
}

fn summary_change(
    peer: &PeerId,
    before_unread: Option<usize>,
    before_last: Option<&Message>,
    current: &Conversation,
) -> Option<ConversationChange> {
    let mut data = ConversationData::default();
    if before_unread != Some(current.unread()) {
        data.unread = Some(current.unread());
    }
    let last = current.last_message();
    if before_last != last {
        data.last_message = last.cloned();
    }
    (!data.is_empty()).then(|| ConversationChange {
        peer_id: peer.clone(),
        removed: false,
        data,
    })
}
