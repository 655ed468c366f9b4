//! Integration tests for cache synchronization and change notification.
//!
//! Drives a [`ChatSyncEngine`] over the in-memory encrypted store and the
//! loopback transport, checking:
//! 1. Loading derives delivery state and applies the corrupt-record policy.
//! 2. Marking a conversation read publishes exactly one conversation change
//!    whatever the number of messages.
//! 3. Typing and read signals are neither stored nor published.
//! 4. Logout drops the session and the next read reloads from the store.
//! 5. Concurrent first reads share one load, and concurrent deliveries of
//!    one message leave the newest revision cached.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bazaar_chat::chat::{ChatError, ChatEvent, ChatSyncEngine, Message, SessionEvent};
use bazaar_chat::config::{ChatConfig, CorruptRecordPolicy};
use bazaar_chat::crypto::aead::{AesGcmCrypter, StoreKey};
use bazaar_chat::crypto::{Crypter, SealedRecord};
use bazaar_chat::store::memory::InMemoryStore;
use bazaar_chat::store::{
    Collection, EncryptedDoc, MessageStore, RecordHandle, StoreError, StoredMessage,
};
use bazaar_chat::transport::PeerId;
use bazaar_chat::transport::loopback::LoopbackTransport;

use bazaar_chat_proto::codec;
use bazaar_chat_proto::message::{
    ChatFlag, ChatPayload, DirectMessage, MessageId, MessageType, WireTimestamp,
};

use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc};

type Engine = ChatSyncEngine<InMemoryStore<AesGcmCrypter>, LoopbackTransport>;

const WINDOW: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn vendor() -> PeerId {
    PeerId::new("QmVendor")
}

fn buyer() -> PeerId {
    PeerId::new("QmBuyer")
}

fn create_engine(config: ChatConfig) -> (Engine, mpsc::Receiver<ChatEvent>) {
    let (local, _remote) = LoopbackTransport::create_pair(buyer(), vendor(), 16);
    let store = InMemoryStore::new(AesGcmCrypter::new(StoreKey::generate()));
    ChatSyncEngine::new(store, local, config)
}

fn at(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap()
}

fn inbound(millis: i64) -> Message {
    let timestamp = at(millis);
    Message {
        message_id: MessageId::derive("", &timestamp),
        peer_id: vendor(),
        subject: String::new(),
        body: format!("message at {millis}"),
        timestamp,
        outgoing: false,
        read: false,
        sending: false,
        sent: true,
        rev: None,
    }
}

fn direct(millis: i64, flag: ChatFlag) -> DirectMessage {
    let timestamp = at(millis);
    let payload = ChatPayload {
        message_id: MessageId::derive("", &timestamp),
        subject: String::new(),
        message: format!("message at {millis}"),
        timestamp: WireTimestamp::from(timestamp),
        flag,
    };
    DirectMessage {
        message_type: MessageType::Chat,
        peer_id: vendor().as_str().to_string(),
        payload: codec::encode_payload(&payload).unwrap(),
    }
}

/// Let every debounce window expire, then collect what was published.
async fn drain(events: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
    tokio::time::sleep(WINDOW * 3).await;
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn conversation_changes(events: &[ChatEvent]) -> Vec<&bazaar_chat::chat::ConversationChange> {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::ConversationChanged(change) => Some(change),
            ChatEvent::ActiveMessagesChanged(_) => None,
        })
        .collect()
}

/// Receive `n` inbound messages, drain their notifications, mark the
/// conversation read and return what that published.
async fn mark_read_events(n: i64) -> Vec<ChatEvent> {
    let (engine, mut events) = create_engine(ChatConfig::default());
    for i in 0..n {
        engine
            .handle_direct_message(direct(i, ChatFlag::Message))
            .await
            .unwrap();
    }
    let _ = drain(&mut events).await;
    let unread = usize::try_from(n).unwrap();
    assert_eq!(
        engine.cached_conversation(&vendor()).unwrap().unwrap().unread(),
        unread
    );

    let marked = engine.mark_conversation_read(&vendor()).await.unwrap();
    assert_eq!(marked, unread);
    drain(&mut events).await
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn two_message_scenario() {
    let (engine, mut events) = create_engine(ChatConfig::default());
    engine.ensure_loaded().await.unwrap();
    let m1 = inbound(1);
    let m2 = inbound(2);

    engine.set_message(&vendor(), m1.clone()).await.unwrap();
    let conversation = engine.cached_conversation(&vendor()).unwrap().unwrap();
    assert_eq!(conversation.unread(), 1);
    assert_eq!(conversation.sorted(), &[m1.message_id.clone()]);

    engine.set_message(&vendor(), m2.clone()).await.unwrap();
    let conversation = engine.cached_conversation(&vendor()).unwrap().unwrap();
    assert_eq!(conversation.unread(), 2);
    assert_eq!(
        conversation.sorted(),
        &[m1.message_id.clone(), m2.message_id.clone()]
    );

    let published = drain(&mut events).await;
    let changes = conversation_changes(&published);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].data.unread, Some(2));

    engine.mark_conversation_read(&vendor()).await.unwrap();
    let published = drain(&mut events).await;
    let changes = conversation_changes(&published);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].peer_id, vendor());
    assert_eq!(changes[0].data.unread, Some(0));
    assert_eq!(
        engine.cached_conversation(&vendor()).unwrap().unwrap().unread(),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn mark_read_publishes_one_change_for_one_message() {
    let published = mark_read_events(1).await;
    assert_eq!(published.len(), 1);
    let changes = conversation_changes(&published);
    assert_eq!(changes[0].data.unread, Some(0));
}

#[tokio::test(start_paused = true)]
async fn mark_read_publishes_one_change_for_1400_messages() {
    let published = mark_read_events(1400).await;
    assert_eq!(published.len(), 1);
    let changes = conversation_changes(&published);
    assert_eq!(changes[0].data.unread, Some(0));
}

#[tokio::test(start_paused = true)]
async fn mark_read_persists_every_stored_message() {
    let (engine, _events) = create_engine(ChatConfig::default());
    let mut ids = Vec::new();
    for i in 0..60 {
        let id = engine
            .handle_direct_message(direct(i, ChatFlag::Message))
            .await
            .unwrap()
            .unwrap();
        ids.push(id);
    }
    engine.mark_conversation_read(&vendor()).await.unwrap();

    for id in &ids {
        let stored = engine
            .store()
            .get(Collection::ChatMessages, id.as_str())
            .unwrap();
        assert!(stored.read, "{id} not persisted as read");
    }

    // Revisions were refreshed, so a second pass does not conflict.
    assert_eq!(engine.mark_conversation_read(&vendor()).await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn signal_payloads_store_and_publish_nothing() {
    let (engine, mut events) = create_engine(ChatConfig::default());
    engine.ensure_loaded().await.unwrap();

    for flag in [ChatFlag::Typing, ChatFlag::Read] {
        let handled = engine
            .handle_direct_message(direct(1, flag))
            .await
            .unwrap();
        assert!(handled.is_none());
    }

    assert!(engine.store().is_empty(Collection::ChatMessages));
    assert!(engine.cached_conversation(&vendor()).unwrap().is_none());
    assert!(drain(&mut events).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn open_conversation_sees_inbound_as_read() {
    let (engine, mut events) = create_engine(ChatConfig::default());
    engine.activate_conversation(&vendor()).await.unwrap();
    engine.set_chat_open(true);

    let id = engine
        .handle_direct_message(direct(1, ChatFlag::Message))
        .await
        .unwrap()
        .unwrap();

    let published = drain(&mut events).await;
    let active = published.iter().find_map(|event| match event {
        ChatEvent::ActiveMessagesChanged(change) => Some(change),
        ChatEvent::ConversationChanged(_) => None,
    });
    let active = active.unwrap();
    assert!(active.messages[&id].read);
    assert_eq!(active.sorted, Some(vec![id.clone()]));

    let changes = conversation_changes(&published);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].data.unread, Some(0));
}

#[tokio::test(start_paused = true)]
async fn load_skips_meta_and_corrupt_records() {
    let (engine, _events) = create_engine(ChatConfig::default());
    let good = inbound(1);
    engine
        .store()
        .insert(Collection::ChatMessages, &good.to_stored())
        .await
        .unwrap();

    let meta = EncryptedDoc {
        id: "_design/chat".to_string(),
        rev: None,
        sealed: engine.store().crypter().seal(&inbound(2).to_stored()).unwrap(),
    };
    let corrupt = EncryptedDoc {
        id: "QmCorrupt".to_string(),
        rev: None,
        sealed: SealedRecord {
            nonce: [7; 12],
            ciphertext: vec![1, 2, 3, 4],
        },
    };
    engine
        .store()
        .bulk_write(Collection::ChatMessages, vec![meta, corrupt])
        .await
        .unwrap();

    let data = engine.chat_data().await.unwrap();
    assert_eq!(data.len(), 1);
    let conversation = &data[&vendor()];
    assert_eq!(conversation.len(), 1);
    assert!(conversation.message(&good.message_id).is_some());
}

#[tokio::test(start_paused = true)]
async fn load_aborts_on_corrupt_record_when_configured() {
    let config = ChatConfig {
        corrupt_records: CorruptRecordPolicy::Abort,
        ..ChatConfig::default()
    };
    let (engine, _events) = create_engine(config);
    let corrupt = EncryptedDoc {
        id: "QmCorrupt".to_string(),
        rev: None,
        sealed: SealedRecord {
            nonce: [7; 12],
            ciphertext: vec![1, 2, 3, 4],
        },
    };
    engine
        .store()
        .bulk_write(Collection::UnsentChatMessages, vec![corrupt])
        .await
        .unwrap();

    let result = engine.chat_data().await;
    assert!(matches!(result, Err(ChatError::Load { ref id, .. }) if id == "QmCorrupt"));
    assert!(!engine.is_loaded());
}

#[tokio::test(start_paused = true)]
async fn conversation_list_orders_by_latest_activity() {
    let (engine, _events) = create_engine(ChatConfig::default());
    engine.ensure_loaded().await.unwrap();
    let other = PeerId::new("QmOther");

    engine.set_message(&vendor(), inbound(1)).await.unwrap();
    let mut newer = inbound(5);
    newer.peer_id = other.clone();
    engine.set_message(&other, newer.clone()).await.unwrap();

    let list = engine.conversations().await.unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].peer_id, other);
    assert_eq!(list[0].last_message.as_ref(), Some(&newer));
    assert_eq!(list[1].peer_id, vendor());
    assert_eq!(list[1].unread, 1);

    let messages = engine.conversation_messages(&vendor()).await.unwrap();
    assert_eq!(messages.iter().count(), 1);
    let none = engine
        .conversation_messages(&PeerId::new("QmNobody"))
        .await
        .unwrap();
    assert!(none.sorted.is_empty());
}

#[tokio::test(start_paused = true)]
async fn logout_then_reload_restores_persisted_state() {
    let (engine, _events) = create_engine(ChatConfig::default());
    let engine = Arc::new(engine);
    let (session_tx, session_rx) = broadcast::channel(1);
    let listener = engine.watch_session(session_rx);

    engine
        .handle_direct_message(direct(1, ChatFlag::Message))
        .await
        .unwrap();
    // Cache-only change, lost on logout.
    engine.set_message(&vendor(), inbound(2)).await.unwrap();
    assert_eq!(engine.cached_conversation(&vendor()).unwrap().unwrap().len(), 2);

    session_tx.send(SessionEvent::Logout).unwrap();
    drop(session_tx);
    listener.await.unwrap();
    assert!(!engine.is_loaded());
    assert!(matches!(
        engine.set_message(&vendor(), inbound(3)).await,
        Err(ChatError::CacheNotLoaded)
    ));

    let reloaded = engine.conversation(&vendor()).await.unwrap().unwrap();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded.unread(), 1);
}

#[tokio::test]
async fn two_peers_exchange_messages() {
    let (buyer_link, vendor_link) = LoopbackTransport::create_pair(buyer(), vendor(), 16);
    let (buyer_engine, _buyer_events) = ChatSyncEngine::new(
        InMemoryStore::new(AesGcmCrypter::new(StoreKey::generate())),
        buyer_link,
        ChatConfig::default(),
    );
    let (vendor_engine, _vendor_events) = ChatSyncEngine::new(
        InMemoryStore::new(AesGcmCrypter::new(StoreKey::generate())),
        vendor_link,
        ChatConfig::default(),
    );

    let id = vendor_engine
        .send_message(&buyer(), "", "your order shipped")
        .await
        .unwrap();
    let direct = buyer_engine.transport().recv().await.unwrap();
    let received = buyer_engine.handle_direct_message(direct).await.unwrap();
    assert_eq!(received, Some(id.clone()));

    let conversation = buyer_engine.conversation(&vendor()).await.unwrap().unwrap();
    let message = conversation.message(&id).unwrap();
    assert_eq!(message.body, "your order shipped");
    assert!(!message.outgoing);

    let sent = vendor_engine.cached_conversation(&buyer()).unwrap().unwrap();
    assert!(sent.message(&id).unwrap().outgoing);
    assert_eq!(sent.message(&id).unwrap().timestamp, message.timestamp);
}

// ---------------------------------------------------------------------------
// Ordering and concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn read_flip_is_never_published_after_removal() {
    let (engine, mut events) = create_engine(ChatConfig::default());
    engine.activate_conversation(&vendor()).await.unwrap();
    let m1 = inbound(1);
    let m2 = inbound(2);
    engine.set_message(&vendor(), m1.clone()).await.unwrap();
    engine.set_message(&vendor(), m2).await.unwrap();
    let _ = drain(&mut events).await;

    engine
        .set_message(
            &vendor(),
            Message {
                read: true,
                ..m1.clone()
            },
        )
        .await
        .unwrap();
    engine.remove_message(&vendor(), &m1.message_id).await.unwrap();

    let active: Vec<_> = drain(&mut events)
        .await
        .into_iter()
        .filter_map(|event| match event {
            ChatEvent::ActiveMessagesChanged(change) => Some(change),
            ChatEvent::ConversationChanged(_) => None,
        })
        .collect();
    let removal = active
        .iter()
        .position(|change| change.removed.contains(&m1.message_id))
        .unwrap();
    assert_eq!(removal, active.len() - 1);
    assert!(active[..removal].iter().any(|change| change.unread_update));
    assert!(
        engine
            .cached_conversation(&vendor())
            .unwrap()
            .unwrap()
            .message(&m1.message_id)
            .is_none()
    );
}

/// In-memory store that counts listings and holds back the first insert.
struct InstrumentedStore {
    inner: InMemoryStore<AesGcmCrypter>,
    listings: AtomicUsize,
    inserts: AtomicUsize,
}

impl InstrumentedStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(AesGcmCrypter::new(StoreKey::generate())),
            listings: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
        }
    }
}

impl MessageStore for InstrumentedStore {
    type Crypter = AesGcmCrypter;

    fn crypter(&self) -> &AesGcmCrypter {
        self.inner.crypter()
    }

    async fn list_all(&self, collection: Collection) -> Result<Vec<EncryptedDoc>, StoreError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.inner.list_all(collection).await
    }

    async fn insert(
        &self,
        collection: Collection,
        record: &StoredMessage,
    ) -> Result<RecordHandle, StoreError> {
        let handle = self.inner.insert(collection, record).await?;
        let stalls = if self.inserts.fetch_add(1, Ordering::SeqCst) == 0 { 3 } else { 1 };
        for _ in 0..stalls {
            tokio::task::yield_now().await;
        }
        Ok(handle)
    }

    async fn remove(&self, handle: &RecordHandle) -> Result<(), StoreError> {
        self.inner.remove(handle).await
    }

    async fn bulk_write(
        &self,
        collection: Collection,
        docs: Vec<EncryptedDoc>,
    ) -> Result<Vec<RecordHandle>, StoreError> {
        self.inner.bulk_write(collection, docs).await
    }
}

fn instrumented_engine(
    store: InstrumentedStore,
) -> (ChatSyncEngine<InstrumentedStore, LoopbackTransport>, mpsc::Receiver<ChatEvent>) {
    let (local, _remote) = LoopbackTransport::create_pair(buyer(), vendor(), 16);
    ChatSyncEngine::new(store, local, ChatConfig::default())
}

#[tokio::test]
async fn concurrent_first_reads_share_one_load() {
    let store = InstrumentedStore::new();
    store
        .inner
        .insert(Collection::ChatMessages, &inbound(1).to_stored())
        .await
        .unwrap();
    let (engine, _events) = instrumented_engine(store);

    let results = join_all((0..8).map(|_| engine.chat_data())).await;

    assert_eq!(engine.store().listings.load(Ordering::SeqCst), 2);
    let first = results[0].as_ref().unwrap()[&vendor()].clone();
    for result in &results {
        let data = result.as_ref().unwrap();
        assert_eq!(data.len(), 1);
        assert!(Arc::ptr_eq(&data[&vendor()], &first));
    }
}

#[tokio::test]
async fn racing_deliveries_keep_the_newest_revision() {
    let (engine, _events) = instrumented_engine(InstrumentedStore::new());
    engine.ensure_loaded().await.unwrap();
    let message = direct(1, ChatFlag::Message);

    let (first, second) = tokio::join!(
        engine.handle_direct_message(message.clone()),
        engine.handle_direct_message(message),
    );
    let stored = [first.unwrap(), second.unwrap()];
    assert_eq!(stored.iter().filter(|id| id.is_some()).count(), 1);

    let conversation = engine.cached_conversation(&vendor()).unwrap().unwrap();
    assert_eq!(conversation.len(), 1);
    assert_eq!(conversation.unread(), 1);

    // A stale revision would make the batch write conflict.
    assert_eq!(engine.mark_conversation_read(&vendor()).await.unwrap(), 1);
}
