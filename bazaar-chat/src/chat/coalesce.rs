//! Trailing-edge debouncing of change notifications.
//!
//! Bulk operations such as marking a long conversation read produce one
//! change per message. Publishing each of them would flood the UI, so
//! changes are parked per key and merged until the key has been quiet for
//! the configured window; only then is the merged change published.
//!
//! Each key moves through three states:
//!
//! * **idle**: nothing parked, the key is absent from the [`Debouncer`];
//! * **pending**: a merged payload and a deadline; every new change is
//!   merged in and pushes the deadline out by a full window;
//! * **fired**: the deadline passed, the payload was taken by
//!   [`Debouncer::take_due`] and the key is idle again.
//!
//! [`Debouncer`] is the pure state machine, driven by explicit instants so
//! it can be tested without a clock. [`Coalescer`] owns one debouncer per
//! notification kind and a background task that publishes due payloads.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::events::{ActiveMessagesChange, ChatEvent, Coalesce, ConversationChange};
use crate::transport::PeerId;

#[derive(Debug)]
struct Pending<P> {
    deadline: Instant,
    payload: P,
}

/// Per-key trailing-edge debouncer.
#[derive(Debug)]
pub struct Debouncer<K, P> {
    window: Duration,
    pending: HashMap<K, Pending<P>>,
}

impl<K: Eq + Hash + Clone, P: Coalesce> Debouncer<K, P> {
    /// Create a debouncer with a quiet window of `window`.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Park `payload` under `key`, merging with anything already pending.
    ///
    /// Returns the new deadline of `key`.
    pub fn push(&mut self, key: K, payload: P, now: Instant) -> Instant {
        let deadline = now + self.window;
        match self.pending.entry(key) {
            Entry::Occupied(mut entry) => {
                let pending = entry.get_mut();
                pending.payload.coalesce(payload);
                pending.deadline = deadline;
            }
            Entry::Vacant(entry) => {
                entry.insert(Pending { deadline, payload });
            }
        }
        deadline
    }

    /// Earliest deadline of any pending key.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Remove and return every payload whose deadline is at or before `now`,
    /// earliest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, P)> {
        let mut due: Vec<(Instant, K)> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(key, p)| (p.deadline, key.clone()))
            .collect();
        due.sort_by_key(|(deadline, _)| *deadline);

        due.into_iter()
            .filter_map(|(_, key)| {
                let pending = self.pending.remove(&key)?;
                Some((key, pending.payload))
            })
            .collect()
    }

    /// Take the payload pending under `key` ahead of its deadline.
    pub fn take(&mut self, key: &K) -> Option<P> {
        self.pending.remove(key).map(|p| p.payload)
    }

    /// Whether `key` has a pending payload.
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    /// Number of pending keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending payload.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

struct Channels {
    conversations: Debouncer<PeerId, ConversationChange>,
    active: Debouncer<(), ActiveMessagesChange>,
}

impl Channels {
    fn next_deadline(&self) -> Option<Instant> {
        match (self.conversations.next_deadline(), self.active.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn take_due(&mut self, now: Instant) -> Vec<ChatEvent> {
        let conversations = self
            .conversations
            .take_due(now)
            .into_iter()
            .map(|(_, change)| ChatEvent::ConversationChanged(change));
        let active = self
            .active
            .take_due(now)
            .into_iter()
            .map(|((), change)| ChatEvent::ActiveMessagesChanged(change));
        conversations.chain(active).collect()
    }
}

struct Shared {
    channels: Mutex<Channels>,
    wake: Notify,
    /// Held while taking payloads and sending them, so events leave in the
    /// order they were taken.
    publish: tokio::sync::Mutex<()>,
    sink: mpsc::Sender<ChatEvent>,
}

/// Publishes change notifications, debouncing the ones that arrive in bursts.
///
/// Conversation changes are always debounced per peer. Active-conversation
/// changes are debounced only when they are pure read-flag flips; anything
/// else is published immediately.
pub struct Coalescer {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl Coalescer {
    /// Start the publishing task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(window: Duration, sink: mpsc::Sender<ChatEvent>) -> Self {
        let shared = Arc::new(Shared {
            channels: Mutex::new(Channels {
                conversations: Debouncer::new(window),
                active: Debouncer::new(window),
            }),
            wake: Notify::new(),
            publish: tokio::sync::Mutex::new(()),
            sink,
        });
        let task = tokio::spawn(run(Arc::clone(&shared)));
        Self { shared, task }
    }

    /// Queue a conversation change for `change.peer_id`.
    pub fn conversation_changed(&self, change: ConversationChange) {
        let key = change.peer_id.clone();
        self.shared
            .channels
            .lock()
            .conversations
            .push(key, change, Instant::now());
        self.shared.wake.notify_one();
    }

    /// Queue a read-flag flip of active-conversation messages.
    pub fn read_flipped(&self, change: ActiveMessagesChange) {
        self.shared
            .channels
            .lock()
            .active
            .push((), change, Instant::now());
        self.shared.wake.notify_one();
    }

    /// Publish a structural change of the active conversation at once.
    ///
    /// Queued read flips go out first, so a flip can never arrive after a
    /// change that removed or replaced its message.
    pub async fn active_changed(&self, change: ActiveMessagesChange) {
        let _order = self.shared.publish.lock().await;
        let flushed = self.shared.channels.lock().active.take(&());
        let events = flushed
            .into_iter()
            .chain(std::iter::once(change))
            .map(ChatEvent::ActiveMessagesChanged);
        for event in events {
            if self.shared.sink.send(event).await.is_err() {
                tracing::debug!("event receiver dropped, active change not delivered");
                return;
            }
        }
    }

    /// Drop everything still waiting to be published.
    pub fn discard_pending(&self) {
        let mut channels = self.shared.channels.lock();
        channels.conversations.clear();
        channels.active.clear();
    }

    /// Number of changes waiting to be published.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let channels = self.shared.channels.lock();
        channels.conversations.len() + channels.active.len()
    }
}

impl Drop for Coalescer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        let next = shared.channels.lock().next_deadline();
        match next {
            None => {
                shared.wake.notified().await;
                continue;
            }
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {}
                    () = shared.wake.notified() => continue,
                }
            }
        }

        let _order = shared.publish.lock().await;
        let due = shared.channels.lock().take_due(Instant::now());
        for event in due {
            if shared.sink.send(event).await.is_err() {
                tracing::debug!("event receiver dropped, stopping coalescer");
                return;
            }
        }
    }
}
