//! `bazaar-chat`: Loopback simulation of two marketplace peers chatting.
//!
//! A vendor floods a buyer with messages over an in-process transport; the
//! buyer then opens the conversation, marks everything read and replies.
//! Each side runs its own [`ChatSyncEngine`] over an encrypted in-memory
//! store. Configuration via CLI flags, environment variables, or config
//! file (`~/.config/bazaar-chat/config.toml`).
//!
//! ```bash
//! # Default run: 1400 messages
//! cargo run --bin bazaar-chat
//!
//! # Smaller run, printing every notification as JSON
//! cargo run --bin bazaar-chat -- --messages 20 --json
//! ```

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;

use bazaar_chat::chat::{ChatError, ChatEvent, ChatSyncEngine, SendError, SessionEvent};
use bazaar_chat::config::{ChatConfig, CliArgs, ClientConfig};
use bazaar_chat::crypto::aead::{AesGcmCrypter, StoreKey};
use bazaar_chat::store::memory::InMemoryStore;
use bazaar_chat::transport::loopback::LoopbackTransport;
use bazaar_chat::transport::{PeerId, TransportError};

type Engine = ChatSyncEngine<InMemoryStore<AesGcmCrypter>, Arc<LoopbackTransport>>;

/// How long to wait for the flood to arrive before giving up.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors that end the simulation.
#[derive(Debug, thiserror::Error)]
enum SimulationError {
    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("only {delivered} of {expected} messages arrived")]
    Undelivered { delivered: usize, expected: usize },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("bazaar-chat simulation starting");

    match run_simulation(&config).await {
        Ok(report) => {
            report.print();
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "simulation failed");
            eprintln!("simulation failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging to `file_path`, or to stderr when none is given.
///
/// The returned guard must be held for the lifetime of the program so
/// buffered log lines are flushed on exit.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let (writer, guard) = match file_path {
        Some(path) => {
            let log_dir = path.parent()?;
            let file_name = path.file_name()?.to_str()?;
            let file_appender = tracing_appender::rolling::never(log_dir, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("BAZAAR_CHAT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_env_filter(env_filter)
        .with_ansi(file_path.is_none())
        .init();

    Some(guard)
}

/// Notification counts observed on the buyer side.
#[derive(Debug, Default)]
struct EventCounts {
    conversation_changes: usize,
    active_changes: usize,
    last_unread: Option<usize>,
}

impl EventCounts {
    fn record(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::ConversationChanged(change) => {
                self.conversation_changes += 1;
                if change.data.unread.is_some() {
                    self.last_unread = change.data.unread;
                }
            }
            ChatEvent::ActiveMessagesChanged(_) => self.active_changes += 1,
        }
    }
}

struct Report {
    sent: usize,
    delivered: usize,
    marked_read: usize,
    flood_elapsed: Duration,
    mark_read_elapsed: Duration,
    events: EventCounts,
}

impl Report {
    fn print(&self) {
        println!("messages sent:         {}", self.sent);
        println!("messages delivered:    {}", self.delivered);
        println!("marked read:           {}", self.marked_read);
        println!("flood took:            {:?}", self.flood_elapsed);
        println!("mark read took:        {:?}", self.mark_read_elapsed);
        println!("conversation changes:  {}", self.events.conversation_changes);
        println!("active changes:        {}", self.events.active_changes);
        if let Some(unread) = self.events.last_unread {
            println!("last published unread: {unread}");
        }
    }
}

fn new_engine(link: Arc<LoopbackTransport>, config: &ChatConfig) -> (Arc<Engine>, mpsc::Receiver<ChatEvent>) {
    let store = InMemoryStore::new(AesGcmCrypter::new(StoreKey::generate()));
    let (engine, events) = ChatSyncEngine::new(store, link, config.clone());
    (Arc::new(engine), events)
}

/// Feed everything arriving on `link` into `engine`.
fn spawn_pump(engine: Arc<Engine>, link: Arc<LoopbackTransport>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match link.recv().await {
                Ok(direct) => {
                    if let Err(e) = engine.handle_direct_message(direct).await {
                        tracing::warn!(error = %e, "inbound message not handled");
                    }
                }
                Err(TransportError::ConnectionClosed) => break,
                Err(e) => tracing::warn!(error = %e, "dropping undecodable frame"),
            }
        }
    })
}

/// Drain `events`, optionally printing each one as a JSON line.
fn spawn_printer(mut events: mpsc::Receiver<ChatEvent>, json: bool) -> JoinHandle<EventCounts> {
    tokio::spawn(async move {
        let mut counts = EventCounts::default();
        while let Some(event) = events.recv().await {
            counts.record(&event);
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "unable to render event"),
                }
            }
        }
        counts
    })
}

async fn wait_for_messages(engine: &Engine, peer: &PeerId, expected: usize) -> Result<usize, SimulationError> {
    let deadline = Instant::now() + DELIVERY_TIMEOUT;
    loop {
        let delivered = engine.conversation(peer).await?.map_or(0, |c| c.len());
        if delivered >= expected {
            return Ok(delivered);
        }
        if Instant::now() >= deadline {
            return Err(SimulationError::Undelivered { delivered, expected });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn run_simulation(config: &ClientConfig) -> Result<Report, SimulationError> {
    let buyer_id = PeerId::new(config.local_peer.as_str());
    let vendor_id = PeerId::new(config.remote_peer.as_str());

    let (buyer_link, vendor_link) = LoopbackTransport::create_pair(buyer_id.clone(), vendor_id.clone(), 64);
    let (buyer_link, vendor_link) = (Arc::new(buyer_link), Arc::new(vendor_link));

    let (buyer, buyer_events) = new_engine(Arc::clone(&buyer_link), &config.chat);
    let (vendor, vendor_events) = new_engine(Arc::clone(&vendor_link), &config.chat);

    let printer = spawn_printer(buyer_events, config.json);
    let vendor_drain = spawn_printer(vendor_events, false);
    let pumps = [
        spawn_pump(Arc::clone(&buyer), buyer_link),
        spawn_pump(Arc::clone(&vendor), vendor_link),
    ];

    let (session_tx, session_rx) = broadcast::channel(1);
    let session = buyer.watch_session(session_rx);

    tracing::info!(messages = config.messages, vendor = %vendor_id, "vendor flooding buyer");
    let started = Instant::now();
    for n in 0..config.messages {
        vendor
            .send_message(&buyer_id, "", &format!("message number {n}"))
            .await?;
    }
    let delivered = wait_for_messages(&buyer, &vendor_id, config.messages).await?;
    let flood_elapsed = started.elapsed();

    buyer.activate_conversation(&vendor_id).await?;
    buyer.set_chat_open(true);
    let started = Instant::now();
    let marked_read = buyer.mark_conversation_read(&vendor_id).await?;
    let mark_read_elapsed = started.elapsed();

    buyer
        .send_message(&vendor_id, "", "thanks, all caught up")
        .await?;
    wait_for_messages(&vendor, &buyer_id, config.messages + 1).await?;

    // Let debounced notifications flush before the session ends.
    tokio::time::sleep(config.chat.coalesce_window * 3).await;

    if session_tx.send(SessionEvent::Logout).is_err() {
        tracing::warn!("session listener already gone");
    }
    drop(session_tx);
    if let Err(e) = session.await {
        tracing::warn!(error = %e, "session listener failed");
    }

    for pump in pumps {
        pump.abort();
    }
    drop(buyer);
    drop(vendor);
    let events = printer.await.unwrap_or_default();
    vendor_drain.abort();

    Ok(Report {
        sent: config.messages,
        delivered,
        marked_read,
        flood_elapsed,
        mark_read_elapsed,
        events,
    })
}
