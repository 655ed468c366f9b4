//! Configuration for the chat engine and the simulation binary.
//!
//! Values are taken from the command line (flags or their `BAZAAR_*`
//! environment variables) first, then from `bazaar-chat/config.toml` under
//! the platform config directory, then from built-in defaults. Engine
//! tuning lives only in the `[chat]` table.
//!
//! The default file may be absent. A file named with `--config` must exist.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Config file could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists (or was named explicitly) but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    ReadFile {
        /// File that was read.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("invalid config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// On-disk shape; every key is optional
// ---------------------------------------------------------------------------

/// Whole config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    chat: ChatFileConfig,
    simulation: SimulationFileConfig,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    coalesce_window_ms: Option<u64>,
    ops_per_slice: Option<usize>,
    event_buffer: Option<usize>,
    corrupt_records: Option<CorruptRecordPolicy>,
}

/// `[simulation]` section of the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SimulationFileConfig {
    local_peer: Option<String>,
    remote_peer: Option<String>,
    messages: Option<usize>,
    json: Option<bool>,
}

// ---------------------------------------------------------------------------
// Resolved values
// ---------------------------------------------------------------------------

/// What the bulk load does with a record that cannot be decrypted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptRecordPolicy {
    /// Log the record and leave it out of the cache.
    #[default]
    Skip,
    /// Fail the whole load.
    Abort,
}

/// Tuning of a [`ChatSyncEngine`](crate::chat::ChatSyncEngine).
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Quiet period before a burst of changes is published.
    pub coalesce_window: Duration,
    /// Records encrypted or decrypted per scheduling slice in bulk work.
    pub ops_per_slice: usize,
    /// Capacity of the change notification channel.
    pub event_buffer: usize,
    /// Handling of undecryptable records during the initial load.
    pub corrupt_records: CorruptRecordPolicy,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(100),
            ops_per_slice: 25,
            event_buffer: 256,
            corrupt_records: CorruptRecordPolicy::Skip,
        }
    }
}

/// Fully resolved configuration of the simulation binary.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Engine tuning.
    pub chat: ChatConfig,
    /// Identity of the local (buyer) peer.
    pub local_peer: String,
    /// Identity of the remote (vendor) peer.
    pub remote_peer: String,
    /// Number of messages the remote peer sends.
    pub messages: usize,
    /// Print change notifications as JSON lines.
    pub json: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chat: ChatConfig::default(),
            local_peer: "QmBuyer".to_string(),
            remote_peer: "QmVendor".to_string(),
            messages: 1400,
            json: false,
        }
    }
}

impl ClientConfig {
    /// Read the config file `cli` points at (or the default one) and
    /// overlay the command line on it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReadFile`] for an unreadable file, including
    /// a missing `--config` file, and [`ConfigError::ParseToml`] for bad
    /// contents.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => read_config(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => read_config(&path)?,
                _ => ConfigFile::default(),
            },
        };
        Ok(Self::resolve(cli, &file))
    }

    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            chat: ChatConfig {
                coalesce_window: file
                    .chat
                    .coalesce_window_ms
                    .map_or(defaults.chat.coalesce_window, Duration::from_millis),
                ops_per_slice: file
                    .chat
                    .ops_per_slice
                    .unwrap_or(defaults.chat.ops_per_slice)
                    .max(1),
                event_buffer: file
                    .chat
                    .event_buffer
                    .unwrap_or(defaults.chat.event_buffer)
                    .max(1),
                corrupt_records: file
                    .chat
                    .corrupt_records
                    .unwrap_or(defaults.chat.corrupt_records),
            },
            local_peer: cli
                .local_peer
                .clone()
                .or_else(|| file.simulation.local_peer.clone())
                .unwrap_or(defaults.local_peer),
            remote_peer: cli
                .remote_peer
                .clone()
                .or_else(|| file.simulation.remote_peer.clone())
                .unwrap_or(defaults.remote_peer),
            messages: cli
                .messages
                .or(file.simulation.messages)
                .unwrap_or(defaults.messages),
            json: cli.json || file.simulation.json.unwrap_or(defaults.json),
        }
    }
}

/// Command line of the `bazaar-chat` binary.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Marketplace chat synchronization simulator")]
pub struct CliArgs {
    /// Identity of the local peer.
    #[arg(long, env = "BAZAAR_LOCAL_PEER")]
    pub local_peer: Option<String>,

    /// Identity of the remote peer that floods the local one.
    #[arg(long, env = "BAZAAR_REMOTE_PEER")]
    pub remote_peer: Option<String>,

    /// Number of messages the remote peer sends.
    #[arg(short, long)]
    pub messages: Option<usize>,

    /// Print every change notification as a JSON line.
    #[arg(long)]
    pub json: bool,

    /// Config file to use instead of the default location.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Tracing filter directive, e.g. `debug` or `bazaar_chat=trace`.
    #[arg(long, default_value = "info", env = "BAZAAR_CHAT_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("bazaar-chat").join("config.toml"))
}

fn read_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}
