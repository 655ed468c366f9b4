//! Encrypted message persistence.
//!
//! Defines the [`MessageStore`] trait the chat engine persists through and
//! the record types it exchanges. Two collections exist: sent and received
//! messages live in [`Collection::ChatMessages`], outgoing messages that
//! have not been confirmed sent live in [`Collection::UnsentChatMessages`].
//!
//! Stores hold [`SealedRecord`]s only. `insert` seals on the way in;
//! `list_all` hands back [`EncryptedDoc`]s which the caller opens with the
//! store's [`Crypter`], so large loads can be decrypted incrementally.

pub mod memory;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bazaar_chat_proto::message::MessageId;

use crate::crypto::{CryptoError, Crypter, SealedRecord};
use crate::transport::PeerId;

/// Prefix of store-internal metadata documents that are not messages.
const META_PREFIX: &str = "_design";

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying storage is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A write operation failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The document changed since the caller last read it.
    #[error("revision conflict for document {0}")]
    Conflict(String),

    /// The requested document was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The record could not be sealed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Named collection of message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    /// Sent and received messages.
    ChatMessages,
    /// Outgoing messages awaiting confirmation of a successful send.
    UnsentChatMessages,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChatMessages => write!(f, "chatmessage"),
            Self::UnsentChatMessages => write!(f, "unsentchatmessages"),
        }
    }
}

/// Store-assigned revision marker of a persisted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Revision(u64);

impl Revision {
    /// Wrap a raw revision number.
    #[must_use]
    pub const fn new(rev: u64) -> Self {
        Self(rev)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plaintext shape of a persisted message.
///
/// Delivery flags (`sent`, `sending`) are not persisted; they are derived
/// from which collection a record lives in when the cache is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Content-derived message identifier (also the document id).
    pub message_id: MessageId,
    /// The remote peer of the conversation.
    pub peer_id: PeerId,
    /// Subject the message belongs to.
    pub subject: String,
    /// Message text.
    pub body: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Whether the local user authored the message.
    pub outgoing: bool,
    /// Whether the local user has read the message.
    pub read: bool,
}

/// An encrypted document as returned by [`MessageStore::list_all`].
#[derive(Debug, Clone)]
pub struct EncryptedDoc {
    /// Document id.
    pub id: String,
    /// Current revision; `None` for a document that does not exist yet.
    pub rev: Option<Revision>,
    /// The sealed record.
    pub sealed: SealedRecord,
}

impl EncryptedDoc {
    /// Open this document with `crypter`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the document cannot be decrypted.
    pub fn decrypt<C: Crypter + ?Sized>(&self, crypter: &C) -> Result<StoredMessage, CryptoError> {
        crypter.open(&self.sealed)
    }

    /// Whether this is a store metadata document rather than a message.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        self.id.starts_with(META_PREFIX)
    }
}

/// Reference to a persisted document, returned by writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    /// Collection the document lives in.
    pub collection: Collection,
    /// Document id.
    pub id: String,
    /// Revision written; `None` removes regardless of revision.
    pub rev: Option<Revision>,
}

impl RecordHandle {
    /// Handle to the record of `message_id` in `collection`, at any revision.
    #[must_use]
    pub fn for_message(collection: Collection, message_id: &MessageId) -> Self {
        Self {
            collection,
            id: message_id.as_str().to_string(),
            rev: None,
        }
    }
}

/// Encrypted persistence for chat messages.
pub trait MessageStore: Send + Sync {
    /// Crypter bound to this store.
    type Crypter: Crypter;

    /// The crypter records are sealed with.
    fn crypter(&self) -> &Self::Crypter;

    /// Every document in `collection`, still encrypted.
    fn list_all(
        &self,
        collection: Collection,
    ) -> impl std::future::Future<Output = Result<Vec<EncryptedDoc>, StoreError>> + Send;

    /// Seal and write `record`, replacing any document with the same id.
    fn insert(
        &self,
        collection: Collection,
        record: &StoredMessage,
    ) -> impl std::future::Future<Output = Result<RecordHandle, StoreError>> + Send;

    /// Delete the document `handle` refers to.
    fn remove(
        &self,
        handle: &RecordHandle,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Write pre-sealed documents in one batch.
    ///
    /// A document carrying a `rev` must match the stored revision or the
    /// whole batch is rejected with [`StoreError::Conflict`].
    fn bulk_write(
        &self,
        collection: Collection,
        docs: Vec<EncryptedDoc>,
    ) -> impl std::future::Future<Output = Result<Vec<RecordHandle>, StoreError>> + Send;
}
