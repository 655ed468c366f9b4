//! At-rest encryption for persisted chat records.
//!
//! Every record written to a [`MessageStore`](crate::store::MessageStore)
//! passes through a [`Crypter`] first; stores only ever hold
//! [`SealedRecord`]s. Bulk operations (initial load, batch mark-read) call
//! the crypter directly so the work can be sliced across scheduler turns.

pub mod aead;

use crate::store::StoredMessage;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The record could not be serialized before encryption.
    #[error("record encoding failed: {0}")]
    Encoding(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (corrupted ciphertext, wrong key, or tampered data).
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Ciphertext of one persisted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    /// Nonce used for this record.
    pub nonce: [u8; aead::NONCE_SIZE],
    /// Ciphertext including the authentication tag.
    pub ciphertext: Vec<u8>,
}

/// Encrypts and decrypts persisted chat records.
pub trait Crypter: Send + Sync {
    /// Encrypt a record for storage.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the record cannot be encoded or encrypted.
    fn seal(&self, record: &StoredMessage) -> Result<SealedRecord, CryptoError>;

    /// Decrypt a stored record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] for tampered or foreign
    /// ciphertext, or [`CryptoError::Encoding`] if the plaintext is not a
    /// valid record.
    fn open(&self, sealed: &SealedRecord) -> Result<StoredMessage, CryptoError>;
}
