//! AES-256-GCM record crypter.
//!
//! Records are postcard-encoded and sealed under a random 96-bit nonce.
//! Random nonces are safe up to roughly 2^32 records per key.

use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit};
use zeroize::ZeroizeOnDrop;

use super::{CryptoError, Crypter, SealedRecord};
use crate::store::StoredMessage;

/// Size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Size of the store key in bytes.
pub const KEY_SIZE: usize = 32;

/// Symmetric key protecting one user's message database.
///
/// Zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct StoreKey([u8; KEY_SIZE]);

impl StoreKey {
    /// Generate a fresh random key.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Wrap existing key material.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }
}

/// [`Crypter`] backed by AES-256-GCM.
pub struct AesGcmCrypter {
    key: StoreKey,
}

impl AesGcmCrypter {
    /// Create a crypter using `key`.
    #[must_use]
    pub const fn new(key: StoreKey) -> Self {
        Self { key }
    }

    fn cipher(&self) -> Result<Aes256Gcm, String> {
        Aes256Gcm::new_from_slice(&self.key.0).map_err(|e| format!("invalid key: {e}"))
    }
}

impl Crypter for AesGcmCrypter {
    fn seal(&self, record: &StoredMessage) -> Result<SealedRecord, CryptoError> {
        let plaintext =
            postcard::to_allocvec(record).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let cipher = self.cipher().map_err(CryptoError::EncryptionFailed)?;

        let nonce: [u8; NONCE_SIZE] = rand::random();
        let ciphertext = cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        Ok(SealedRecord { nonce, ciphertext })
    }

    fn open(&self, sealed: &SealedRecord) -> Result<StoredMessage, CryptoError> {
        let cipher = self.cipher().map_err(CryptoError::DecryptionFailed)?;
        let plaintext = cipher
            .decrypt(
                aes_gcm::Nonce::from_slice(&sealed.nonce),
                sealed.ciphertext.as_slice(),
            )
            .map_err(|_| {
                CryptoError::DecryptionFailed("authentication tag mismatch".to_string())
            })?;

        postcard::from_bytes(&plaintext).map_err(|e| CryptoError::Encoding(e.to_string()))
    }
}
