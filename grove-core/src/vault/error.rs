//! Error types for the key vault.
//!
//! No variant ever carries key material or the passphrase. Callers decide
//! whether to retry; a wrong passphrase is a user decision, not a transient
//! failure.

use thiserror::Error;

/// Errors that can occur during vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The supplied secret or public key is not valid key material.
    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// No vault record exists for the public key.
    #[error("No vault found for public key {0}")]
    VaultNotFound(String),

    /// Authenticated decryption failed (wrong passphrase or corrupted record).
    #[error("Vault decryption failed")]
    DecryptionFailed,

    /// The decrypted key does not belong to the requested public key.
    #[error("Decrypted key does not match public key {0}")]
    KeyMismatch(String),

    /// No key material is resident.
    #[error("Vault is locked")]
    Locked,

    /// The event to sign names a different author than the vault's key.
    #[error("Event author {event} does not match vault key {vault}")]
    AuthorMismatch {
        /// Author on the unsigned event.
        event: String,
        /// Public key held by the vault.
        vault: String,
    },

    /// A key could not be encoded as NIP-19 bech32.
    #[error("Bech32 encoding error: {0}")]
    Bech32(String),

    /// Encryption or signing primitive failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Key-value store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Vault configuration is unusable.
    #[error("Invalid vault configuration: {0}")]
    Config(String),
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
