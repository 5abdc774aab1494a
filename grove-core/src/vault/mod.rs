//! Local key vault.
//!
//! The vault keeps the user's signing key encrypted at rest and resident in
//! memory only while unlocked.
//!
//! # Security Model
//!
//! - **Portable records**: the PBKDF2 salt is the public key, so a record
//!   opens anywhere given the public key and passphrase
//! - **Fail-closed**: AES-GCM authentication failure yields no plaintext
//! - **No leakage**: key material is zeroized on drop and never appears in
//!   logs, errors or `Debug` output
//!
//! ```text
//! passphrase ──PBKDF2(salt = pubkey)──► AES key ──► KeyValueStore
//!                                                    "key-info-…" → nonce ‖ ct
//! ```

mod cipher;
mod error;
mod key_vault;
mod keypair;
mod signer;
mod storage;

pub use error::{VaultError, VaultResult};
pub use key_vault::KeyVault;
pub use signer::Signer;
pub use storage::{KeyValueStore, SqliteKeyValueStore};

#[cfg(any(test, feature = "test-utils"))]
pub use storage::MemoryKeyValueStore;
