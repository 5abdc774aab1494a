//! Passphrase key derivation and record encryption.
//!
//! - Key: PBKDF2-HMAC-SHA256, salt = the public key's hex string, 256-bit output
//! - Cipher: AES-256-GCM, fresh random 96-bit nonce per record
//! - Record layout: `nonce (12 bytes) ‖ ciphertext+tag`
//!
//! The salt is the public key so a record can be unlocked anywhere with only
//! the public key and the passphrase.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::error::{VaultError, VaultResult};

/// Nonce length for AES-256-GCM.
pub(crate) const NONCE_LEN: usize = 12;

/// Namespace prefix for vault record keys.
pub(crate) const RECORD_KEY_PREFIX: &str = "key-info-";

/// Derives the 256-bit record key from `(public key, passphrase)`.
///
/// Deterministic: the same inputs always give the same key.
pub(crate) fn derive_key(
    pubkey_hex: &str,
    passphrase: &str,
    iterations: u32,
) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        passphrase.as_bytes(),
        pubkey_hex.as_bytes(),
        iterations,
        key.as_mut(),
    );
    key
}

/// Storage key for the record belonging to `pubkey_hex`.
pub(crate) fn record_key(pubkey_hex: &str) -> String {
    let digest = Sha256::digest(pubkey_hex.as_bytes());
    format!("{RECORD_KEY_PREFIX}{}", hex::encode(digest))
}

/// Encrypts `plaintext` and returns `nonce ‖ ciphertext`.
pub(crate) fn seal(key: &[u8; 32], plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| VaultError::Crypto(format!("Encryption failed: {e}")))?;

    let mut record = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    record.extend_from_slice(&nonce);
    record.extend_from_slice(&ciphertext);
    Ok(record)
}

/// Decrypts a `nonce ‖ ciphertext` record.
///
/// Fails closed: any authentication failure returns
/// [`VaultError::DecryptionFailed`] and no plaintext.
pub(crate) fn open(key: &[u8; 32], record: &[u8]) -> VaultResult<Zeroizing<Vec<u8>>> {
    if record.len() <= NONCE_LEN {
        return Err(VaultError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = record.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::DecryptionFailed)
}
