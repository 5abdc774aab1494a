//! Passphrase-protected signing key.
//!
//! A [`KeyVault`] persists one encrypted private key per public key in a
//! [`KeyValueStore`] and keeps the decrypted key resident while unlocked.
//!
//! # Record format
//!
//! ```text
//! key:   "key-info-" + hex(sha256(pubkey_hex))
//! value: nonce (12) ‖ AES-256-GCM("{pubkey_hex}.{seckey_hex}")
//! ```
//!
//! The AES key is PBKDF2-HMAC-SHA256 over the passphrase, salted with the
//! public key hex. Derivation runs on the blocking pool.

use std::sync::{Arc, PoisonError, RwLock};

use nostr::{PublicKey, ToBech32};
use zeroize::Zeroizing;

use super::cipher::{derive_key, open, record_key, seal};
use super::error::{VaultError, VaultResult};
use super::keypair::IdentityKeypair;
use super::signer::Signer;
use super::storage::KeyValueStore;
use crate::config::{CoreConfig, MIN_KDF_ITERATIONS};
use crate::nostr::{public_key_hex, Event, UnsignedEvent};

/// Local key vault for a single identity.
///
/// # Example
///
/// ```ignore
/// let store = Arc::new(SqliteKeyValueStore::open(&path)?);
/// let vault = KeyVault::create(store.clone(), "passphrase", &nsec, &config).await?;
/// let event = vault.sign(UnsignedEvent::new(vault.public_key(), 1, vec![], "hi"))?;
///
/// // Later, from the public key and passphrase alone:
/// let vault = KeyVault::unlock(store, &pubkey, "passphrase", &config).await?;
/// ```
pub struct KeyVault {
    store: Arc<dyn KeyValueStore>,
    pubkey: String,
    iterations: u32,
    keypair: RwLock<Option<IdentityKeypair>>,
}

impl KeyVault {
    /// Encrypts `private_key` under `passphrase` and persists it.
    ///
    /// `private_key` may be 64 hex characters or an `nsec` string. The
    /// returned vault is unlocked.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidKeyMaterial`] for an unusable key,
    /// [`VaultError::Config`] for a weak iteration count, or a storage error.
    pub async fn create(
        store: Arc<dyn KeyValueStore>,
        passphrase: &str,
        private_key: &str,
        config: &CoreConfig,
    ) -> VaultResult<Self> {
        let keypair = IdentityKeypair::parse(private_key)?;
        Self::persist(store, keypair, passphrase, config).await
    }

    /// Generates a fresh identity and persists it under `passphrase`.
    ///
    /// # Errors
    ///
    /// Same as [`KeyVault::create`], minus key parsing.
    pub async fn create_new(
        store: Arc<dyn KeyValueStore>,
        passphrase: &str,
        config: &CoreConfig,
    ) -> VaultResult<Self> {
        Self::persist(store, IdentityKeypair::generate(), passphrase, config).await
    }

    /// Opens the record for `public_key` with `passphrase`.
    ///
    /// `public_key` may be 64 lowercase hex characters or an `npub`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::InvalidKeyMaterial`]: `public_key` is not a valid key,
    ///   or the decrypted record is malformed
    /// - [`VaultError::VaultNotFound`]: no record for `public_key`
    /// - [`VaultError::DecryptionFailed`]: wrong passphrase or corrupted record
    /// - [`VaultError::KeyMismatch`]: the record holds a different identity
    pub async fn unlock(
        store: Arc<dyn KeyValueStore>,
        public_key: &str,
        passphrase: &str,
        config: &CoreConfig,
    ) -> VaultResult<Self> {
        let iterations = checked_iterations(config)?;
        let keypair = decrypt_record(store.as_ref(), public_key, passphrase, iterations).await?;
        let pubkey = keypair.pubkey_hex();

        tracing::info!(pubkey = %pubkey, "vault unlocked");
        Ok(Self {
            store,
            pubkey,
            iterations,
            keypair: RwLock::new(Some(keypair)),
        })
    }

    /// Public key (hex) this vault signs for. Available while locked.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.pubkey
    }

    /// Public key as NIP-19 `npub`. Available while locked.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Bech32`] if the key cannot be encoded.
    pub fn npub(&self) -> VaultResult<String> {
        PublicKey::from_hex(&self.pubkey)
            .map_err(|e| VaultError::InvalidKeyMaterial(e.to_string()))?
            .to_bech32()
            .map_err(|e| VaultError::Bech32(e.to_string()))
    }

    /// Exports the resident secret key as NIP-19 `nsec` so the identity can
    /// be backed up or moved to another device.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Locked`] if the vault is locked.
    pub fn export_nsec(&self) -> VaultResult<Zeroizing<String>> {
        let guard = self.keypair.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().ok_or(VaultError::Locked)?.export_nsec()
    }

    /// Returns `true` if no key material is resident.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.keypair
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Drops the resident key. The key bytes are zeroized.
    pub fn lock(&self) {
        let previous = self
            .keypair
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            tracing::info!(pubkey = %self.pubkey, "vault locked");
        }
    }

    /// Signs `unsigned` with the resident key.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Locked`] if the vault is locked and
    /// [`VaultError::AuthorMismatch`] if the event names another author.
    pub fn sign(&self, unsigned: UnsignedEvent) -> VaultResult<Event> {
        let guard = self.keypair.read().unwrap_or_else(PoisonError::into_inner);
        let keypair = guard.as_ref().ok_or(VaultError::Locked)?;

        if unsigned.pubkey != self.pubkey {
            return Err(VaultError::AuthorMismatch {
                event: unsigned.pubkey,
                vault: self.pubkey.clone(),
            });
        }

        keypair.sign_event(unsigned)
    }

    /// Re-encrypts the stored key under `new_passphrase`.
    ///
    /// The stored record is first opened with `current_passphrase`; a fresh
    /// record (new nonce, new key) then replaces it. Works whether or not
    /// the vault is locked, and leaves the lock state unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::DecryptionFailed`] if `current_passphrase` is
    /// wrong, or any error [`KeyVault::unlock`] can return.
    pub async fn change_passphrase(
        &self,
        current_passphrase: &str,
        new_passphrase: &str,
    ) -> VaultResult<()> {
        let keypair =
            decrypt_record(self.store.as_ref(), &self.pubkey, current_passphrase, self.iterations)
                .await?;
        write_record(self.store.as_ref(), &keypair, new_passphrase, self.iterations).await?;

        tracing::info!(pubkey = %self.pubkey, "vault passphrase changed");
        Ok(())
    }

    async fn persist(
        store: Arc<dyn KeyValueStore>,
        keypair: IdentityKeypair,
        passphrase: &str,
        config: &CoreConfig,
    ) -> VaultResult<Self> {
        let iterations = checked_iterations(config)?;
        write_record(store.as_ref(), &keypair, passphrase, iterations).await?;

        let pubkey = keypair.pubkey_hex();
        tracing::info!(pubkey = %pubkey, "vault created");
        Ok(Self {
            store,
            pubkey,
            iterations,
            keypair: RwLock::new(Some(keypair)),
        })
    }
}

impl Signer for KeyVault {
    fn public_key(&self) -> String {
        self.pubkey.clone()
    }

    fn sign(&self, unsigned: UnsignedEvent) -> VaultResult<Event> {
        Self::sign(self, unsigned)
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault")
            .field("pubkey", &self.pubkey)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

fn checked_iterations(config: &CoreConfig) -> VaultResult<u32> {
    if config.kdf_iterations < MIN_KDF_ITERATIONS {
        return Err(VaultError::Config(format!(
            "kdf_iterations must be at least {MIN_KDF_ITERATIONS}"
        )));
    }
    Ok(config.kdf_iterations)
}

async fn derive_key_blocking(
    pubkey: &str,
    passphrase: &str,
    iterations: u32,
) -> VaultResult<Zeroizing<[u8; 32]>> {
    let pubkey = pubkey.to_string();
    let passphrase = Zeroizing::new(passphrase.to_string());
    tokio::task::spawn_blocking(move || derive_key(&pubkey, &passphrase, iterations))
        .await
        .map_err(|e| VaultError::Crypto(format!("Key derivation task failed: {e}")))
}

async fn write_record(
    store: &dyn KeyValueStore,
    keypair: &IdentityKeypair,
    passphrase: &str,
    iterations: u32,
) -> VaultResult<()> {
    let pubkey = keypair.pubkey_hex();
    let key = derive_key_blocking(&pubkey, passphrase, iterations).await?;

    let secret = keypair.secret_hex();
    let plaintext = Zeroizing::new(format!("{pubkey}.{}", secret.as_str()));
    let record = seal(&key, plaintext.as_bytes())?;

    store.put(&record_key(&pubkey), &record)
}

async fn decrypt_record(
    store: &dyn KeyValueStore,
    public_key: &str,
    passphrase: &str,
    iterations: u32,
) -> VaultResult<IdentityKeypair> {
    let public_key = public_key_hex(public_key)
        .map_err(|e| VaultError::InvalidKeyMaterial(e.to_string()))?;

    let record = store
        .get(&record_key(&public_key))?
        .ok_or_else(|| VaultError::VaultNotFound(public_key.clone()))?;

    let key = derive_key_blocking(&public_key, passphrase, iterations).await?;
    let plaintext = open(&key, &record).inspect_err(|_| {
        tracing::warn!(pubkey = %public_key, "vault decryption failed");
    })?;

    let text = std::str::from_utf8(&plaintext)
        .map_err(|_| VaultError::InvalidKeyMaterial("record is not valid UTF-8".to_string()))?;
    let (embedded_pubkey, secret) = text
        .split_once('.')
        .ok_or_else(|| VaultError::InvalidKeyMaterial("record is malformed".to_string()))?;

    let keypair = IdentityKeypair::parse(secret)?;
    let derived = keypair.pubkey_hex();
    if derived != embedded_pubkey || derived != public_key {
        return Err(VaultError::KeyMismatch(public_key));
    }

    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::storage::MemoryKeyValueStore;

    const SECRET_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";
    const PUBKEY_ONE: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn store() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryKeyValueStore::new())
    }

    #[tokio::test]
    async fn create_then_unlock_and_sign() {
        let store = store();
        let config = CoreConfig::default();

        let created = KeyVault::create(store.clone(), "correct horse", SECRET_ONE, &config)
            .await
            .unwrap();
        assert_eq!(created.public_key(), PUBKEY_ONE);
        assert!(store.exists(&record_key(PUBKEY_ONE)).unwrap());

        let vault = KeyVault::unlock(store, PUBKEY_ONE, "correct horse", &config)
            .await
            .unwrap();
        assert!(!vault.is_locked());

        let event = vault
            .sign(UnsignedEvent::new(PUBKEY_ONE, 1, vec![], "hello"))
            .unwrap();
        assert_eq!(event.pubkey, PUBKEY_ONE);
        assert!(event.verify().is_ok());
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_closed() {
        let store = store();
        let config = CoreConfig::default();
        KeyVault::create(store.clone(), "right", SECRET_ONE, &config)
            .await
            .unwrap();

        let result = KeyVault::unlock(store, PUBKEY_ONE, "wrong", &config).await;
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn unlock_without_record_is_not_found() {
        let result = KeyVault::unlock(store(), PUBKEY_ONE, "any", &CoreConfig::default()).await;
        assert!(matches!(result, Err(VaultError::VaultNotFound(_))));
    }

    #[tokio::test]
    async fn unlock_rejects_malformed_public_key() {
        let result =
            KeyVault::unlock(store(), "not-a-key", "any", &CoreConfig::default()).await;
        assert!(matches!(result, Err(VaultError::InvalidKeyMaterial(_))));
    }

    #[tokio::test]
    async fn create_rejects_invalid_secret() {
        let result =
            KeyVault::create(store(), "pass", &"0".repeat(64), &CoreConfig::default()).await;
        assert!(matches!(result, Err(VaultError::InvalidKeyMaterial(_))));
    }

    #[tokio::test]
    async fn weak_iteration_count_is_rejected() {
        let config = CoreConfig {
            kdf_iterations: 10,
            ..CoreConfig::default()
        };
        let result = KeyVault::create(store(), "pass", SECRET_ONE, &config).await;
        assert!(matches!(result, Err(VaultError::Config(_))));
    }

    #[tokio::test]
    async fn record_for_other_identity_is_a_mismatch() {
        let store = store();
        let config = CoreConfig::default();
        let other = KeyVault::create_new(store.clone(), "pass", &config)
            .await
            .unwrap();

        // Plant the other identity's record under PUBKEY_ONE's slot.
        let planted = store.get(&record_key(other.public_key())).unwrap().unwrap();
        store.put(&record_key(PUBKEY_ONE), &planted).unwrap();

        // The salt differs, so the derived key cannot open it.
        let result = KeyVault::unlock(store, PUBKEY_ONE, "pass", &config).await;
        assert!(matches!(result, Err(VaultError::DecryptionFailed)));
    }

    #[tokio::test]
    async fn mismatched_embedded_key_is_rejected() {
        let store = store();
        let config = CoreConfig::default();

        // A record for PUBKEY_ONE that decrypts to a different identity.
        let other = IdentityKeypair::generate();
        let key = derive_key(PUBKEY_ONE, "pass", config.kdf_iterations);
        let plaintext = format!("{}.{}", other.pubkey_hex(), other.secret_hex().as_str());
        store
            .put(&record_key(PUBKEY_ONE), &seal(&key, plaintext.as_bytes()).unwrap())
            .unwrap();

        let result = KeyVault::unlock(store, PUBKEY_ONE, "pass", &config).await;
        assert!(matches!(result, Err(VaultError::KeyMismatch(_))));
    }

    #[tokio::test]
    async fn lock_prevents_signing() {
        let vault = KeyVault::create(store(), "pass", SECRET_ONE, &CoreConfig::default())
            .await
            .unwrap();
        vault.lock();
        vault.lock();
        assert!(vault.is_locked());
        assert_eq!(vault.public_key(), PUBKEY_ONE);

        let result = vault.sign(UnsignedEvent::new(PUBKEY_ONE, 1, vec![], "x"));
        assert!(matches!(result, Err(VaultError::Locked)));
    }

    #[tokio::test]
    async fn generated_identity_can_be_backed_up_and_restored() {
        let config = CoreConfig::default();
        let original = KeyVault::create_new(store(), "pass", &config).await.unwrap();
        let nsec = original.export_nsec().unwrap();
        assert!(nsec.starts_with("nsec1"));

        let restored = KeyVault::create(store(), "other pass", &nsec, &config)
            .await
            .unwrap();
        assert_eq!(restored.public_key(), original.public_key());
        assert_eq!(restored.npub().unwrap(), original.npub().unwrap());
    }

    #[tokio::test]
    async fn export_requires_unlocked_vault() {
        let vault = KeyVault::create(store(), "pass", SECRET_ONE, &CoreConfig::default())
            .await
            .unwrap();
        vault.lock();
        assert!(matches!(vault.export_nsec(), Err(VaultError::Locked)));
        assert!(vault.npub().unwrap().starts_with("npub1"));
    }

    #[tokio::test]
    async fn unlock_accepts_npub() {
        let store = store();
        let config = CoreConfig::default();
        let created = KeyVault::create(store.clone(), "pass", SECRET_ONE, &config)
            .await
            .unwrap();
        let npub = created.npub().unwrap();

        let vault = KeyVault::unlock(store.clone(), &npub, "pass", &config)
            .await
            .unwrap();
        assert_eq!(vault.public_key(), PUBKEY_ONE);
        assert!(matches!(
            KeyVault::unlock(store, &npub, "wrong", &config).await,
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn sign_rejects_foreign_author() {
        let vault = KeyVault::create(store(), "pass", SECRET_ONE, &CoreConfig::default())
            .await
            .unwrap();
        let result = vault.sign(UnsignedEvent::new("ab".repeat(32), 1, vec![], "x"));
        assert!(matches!(result, Err(VaultError::AuthorMismatch { .. })));
    }

    #[tokio::test]
    async fn change_passphrase_writes_new_record() {
        let store = store();
        let config = CoreConfig::default();
        let vault = KeyVault::create(store.clone(), "old", SECRET_ONE, &config)
            .await
            .unwrap();
        let before = store.get(&record_key(PUBKEY_ONE)).unwrap();

        assert!(matches!(
            vault.change_passphrase("not-old", "new").await,
            Err(VaultError::DecryptionFailed)
        ));
        vault.change_passphrase("old", "new").await.unwrap();

        assert_ne!(store.get(&record_key(PUBKEY_ONE)).unwrap(), before);
        assert!(KeyVault::unlock(store.clone(), PUBKEY_ONE, "new", &config)
            .await
            .is_ok());
        assert!(KeyVault::unlock(store, PUBKEY_ONE, "old", &config)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn debug_shows_only_public_key() {
        let vault = KeyVault::create(store(), "pass", SECRET_ONE, &CoreConfig::default())
            .await
            .unwrap();
        let debug = format!("{vault:?}");
        assert!(debug.contains(PUBKEY_ONE));
        assert!(!debug.contains(SECRET_ONE));
    }

    #[tokio::test]
    async fn signer_trait_delegates() {
        let vault = KeyVault::create(store(), "pass", SECRET_ONE, &CoreConfig::default())
            .await
            .unwrap();
        let signer: &dyn Signer = &vault;
        assert_eq!(signer.public_key(), PUBKEY_ONE);
        let event = signer
            .sign(UnsignedEvent::client_auth(PUBKEY_ONE, "wss://r.test", "c"))
            .unwrap();
        assert!(event.verify_signature().is_ok());
    }
}
