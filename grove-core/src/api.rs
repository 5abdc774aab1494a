//! Entry point wiring configuration, storage, vault and relays together.

use std::sync::Arc;

use thiserror::Error;

use crate::cache::{CacheError, LocalEventCache};
use crate::config::{ConfigError, CoreConfig};
use crate::nostr::{Filter, KIND_TEXT_NOTE};
use crate::relay::{ConnectionManager, LogNotices, Transport};
use crate::vault::{KeyValueStore, KeyVault, SqliteKeyValueStore, VaultError, VaultResult};

/// Number of notes requested by the home feed.
pub const HOME_FEED_LIMIT: usize = 100;

/// Errors raised while opening the core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The event cache could not be opened.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The vault store could not be opened.
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Core interface for Grove.
///
/// Owns the event cache and the vault record store, both kept in the
/// `SQLite` database named by [`CoreConfig::database_path`] (in memory when
/// unset).
///
/// # Example
///
/// ```rust,ignore
/// let core = GroveCore::open(CoreConfig::from_env()?)?;
/// let vault = core.unlock(&pubkey, &passphrase).await?;
/// let manager = core.connection_manager(Arc::new(WebSocketTransport::new()), vault);
/// manager.connect_defaults().await;
/// ```
pub struct GroveCore {
    config: CoreConfig,
    cache: Arc<LocalEventCache>,
    vault_store: Arc<dyn KeyValueStore>,
}

impl GroveCore {
    /// Validates `config` and opens storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the database
    /// cannot be opened.
    pub fn open(config: CoreConfig) -> Result<Self, CoreError> {
        config.validate()?;

        let cache = LocalEventCache::from_config(&config)?;
        let vault_store = match &config.database_path {
            Some(path) => SqliteKeyValueStore::open(path)?,
            None => SqliteKeyValueStore::in_memory()?,
        };

        tracing::info!(
            database = ?config.database_path,
            relays = config.default_relays.len(),
            "grove core opened"
        );
        Ok(Self {
            config,
            cache: Arc::new(cache),
            vault_store: Arc::new(vault_store),
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The shared event cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<LocalEventCache> {
        &self.cache
    }

    /// Stores `private_key` under `passphrase` and returns the unlocked vault.
    ///
    /// # Errors
    ///
    /// Returns any error [`KeyVault::create`] can return.
    pub async fn create_account(
        &self,
        passphrase: &str,
        private_key: &str,
    ) -> VaultResult<Arc<KeyVault>> {
        KeyVault::create(
            Arc::clone(&self.vault_store),
            passphrase,
            private_key,
            &self.config,
        )
        .await
        .map(Arc::new)
    }

    /// Generates a new identity stored under `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns any error [`KeyVault::create_new`] can return.
    pub async fn generate_account(&self, passphrase: &str) -> VaultResult<Arc<KeyVault>> {
        KeyVault::create_new(Arc::clone(&self.vault_store), passphrase, &self.config)
            .await
            .map(Arc::new)
    }

    /// Unlocks the stored identity for `public_key`.
    ///
    /// # Errors
    ///
    /// Returns any error [`KeyVault::unlock`] can return.
    pub async fn unlock(&self, public_key: &str, passphrase: &str) -> VaultResult<Arc<KeyVault>> {
        KeyVault::unlock(
            Arc::clone(&self.vault_store),
            public_key,
            passphrase,
            &self.config,
        )
        .await
        .map(Arc::new)
    }

    /// Builds a connection manager that signs with `vault` and writes to
    /// this core's cache. Notices go to the log.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn connection_manager(
        &self,
        transport: Arc<dyn Transport>,
        vault: Arc<KeyVault>,
    ) -> ConnectionManager {
        ConnectionManager::new(
            transport,
            vault,
            Arc::new(LogNotices),
            Arc::clone(&self.cache),
            self.config.clone(),
        )
    }

    /// Filters for the home feed: the most recent text notes.
    #[must_use]
    pub fn home_feed() -> Vec<Filter> {
        vec![Filter::new().kind(KIND_TEXT_NOTE).limit(HOME_FEED_LIMIT)]
    }
}

impl std::fmt::Debug for GroveCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroveCore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
