//! Connection manager.
//!
//! Keeps one [`RelayConnection`] per relay URL and feeds every event those
//! connections deliver into the [`LocalEventCache`], tagged with the relay
//! it came from.
//!
//! Each (relay, subscription hash) pair has a single cache feed no matter
//! how many [`ManagedSubscription`]s share it, so a cache consumer sees each
//! event once per relay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, RwLock};

use super::connection::{
    lock, validate_relay_url, EoseCallback, EventCallback, RelayConnection, SubscriptionHandle,
};
use super::error::{RelayError, RelayResult};
use super::transport::Transport;
use super::types::NoticeHandler;
use crate::cache::LocalEventCache;
use crate::config::CoreConfig;
use crate::nostr::{subscription_hash, Event, Filter, SubscriptionHash, VerifiedEvent};
use crate::vault::Signer;

type FeedKey = (String, SubscriptionHash);

/// One event delivered by one relay for one subscription.
struct Sighting {
    hash: SubscriptionHash,
    event: VerifiedEvent,
    relay_url: String,
}

/// The cache feed for one subscription on one relay.
#[derive(Debug)]
struct Feed {
    generation: u64,
    ingest: SubscriptionHandle,
    holders: usize,
}

#[derive(Debug, Default)]
struct FeedTable {
    next_generation: u64,
    feeds: HashMap<FeedKey, Feed>,
}

impl FeedTable {
    /// Drops one holder of the feed. Returns the ingest handle to detach
    /// when it was the last.
    fn release(&mut self, key: &FeedKey, generation: u64) -> Option<SubscriptionHandle> {
        let feed = self
            .feeds
            .get_mut(key)
            .filter(|feed| feed.generation == generation)?;
        feed.holders -= 1;
        if feed.holders > 0 {
            return None;
        }
        self.feeds.remove(key).map(|feed| feed.ingest)
    }

    fn forget_relay(&mut self, url: &str) {
        self.feeds.retain(|(feed_url, _), _| feed_url != url);
    }
}

/// A consumer's subscription through the [`ConnectionManager`].
///
/// Events reach the consumer through the cache; this handle carries the
/// end-of-stored-events callback and keeps the relay subscription open.
/// Dropping it does not unsubscribe; call [`ManagedSubscription::unsubscribe`].
#[derive(Debug)]
pub struct ManagedSubscription {
    consumer: SubscriptionHandle,
    key: FeedKey,
    generation: u64,
    feeds: Weak<Mutex<FeedTable>>,
}

impl ManagedSubscription {
    /// Canonical hash of the subscription.
    #[must_use]
    pub const fn hash(&self) -> SubscriptionHash {
        self.consumer.hash()
    }

    /// Relay the subscription runs on.
    #[must_use]
    pub fn relay_url(&self) -> &str {
        &self.key.0
    }

    /// Returns true while the relay subscription is live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.consumer.is_active()
    }

    /// Detaches this consumer. The relay subscription closes when the last
    /// consumer on that relay leaves.
    pub fn unsubscribe(self) {
        self.consumer.unsubscribe();
        let Some(feeds) = self.feeds.upgrade() else {
            return;
        };
        let ingest = lock(&feeds).release(&self.key, self.generation);
        if let Some(ingest) = ingest {
            ingest.unsubscribe();
        }
    }
}

/// Manager for relay connections.
///
/// # Example
///
/// ```rust,ignore
/// let manager = ConnectionManager::new(transport, vault, Arc::new(LogNotices), cache.clone(), config);
/// let feed = vec![Filter::new().kind(1).limit(100)];
///
/// cache.register_consumer(subscription_hash(&feed)?, Arc::new(render));
/// let subscription = manager
///     .subscribe("wss://grove-relay.onrender.com", feed, Arc::new(|_| {}))
///     .await?;
/// ```
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    notices: Arc<dyn NoticeHandler>,
    cache: Arc<LocalEventCache>,
    config: CoreConfig,
    connections: RwLock<HashMap<String, Arc<RelayConnection>>>,
    feeds: Arc<Mutex<FeedTable>>,
    ingest: mpsc::UnboundedSender<Sighting>,
}

impl ConnectionManager {
    /// Creates a manager and starts its cache ingest task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
        notices: Arc<dyn NoticeHandler>,
        cache: Arc<LocalEventCache>,
        config: CoreConfig,
    ) -> Self {
        let (ingest, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_ingest(Arc::clone(&cache), rx));

        Self {
            transport,
            signer,
            notices,
            cache,
            config,
            connections: RwLock::new(HashMap::new()),
            feeds: Arc::new(Mutex::new(FeedTable::default())),
            ingest,
        }
    }

    /// The cache deliveries are written to.
    #[must_use]
    pub const fn cache(&self) -> &Arc<LocalEventCache> {
        &self.cache
    }

    /// Returns the open connection to `url`, opening one if needed.
    ///
    /// A connection whose link was lost is replaced.
    ///
    /// # Errors
    ///
    /// Returns any error [`RelayConnection::connect`] can return.
    pub async fn connect(&self, url: &str) -> RelayResult<Arc<RelayConnection>> {
        let url = validate_relay_url(url)?;

        if let Some(existing) = self.open_connection(&url).await {
            return Ok(existing);
        }

        let connection = Arc::new(
            RelayConnection::connect(
                &url,
                Arc::clone(&self.transport),
                Arc::clone(&self.signer),
                Arc::clone(&self.notices),
                &self.config,
            )
            .await?,
        );

        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.get(&url).filter(|c| !c.is_closed()) {
            // Lost a race with another connect; keep the first link.
            connection.close();
            return Ok(Arc::clone(existing));
        }
        connections.insert(url, Arc::clone(&connection));
        Ok(connection)
    }

    /// Connects to every relay in the configured defaults.
    ///
    /// Returns the relays that failed, with their errors.
    pub async fn connect_defaults(&self) -> Vec<(String, RelayError)> {
        let mut failures = Vec::new();
        for url in &self.config.default_relays {
            if let Err(e) = self.connect(url).await {
                tracing::warn!(relay = %url, error = %e, "default relay unavailable");
                failures.push((url.clone(), e));
            }
        }
        failures
    }

    /// Closes and forgets the connection to `url`.
    ///
    /// Returns true if there was one.
    pub async fn disconnect(&self, url: &str) -> bool {
        let url = url.trim();
        let Some(connection) = self.connections.write().await.remove(url) else {
            return false;
        };
        connection.close();
        lock(&self.feeds).forget_relay(url);
        true
    }

    /// Gets the connection to `url`, if any.
    pub async fn get(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.connections.read().await.get(url.trim()).cloned()
    }

    /// URLs of all managed connections, sorted.
    pub async fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.connections.read().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Subscribes on `url`, connecting first if needed.
    ///
    /// Every event the subscription delivers is recorded in the cache under
    /// the subscription hash, in arrival order. Equivalent subscriptions on
    /// one relay share a single relay subscription and a single cache feed.
    ///
    /// # Errors
    ///
    /// Returns connection errors, [`RelayError::Encoding`] for malformed
    /// filters, or [`RelayError::Closed`].
    pub async fn subscribe(
        &self,
        url: &str,
        filters: Vec<Filter>,
        on_eose: EoseCallback,
    ) -> RelayResult<ManagedSubscription> {
        let connection = self.connect(url).await?;
        let key: FeedKey = (connection.url().to_string(), subscription_hash(&filters)?);

        let generation = {
            let mut table = lock(&self.feeds);
            match table.feeds.get_mut(&key) {
                Some(feed) if feed.ingest.is_active() => {
                    feed.holders += 1;
                    feed.generation
                }
                _ => {
                    let ingest = connection.subscribe(
                        filters.clone(),
                        self.ingest_callback(key.0.clone()),
                        Arc::new(|_: &SubscriptionHash| {}),
                    )?;
                    let generation = table.next_generation;
                    table.next_generation += 1;
                    table.feeds.insert(
                        key.clone(),
                        Feed {
                            generation,
                            ingest,
                            holders: 1,
                        },
                    );
                    tracing::debug!(relay = %key.0, hash = %key.1, "cache feed attached");
                    generation
                }
            }
        };

        let consumer = match connection.subscribe(
            filters,
            Arc::new(|_: &SubscriptionHash, _: &VerifiedEvent| {}),
            on_eose,
        ) {
            Ok(consumer) => consumer,
            Err(e) => {
                let ingest = lock(&self.feeds).release(&key, generation);
                if let Some(ingest) = ingest {
                    ingest.unsubscribe();
                }
                return Err(e);
            }
        };

        Ok(ManagedSubscription {
            consumer,
            key,
            generation,
            feeds: Arc::downgrade(&self.feeds),
        })
    }

    fn ingest_callback(&self, relay_url: String) -> EventCallback {
        let ingest = self.ingest.clone();
        Arc::new(move |hash: &SubscriptionHash, event: &VerifiedEvent| {
            let _ = ingest.send(Sighting {
                hash: *hash,
                event: event.clone(),
                relay_url: relay_url.clone(),
            });
        })
    }

    /// Publishes `event` to every open connection.
    ///
    /// Returns the per-relay outcome.
    pub async fn publish(&self, event: &Event) -> Vec<(String, RelayResult<()>)> {
        self.connections
            .read()
            .await
            .iter()
            .map(|(url, connection)| (url.clone(), connection.publish(event)))
            .collect()
    }

    /// Closes every connection.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (url, connection) in drained {
            connection.close();
            lock(&self.feeds).forget_relay(&url);
            tracing::debug!(relay = %url, "closed by manager");
        }
    }

    async fn open_connection(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.connections
            .read()
            .await
            .get(url)
            .filter(|c| !c.is_closed())
            .cloned()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Writes sightings to the cache one at a time, preserving arrival order.
async fn run_ingest(cache: Arc<LocalEventCache>, mut rx: mpsc::UnboundedReceiver<Sighting>) {
    while let Some(sighting) = rx.recv().await {
        let cache = Arc::clone(&cache);
        let result = tokio::task::spawn_blocking(move || {
            cache.record_sighting(&sighting.hash, &sighting.event, &sighting.relay_url)
        })
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to record sighting"),
            Err(e) => tracing::error!(error = %e, "cache ingest task failed"),
        }
    }
    tracing::debug!("cache ingest stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EventStore;
    use crate::nostr::event_tests::signed_note;
    use crate::nostr::subscription_hash;
    use crate::relay::message::{ClientMessage, RelayMessage};
    use crate::relay::transport::MemoryTransport;
    use crate::relay::types::LogNotices;
    use crate::vault::{VaultError, VaultResult};
    use crate::nostr::UnsignedEvent;
    use std::time::Duration;

    struct NoSigner;

    impl Signer for NoSigner {
        fn public_key(&self) -> String {
            "ab".repeat(32)
        }

        fn sign(&self, _: UnsignedEvent) -> VaultResult<Event> {
            Err(VaultError::Locked)
        }
    }

    fn secret() -> [u8; 32] {
        let mut bytes = [0u8; 32];
        bytes[31] = 5;
        bytes
    }

    fn manager(transport: Arc<MemoryTransport>) -> ConnectionManager {
        let cache = Arc::new(LocalEventCache::new(EventStore::in_memory().unwrap()));
        ConnectionManager::new(
            transport,
            Arc::new(NoSigner),
            Arc::new(LogNotices),
            cache,
            CoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());

        let a = manager.connect("wss://a.test").await.unwrap();
        let b = manager.connect(" wss://a.test ").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(transport.open_count("wss://a.test"), 1);
        assert_eq!(manager.urls().await, vec!["wss://a.test".to_string()]);
    }

    #[tokio::test]
    async fn lost_connections_are_replaced() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());

        let first = manager.connect("wss://a.test").await.unwrap();
        let relay = transport.take_relay("wss://a.test").unwrap();
        relay.hang_up();
        first
            .watch_state()
            .wait_for(|s| *s == crate::relay::LinkState::Disconnected)
            .await
            .unwrap();

        let second = manager.connect("wss://a.test").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(transport.open_count("wss://a.test"), 2);
    }

    #[tokio::test]
    async fn disconnect_and_close_all() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport);

        let a = manager.connect("wss://a.test").await.unwrap();
        let b = manager.connect("wss://b.test").await.unwrap();

        assert!(manager.disconnect("wss://a.test").await);
        assert!(!manager.disconnect("wss://a.test").await);
        assert!(a.is_closed());
        assert!(manager.get("wss://a.test").await.is_none());

        manager.close_all().await;
        assert!(b.is_closed());
        assert!(manager.urls().await.is_empty());
    }

    #[tokio::test]
    async fn subscription_events_land_in_cache_with_provenance() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());
        let filters = vec![Filter::new().kind(1)];
        let hash = subscription_hash(&filters).unwrap();

        manager
            .subscribe("wss://a.test", filters.clone(), Arc::new(|_: &SubscriptionHash| {}))
            .await
            .unwrap();
        manager
            .subscribe("wss://b.test", filters, Arc::new(|_: &SubscriptionHash| {}))
            .await
            .unwrap();

        let event = signed_note(secret(), 42, "everywhere");
        let mut relays = Vec::new();
        for url in ["wss://a.test", "wss://b.test"] {
            let relay = transport.take_relay(url).unwrap();
            relay
                .send(&RelayMessage::Event {
                    subscription_id: hash.to_hex(),
                    event: Box::new(event.clone()),
                })
                .unwrap();
            relays.push(relay);
        }

        let cache = Arc::clone(manager.cache());
        for _ in 0..200 {
            if cache.relays_for(&event.id).unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let relays = cache.relays_for(&event.id).unwrap();
        assert_eq!(
            relays.keys().cloned().collect::<Vec<_>>(),
            vec!["wss://a.test".to_string(), "wss://b.test".to_string()]
        );
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_handles_do_not_release_a_rebuilt_feed() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport);
        let filters = vec![Filter::new().kind(1)];

        let old = manager
            .subscribe("wss://a.test", filters.clone(), Arc::new(|_: &SubscriptionHash| {}))
            .await
            .unwrap();
        assert!(manager.disconnect("wss://a.test").await);
        assert!(!old.is_active());

        let fresh = manager
            .subscribe("wss://a.test", filters, Arc::new(|_: &SubscriptionHash| {}))
            .await
            .unwrap();
        old.unsubscribe();

        assert!(fresh.is_active());
        let connection = manager.get("wss://a.test").await.unwrap();
        // The cache feed plus the caller.
        assert_eq!(connection.consumer_count(&fresh.hash()), 2);

        fresh.unsubscribe();
        assert_eq!(connection.subscription_count(), 0);
    }

    #[tokio::test]
    async fn publish_reaches_every_connection() {
        let transport = Arc::new(MemoryTransport::new());
        let manager = manager(transport.clone());
        manager.connect("wss://a.test").await.unwrap();
        manager.connect("wss://b.test").await.unwrap();

        let event = signed_note(secret(), 1, "broadcast");
        let results = manager.publish(&event).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));

        let mut relay = transport.take_relay("wss://a.test").unwrap();
        assert_eq!(relay.drain(), vec![ClientMessage::Event(event)]);
    }

    #[tokio::test]
    async fn connect_defaults_reports_failures() {
        let transport = Arc::new(MemoryTransport::new());
        transport.refuse("wss://down.test");
        let cache = Arc::new(LocalEventCache::new(EventStore::in_memory().unwrap()));
        let manager = ConnectionManager::new(
            transport,
            Arc::new(NoSigner),
            Arc::new(LogNotices),
            cache,
            CoreConfig {
                default_relays: vec!["wss://up.test".to_string(), "wss://down.test".to_string()],
                ..CoreConfig::default()
            },
        );

        let failures = manager.connect_defaults().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "wss://down.test");
        assert_eq!(manager.urls().await, vec!["wss://up.test".to_string()]);
    }
}
