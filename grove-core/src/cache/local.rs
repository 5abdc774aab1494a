//! Local event cache with per-hash consumer routing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;

use super::error::{CacheError, Result};
use super::store::EventStore;
use super::types::{CachedEvent, EventConsumer, RelaySighting, SightingOutcome};
use crate::config::CoreConfig;
use crate::nostr::{Event, Filter, SubscriptionHash, VerifiedEvent};

/// Base delay between write attempts; doubled each retry.
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Upper bound on the delay between write attempts.
const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Persistent store of seen events plus per-relay provenance.
///
/// Each [`SubscriptionHash`] routes to at most one [`EventConsumer`];
/// registering a second consumer for the same hash replaces the first.
///
/// Methods block on `SQLite`; call them from the blocking pool in async code.
pub struct LocalEventCache {
    store: EventStore,
    consumers: RwLock<HashMap<SubscriptionHash, Arc<dyn EventConsumer>>>,
}

impl LocalEventCache {
    /// Wraps an existing store.
    #[must_use]
    pub fn new(store: EventStore) -> Self {
        Self {
            store,
            consumers: RwLock::new(HashMap::new()),
        }
    }

    /// Opens the cache at `config.database_path`, or in memory if unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        let store = match &config.database_path {
            Some(path) => EventStore::open(path)?,
            None => EventStore::in_memory()?,
        };
        Ok(Self::new(store))
    }

    /// Opens a file-backed cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(EventStore::open(path)?))
    }

    /// Routes future sightings for `hash` to `consumer`, replacing any
    /// previous consumer.
    pub fn register_consumer(&self, hash: SubscriptionHash, consumer: Arc<dyn EventConsumer>) {
        let previous = self
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash, consumer);
        if previous.is_some() {
            tracing::debug!(%hash, "replaced cache consumer");
        }
    }

    /// Stops routing sightings for `hash`. Returns true if a consumer was
    /// registered.
    pub fn unregister_consumer(&self, hash: &SubscriptionHash) -> bool {
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash)
            .is_some()
    }

    /// Records that `relay_url` delivered `event` for subscription `hash`.
    ///
    /// The record and its relay entry are written atomically; concurrent
    /// sightings of the same event from different relays all end up in the
    /// provenance map. The consumer registered under `hash`, if any, is
    /// then called whether the event was new or merged.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails. Write conflicts are retried
    /// until the write lands and never returned.
    pub fn record_sighting(
        &self,
        hash: &SubscriptionHash,
        event: &VerifiedEvent,
        relay_url: &str,
    ) -> Result<SightingOutcome> {
        let outcome = self.write_with_retry(event, relay_url)?;
        tracing::trace!(%hash, id = %event.id, relay = %relay_url, ?outcome, "recorded sighting");

        let consumer = self
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned();
        if let Some(consumer) = consumer {
            consumer.deliver(hash, event, relay_url);
        }

        Ok(outcome)
    }

    fn write_with_retry(&self, event: &VerifiedEvent, relay_url: &str) -> Result<SightingOutcome> {
        retry_on_conflict(&event.id, || {
            self.store
                .record_sighting(event, relay_url, Utc::now().timestamp())
        })
    }

    /// Finds cached events matching `filter`, newest first, truncated to
    /// `filter.limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        self.store.query(filter)
    }

    /// Finds cached events matching any of `filters`, newest first.
    ///
    /// Each filter's `limit` applies to that filter's own results. Events
    /// matched by several filters appear once.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn query_all(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for filter in filters {
            for event in self.store.query(filter)? {
                if seen.insert(event.id.clone()) {
                    events.push(event);
                }
            }
        }
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    /// Gets a cached event with its provenance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, id: &str) -> Result<Option<CachedEvent>> {
        self.store.get(id)
    }

    /// Gets the relays that delivered `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn relays_for(&self, id: &str) -> Result<BTreeMap<String, RelaySighting>> {
        self.store.relays_for(id)
    }

    /// Marks `relay_url` as no longer serving `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn mark_unavailable(&self, id: &str, relay_url: &str) -> Result<bool> {
        self.store
            .mark_unavailable(id, relay_url, Utc::now().timestamp())
    }

    /// Number of cached events.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn len(&self) -> Result<usize> {
        self.store.len()
    }

    /// Returns true if no events are cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn is_empty(&self) -> Result<bool> {
        self.store.is_empty()
    }
}

impl std::fmt::Debug for LocalEventCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let consumers = self
            .consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("LocalEventCache")
            .field("consumers", &consumers)
            .finish_non_exhaustive()
    }
}

/// Runs `write` until it succeeds or fails with anything other than
/// [`CacheError::WriteConflict`].
fn retry_on_conflict<T>(id: &str, mut write: impl FnMut() -> Result<T>) -> Result<T> {
    let mut backoff = RETRY_BACKOFF;
    let mut attempt: u32 = 1;
    loop {
        match write() {
            Err(CacheError::WriteConflict(reason)) => {
                tracing::debug!(%id, attempt, reason = %reason, "cache write conflict, retrying");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
                attempt = attempt.saturating_add(1);
            }
            result => return result,
        }
    }
}
