//! Types for the local event cache.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::nostr::{Event, SubscriptionHash, VerifiedEvent};

/// What a sighting did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SightingOutcome {
    /// First time this event was seen; the record was created.
    Inserted,

    /// The event was already cached; only its relay entry changed.
    Merged,
}

/// Where an event was seen and whether that relay still has it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelaySighting {
    /// Whether the relay is believed to still serve the event.
    pub available: bool,

    /// Unix timestamp of the last sighting or check.
    pub last_checked: i64,
}

/// A cached event with its per-relay provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedEvent {
    /// The event as first received.
    pub event: Event,

    /// Relay URL → sighting.
    pub relays: BTreeMap<String, RelaySighting>,
}

/// Receives events recorded under a subscription hash.
pub trait EventConsumer: Send + Sync {
    /// Called after every sighting for the consumer's hash, new or merged.
    fn deliver(&self, hash: &SubscriptionHash, event: &VerifiedEvent, relay_url: &str);
}

impl<F> EventConsumer for F
where
    F: Fn(&SubscriptionHash, &VerifiedEvent, &str) + Send + Sync,
{
    fn deliver(&self, hash: &SubscriptionHash, event: &VerifiedEvent, relay_url: &str) {
        self(hash, event, relay_url);
    }
}
