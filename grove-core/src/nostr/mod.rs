//! Nostr protocol types.
//!
//! This module holds the wire-level building blocks shared by the vault,
//! the relay connections and the event cache:
//!
//! - [`Event`] / [`UnsignedEvent`] / [`VerifiedEvent`]: NIP-01 events
//! - [`Filter`]: subscription constraints and local matching
//! - [`subscription_hash`]: order-independent subscription identity
//!
//! # Trust
//!
//! Events arriving from relays are untrusted until [`Event::verify`] checks
//! the id and Schnorr signature. Everything downstream of a relay connection
//! takes [`VerifiedEvent`], so an unverified event cannot reach the cache or
//! a consumer.

mod error;
mod event;
mod filter;
mod hash;
pub(crate) mod keys;

pub use error::{NostrError, Result};
pub use event::{Event, UnsignedEvent, VerifiedEvent, KIND_CLIENT_AUTH, KIND_TEXT_NOTE};
pub use filter::Filter;
pub use hash::{subscription_hash, SubscriptionHash};
pub use keys::{parse_public_key, parse_secret_key, public_key_from_secret, public_key_hex};

#[cfg(test)]
pub(crate) use event::tests as event_tests;
