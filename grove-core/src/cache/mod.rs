//! Local event cache.
//!
//! Every verified event a relay delivers is recorded here exactly once,
//! together with the set of relays it was seen on. Consumers registered
//! under a [`SubscriptionHash`](crate::nostr::SubscriptionHash) are notified
//! of each sighting, and the stored events can be re-queried locally with
//! the same [`Filter`](crate::nostr::Filter) semantics relays use.
//!
//! ```text
//! RelayConnection ──► ConnectionManager ──► LocalEventCache ──► consumer
//!                       (hash, event, url)        │
//!                                                 ▼
//!                                          EventStore (SQLite)
//! ```

mod error;
mod local;
mod store;
mod types;

pub use error::{CacheError, Result};
pub use local::LocalEventCache;
pub use store::EventStore;
pub use types::{CachedEvent, EventConsumer, RelaySighting, SightingOutcome};
