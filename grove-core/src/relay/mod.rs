//! Relay connectivity.
//!
//! This module owns everything between a consumer's query and the wire:
//!
//! ```text
//! ConnectionManager
//!     │  one per relay URL
//!     ▼
//! RelayConnection ── subscription_hash ──► at most one REQ per hash
//!     │
//!     ▼
//! Transport (WebSocket)
//!     │
//!     ▼
//! Nostr Relays
//! ```
//!
//! # Guarantees
//!
//! - **Multiplexing**: identical subscriptions share one relay-side
//!   subscription; `CLOSE` goes out only when the last consumer leaves
//! - **Verified delivery**: events reach consumers only after id and
//!   signature verification
//! - **Clean shutdown**: once [`RelayConnection::close`] returns no
//!   callback fires again
//! - **No retries**: transport errors are counted and reported, never
//!   retried at this layer
//!
//! NIP-42 authentication is answered automatically with the connection's
//! [`Signer`](crate::vault::Signer). A failed authentication leaves the link
//! open in [`LinkState::ConnectedUnauthenticated`].

mod connection;
mod error;
mod manager;
mod message;
mod transport;
mod types;

pub use connection::{
    validate_relay_url, EoseCallback, EventCallback, RelayConnection, SubscriptionHandle,
};
pub use error::{RelayError, RelayResult};
pub use manager::{ConnectionManager, ManagedSubscription};
pub use message::{ClientMessage, RelayMessage};
pub use transport::{Transport, TransportLink, TransportSignal, WebSocketTransport};
pub use types::{ConnectionEvent, LinkState, LogNotices, NoticeHandler};

#[cfg(any(test, feature = "test-utils"))]
pub use transport::{MemoryRelay, MemoryTransport};
