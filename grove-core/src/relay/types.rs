//! Types for relay connections.
//!
//! This module defines the link state machine, the status events a
//! connection broadcasts, and the notice callback seam.

use crate::nostr::SubscriptionHash;

/// Lifecycle of a single relay link.
///
/// ```text
/// Disconnected → Connecting → Connected → Authenticating → Authenticated
///                                 │              └──────► ConnectedUnauthenticated
///                                 └──────────────────────────────► Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// No link to the relay.
    Disconnected,

    /// Opening the link.
    Connecting,

    /// Link open, no authentication requested.
    Connected,

    /// Answering an authentication challenge.
    Authenticating,

    /// The relay accepted our authentication.
    Authenticated,

    /// Authentication was attempted and failed; the link stays open.
    ConnectedUnauthenticated,
}

impl LinkState {
    /// Returns true while the link can carry frames.
    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Disconnected | Self::Connecting)
    }
}

/// Status changes broadcast by a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The link moved to a new state.
    StateChanged(LinkState),

    /// Authentication failed. Non-fatal.
    AuthFailed {
        /// Why it failed.
        reason: String,
    },

    /// The transport reported an error.
    TransportError {
        /// Transport error message.
        message: String,
        /// Total errors seen on this connection so far.
        error_count: u64,
    },

    /// The relay closed a live subscription.
    SubscriptionClosed {
        /// The subscription that was closed.
        hash: SubscriptionHash,
        /// Reason given by the relay.
        message: String,
    },
}

/// Receives human-readable notices from relays.
pub trait NoticeHandler: Send + Sync {
    /// Called once per `NOTICE` frame.
    fn notice(&self, relay_url: &str, message: &str);
}

impl<F> NoticeHandler for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn notice(&self, relay_url: &str, message: &str) {
        self(relay_url, message);
    }
}

/// Notice handler that writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotices;

impl NoticeHandler for LogNotices {
    fn notice(&self, relay_url: &str, message: &str) {
        tracing::info!(relay = %relay_url, notice = %message, "relay notice");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn link_state_is_open() {
        assert!(!LinkState::Disconnected.is_open());
        assert!(!LinkState::Connecting.is_open());
        assert!(LinkState::Connected.is_open());
        assert!(LinkState::Authenticating.is_open());
        assert!(LinkState::Authenticated.is_open());
        assert!(LinkState::ConnectedUnauthenticated.is_open());
    }

    #[test]
    fn closures_are_notice_handlers() {
        let seen = Mutex::new(Vec::new());
        let handler = |url: &str, msg: &str| {
            seen.lock().unwrap().push(format!("{url}: {msg}"));
        };
        handler.notice("wss://r.test", "hello");
        assert_eq!(seen.lock().unwrap().as_slice(), ["wss://r.test: hello"]);
    }

    #[test]
    fn log_notices_does_not_panic() {
        LogNotices.notice("wss://r.test", "hello");
    }
}
