//! Error types for relay operations.
//!
//! Errors returned by connection and subscription calls. Failures that
//! happen later on an open link (transport errors, rejected authentication)
//! are reported as [`ConnectionEvent`](super::ConnectionEvent)s.

use thiserror::Error;

use crate::nostr::NostrError;

/// Errors that can occur during relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Connection to relay failed.
    #[error("Failed to connect to relay {url}: {reason}")]
    Connection {
        /// The relay URL that failed.
        url: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Invalid relay URL.
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    /// Timeout waiting for operation.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The connection has been closed.
    #[error("Relay connection is closed")]
    Closed,

    /// A frame or filter could not be encoded.
    #[error("Protocol error: {0}")]
    Encoding(#[from] NostrError),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display() {
        let error = RelayError::Connection {
            url: "wss://relay.example.com".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Failed to connect to relay wss://relay.example.com: connection refused"
        );
    }

    #[test]
    fn invalid_url_error_display() {
        let error = RelayError::InvalidUrl("https://relay".to_string());
        assert_eq!(error.to_string(), "Invalid relay URL: https://relay");
    }

    #[test]
    fn timeout_error_display() {
        let error = RelayError::Timeout("connect".to_string());
        assert_eq!(error.to_string(), "Operation timed out: connect");
    }

    #[test]
    fn closed_error_display() {
        assert_eq!(RelayError::Closed.to_string(), "Relay connection is closed");
    }

    #[test]
    fn malformed_filters_surface_as_protocol_errors() {
        let filter = crate::nostr::Filter::new().author("not-a-key");
        let error: RelayError = crate::nostr::subscription_hash(&[filter])
            .unwrap_err()
            .into();
        assert!(error.to_string().starts_with("Protocol error:"));
    }

    #[test]
    fn encoding_error_from_nostr_error() {
        let error: RelayError = NostrError::Encoding("bad tag".to_string()).into();
        assert!(matches!(error, RelayError::Encoding(_)));
        assert!(error.to_string().contains("bad tag"));
    }
}
