//! Error types for Nostr protocol operations.

use thiserror::Error;

/// Errors that can occur while building, encoding or verifying protocol data.
#[derive(Error, Debug)]
pub enum NostrError {
    /// A filter or subscription could not be canonically encoded.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Invalid event structure or content.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Event signature verification failed.
    #[error("Invalid event signature")]
    InvalidSignature,

    /// A public or secret key could not be parsed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Serialization failed.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Hex encoding/decoding error.
    #[error("Hex encoding error: {0}")]
    HexError(String),
}

/// Result type for Nostr operations.
pub type Result<T> = std::result::Result<T, NostrError>;

impl From<hex::FromHexError> for NostrError {
    fn from(e: hex::FromHexError) -> Self {
        Self::HexError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_encoding() {
        let err = NostrError::Encoding("bad tag".to_string());
        assert_eq!(err.to_string(), "Encoding error: bad tag");
    }

    #[test]
    fn error_display_invalid_event() {
        let err = NostrError::InvalidEvent("missing field".to_string());
        assert_eq!(err.to_string(), "Invalid event: missing field");
    }

    #[test]
    fn error_display_invalid_signature() {
        let err = NostrError::InvalidSignature;
        assert_eq!(err.to_string(), "Invalid event signature");
    }

    #[test]
    fn error_from_serde_json() {
        let json_err = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err: NostrError = json_err.into();
        assert!(matches!(err, NostrError::Serialization(_)));
    }

    #[test]
    fn error_from_hex() {
        let hex_err = hex::decode("not valid hex").unwrap_err();
        let err: NostrError = hex_err.into();
        assert!(matches!(err, NostrError::HexError(_)));
    }
}
