//! Nostr event types.
//!
//! - [`UnsignedEvent`]: event fields awaiting an id and signature
//! - [`Event`]: a signed event as it travels on the wire (untrusted)
//! - [`VerifiedEvent`]: an event whose id and signature have been checked
//!
//! Only [`Event::verify`] produces a [`VerifiedEvent`], so code that takes a
//! `VerifiedEvent` never sees unverified data.

use std::ops::Deref;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::nostr::error::{NostrError, Result};
use crate::nostr::keys::{parse_public_key, SECP};

/// Event kind for short text notes.
pub const KIND_TEXT_NOTE: u16 = 1;

/// Event kind for client authentication to relays (NIP-42).
pub const KIND_CLIENT_AUTH: u16 = 22242;

/// Event fields before the id and signature are attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsignedEvent {
    /// Author public key (32 bytes, hex-encoded)
    pub pubkey: String,

    /// Unix timestamp when the event was created
    pub created_at: i64,

    /// Event kind
    pub kind: u16,

    /// Event tags
    pub tags: Vec<Vec<String>>,

    /// Event content
    pub content: String,
}

impl UnsignedEvent {
    /// Creates an unsigned event stamped with the current time.
    #[must_use]
    pub fn new(
        pubkey: impl Into<String>,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            pubkey: pubkey.into(),
            created_at: Utc::now().timestamp(),
            kind,
            tags,
            content: content.into(),
        }
    }

    /// Overrides the creation timestamp.
    #[must_use]
    pub const fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Builds the NIP-42 authentication event for a relay challenge.
    #[must_use]
    pub fn client_auth(pubkey: impl Into<String>, relay_url: &str, challenge: &str) -> Self {
        Self::new(
            pubkey,
            KIND_CLIENT_AUTH,
            vec![
                vec!["relay".to_string(), relay_url.to_string()],
                vec!["challenge".to_string(), challenge.to_string()],
            ],
            "",
        )
    }

    /// Calculates the event id for these fields.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn id(&self) -> Result<String> {
        calculate_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Attaches an id and signature, producing a wire event.
    #[must_use]
    pub fn into_event(self, id: String, sig: String) -> Event {
        Event {
            id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// A signed Nostr event as received from or sent to a relay.
///
/// ```json
/// {
///   "id": "...",           // SHA256 of serialized event
///   "pubkey": "...",       // Author public key
///   "created_at": 123456,  // Unix timestamp
///   "kind": 1,
///   "tags": [["e", "..."]],
///   "content": "...",
///   "sig": "..."           // Schnorr signature
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    /// Event ID (32-byte SHA256 hash, hex-encoded)
    pub id: String,

    /// Author public key (32 bytes, hex-encoded)
    pub pubkey: String,

    /// Unix timestamp when the event was created
    pub created_at: i64,

    /// Event kind
    pub kind: u16,

    /// Event tags
    pub tags: Vec<Vec<String>>,

    /// Event content
    pub content: String,

    /// Schnorr signature (64 bytes, hex-encoded)
    pub sig: String,
}

impl Event {
    /// Serializes this event to JSON for transmission.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(NostrError::from)
    }

    /// Deserializes an event from JSON. The result is still unverified.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(NostrError::from)
    }

    /// Iterates over the values of every tag named `name`.
    ///
    /// The value of a tag is its second element; tags without one are skipped.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Verifies the event id and signature.
    ///
    /// # Errors
    ///
    /// Returns an error if the id does not match the fields or the
    /// signature does not verify against `pubkey`.
    pub fn verify_signature(&self) -> Result<()> {
        use nostr::secp256k1::{schnorr::Signature, Message};

        let pubkey = parse_public_key(&self.pubkey)
            .map_err(|e| NostrError::InvalidEvent(format!("Invalid pubkey: {e}")))?;

        let sig_bytes: [u8; 64] = hex::decode(&self.sig)?
            .try_into()
            .map_err(|_| NostrError::InvalidEvent("Invalid signature length".to_string()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| NostrError::InvalidEvent(format!("Invalid signature: {e}")))?;

        // Constant-time comparison of the recomputed id
        let calculated_id = calculate_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )?;

        if !bool::from(calculated_id.as_bytes().ct_eq(self.id.as_bytes())) {
            return Err(NostrError::InvalidEvent("Event ID mismatch".to_string()));
        }

        let id_bytes: [u8; 32] = hex::decode(&self.id)?
            .try_into()
            .map_err(|_| NostrError::InvalidEvent("Invalid ID length".to_string()))?;
        let message = Message::from_digest(id_bytes);

        SECP.verify_schnorr(&signature, &message, &pubkey)
            .map_err(|_| NostrError::InvalidSignature)
    }

    /// Verifies the event and wraps it as a [`VerifiedEvent`].
    ///
    /// # Errors
    ///
    /// Returns the verification failure; the event is consumed either way.
    pub fn verify(self) -> Result<VerifiedEvent> {
        self.verify_signature()?;
        Ok(VerifiedEvent(self))
    }
}

/// An event whose id and signature have been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEvent(Event);

impl VerifiedEvent {
    /// Returns the inner event.
    #[must_use]
    pub const fn as_event(&self) -> &Event {
        &self.0
    }

    /// Unwraps the inner event.
    #[must_use]
    pub fn into_inner(self) -> Event {
        self.0
    }
}

impl Deref for VerifiedEvent {
    type Target = Event;

    fn deref(&self) -> &Event {
        &self.0
    }
}

impl Serialize for VerifiedEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Calculates the event ID per NIP-01.
///
/// The ID is the SHA256 hash of the serialized array
/// `[0, pubkey, created_at, kind, tags, content]`.
pub(crate) fn calculate_id(
    pubkey: &str,
    created_at: i64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String> {
    let serialized = serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))?;

    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
