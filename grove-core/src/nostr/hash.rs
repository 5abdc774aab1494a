//! Canonical subscription hashing.
//!
//! Two subscriptions that select the same events hash identically, no matter
//! the order of their filters or of the fields and array entries inside each
//! filter. The resulting [`SubscriptionHash`] is the identity used for
//! relay-side subscription reuse and for routing events to local consumers.
//!
//! ```text
//! filters ─► canonical_json ─► SHA-256 ─┐
//!                                       ├─► sort, dedup, concat ─► SHA-256
//! filters ─► canonical_json ─► SHA-256 ─┘
//! ```

use std::fmt;

use sha2::{Digest, Sha256};

use crate::nostr::error::{NostrError, Result};
use crate::nostr::filter::Filter;

/// Order-independent fingerprint of a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHash([u8; 32]);

impl SubscriptionHash {
    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the digest as 64 lowercase hex characters.
    ///
    /// This is also the subscription id sent to relays.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a hex-encoded digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not 32 bytes of hex.
    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes: [u8; 32] = hex::decode(value)?
            .try_into()
            .map_err(|_| NostrError::Encoding("subscription hash must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for SubscriptionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for SubscriptionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionHash({})", &self.to_hex()[..16])
    }
}

/// Computes the canonical hash of a subscription.
///
/// Duplicate filters collapse to one digest before concatenation, since
/// repeating a filter under OR semantics selects nothing new.
///
/// # Errors
///
/// Returns [`NostrError::Encoding`] if the subscription is empty or any
/// filter cannot be canonically encoded.
pub fn subscription_hash(filters: &[Filter]) -> Result<SubscriptionHash> {
    if filters.is_empty() {
        return Err(NostrError::Encoding(
            "subscription must contain at least one filter".to_string(),
        ));
    }

    let mut digests = filters
        .iter()
        .map(|filter| {
            let canonical = filter.canonical_json()?;
            Ok(<[u8; 32]>::from(Sha256::digest(canonical.as_bytes())))
        })
        .collect::<Result<Vec<[u8; 32]>>>()?;

    digests.sort_unstable();
    digests.dedup();

    let mut hasher = Sha256::new();
    for digest in &digests {
        hasher.update(digest);
    }
    Ok(SubscriptionHash(hasher.finalize().into()))
}
