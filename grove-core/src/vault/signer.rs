//! Signing capability handed to relay connections.

use super::error::VaultResult;
use crate::nostr::{Event, UnsignedEvent};

/// Something that can sign events on behalf of one public key.
///
/// Relay connections use this for NIP-42 authentication; they never see the
/// key material behind it.
pub trait Signer: Send + Sync {
    /// Public key (hex) that signatures are produced for.
    fn public_key(&self) -> String;

    /// Computes the id and signature for `unsigned`.
    ///
    /// # Errors
    ///
    /// Returns an error if no key is available or the event cannot be signed.
    fn sign(&self, unsigned: UnsignedEvent) -> VaultResult<Event>;
}
