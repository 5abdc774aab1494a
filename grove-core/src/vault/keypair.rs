//! Resident signing key held by an unlocked vault.
//!
//! # Security
//!
//! - Secret bytes are zeroized on drop via [`ZeroizeOnDrop`]
//! - Temporary copies are zeroized after each signature
//! - Debug output never includes secret material

use nostr::secp256k1::{Keypair, Message, SecretKey};
use nostr::{Keys, SecretKey as NostrSecretKey, ToBech32};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::error::{VaultError, VaultResult};
use crate::nostr::keys::{parse_secret_key, public_key_from_secret, SECP};
use crate::nostr::{Event, UnsignedEvent};

/// The user's secp256k1 signing key.
#[derive(ZeroizeOnDrop)]
pub(crate) struct IdentityKeypair {
    /// The secret key bytes (zeroized on drop).
    secret_bytes: [u8; 32],

    /// Cached public key bytes (not sensitive, skip zeroization).
    #[zeroize(skip)]
    pubkey_bytes: [u8; 32],
}

impl IdentityKeypair {
    /// Generates a new random keypair.
    pub(crate) fn generate() -> Self {
        let keys = Keys::generate();
        Self {
            secret_bytes: keys.secret_key().secret_bytes(),
            pubkey_bytes: keys.public_key().to_bytes(),
        }
    }

    /// Builds a keypair from raw secret bytes.
    pub(crate) fn from_secret_bytes(secret_bytes: [u8; 32]) -> VaultResult<Self> {
        let pubkey_bytes = public_key_from_secret(&secret_bytes)
            .map_err(|e| VaultError::InvalidKeyMaterial(e.to_string()))?;
        Ok(Self {
            secret_bytes,
            pubkey_bytes,
        })
    }

    /// Parses a secret key given as hex or `nsec`.
    pub(crate) fn parse(secret: &str) -> VaultResult<Self> {
        let bytes = parse_secret_key(secret)
            .map_err(|e| VaultError::InvalidKeyMaterial(e.to_string()))?;
        Self::from_secret_bytes(*bytes)
    }

    /// Public key as 64 hex characters.
    pub(crate) fn pubkey_hex(&self) -> String {
        hex::encode(self.pubkey_bytes)
    }

    /// Secret key as 64 hex characters, wiped when the wrapper drops.
    pub(crate) fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.secret_bytes))
    }

    /// Secret key as NIP-19 `nsec`, for backup. Wiped when the wrapper drops.
    pub(crate) fn export_nsec(&self) -> VaultResult<Zeroizing<String>> {
        let mut secret_bytes_copy = self.secret_bytes;

        let result = (|| {
            let secret_key = NostrSecretKey::from_slice(&secret_bytes_copy)
                .map_err(|e| VaultError::InvalidKeyMaterial(e.to_string()))?;
            let keys = Keys::new(secret_key);
            keys.secret_key()
                .to_bech32()
                .map(Zeroizing::new)
                .map_err(|e| VaultError::Bech32(e.to_string()))
        })();

        secret_bytes_copy.zeroize();

        result
    }

    /// Computes the event id and BIP-340 signature for `unsigned`.
    pub(crate) fn sign_event(&self, unsigned: UnsignedEvent) -> VaultResult<Event> {
        let id = unsigned
            .id()
            .map_err(|e| VaultError::Crypto(e.to_string()))?;
        let id_bytes: [u8; 32] = hex::decode(&id)
            .map_err(|e| VaultError::Crypto(e.to_string()))?
            .try_into()
            .map_err(|_| VaultError::Crypto("Invalid ID length".to_string()))?;

        let mut secret_bytes_copy = self.secret_bytes;

        let result: VaultResult<String> = (|| {
            let secret_key = SecretKey::from_slice(&secret_bytes_copy)
                .map_err(|e| VaultError::Crypto(e.to_string()))?;
            let keypair = Keypair::from_secret_key(&SECP, &secret_key);
            let signature = SECP.sign_schnorr(&Message::from_digest(id_bytes), &keypair);
            Ok(hex::encode(signature.serialize()))
        })();

        secret_bytes_copy.zeroize();

        Ok(unsigned.into_event(id, result?))
    }
}

impl std::fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret key
        f.debug_struct("IdentityKeypair")
            .field("pubkey", &self.pubkey_hex())
            .finish()
    }
}
