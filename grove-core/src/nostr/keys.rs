//! Shared secp256k1 context and key parsing helpers.

use std::sync::LazyLock;

use nostr::secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use nostr::{FromBech32, Keys, PublicKey};
use zeroize::Zeroizing;

use crate::nostr::error::{NostrError, Result};

/// Global secp256k1 context for cryptographic operations.
///
/// Creating a `Secp256k1` context is expensive as it precomputes tables
/// for signing and verification, so one context is shared by every
/// signer and verifier in the crate.
pub static SECP: LazyLock<Secp256k1<nostr::secp256k1::All>> = LazyLock::new(Secp256k1::new);

/// Parses a secret key given as 64-char hex or NIP-19 `nsec`.
///
/// # Errors
///
/// Returns [`NostrError::InvalidKey`] if the input is not a valid secret key.
/// The error message never echoes the input.
pub fn parse_secret_key(input: &str) -> Result<Zeroizing<[u8; 32]>> {
    let keys = Keys::parse(input.trim())
        .map_err(|_| NostrError::InvalidKey("not a valid secret key".to_string()))?;
    Ok(Zeroizing::new(keys.secret_key().secret_bytes()))
}

/// Derives the x-only public key bytes for a secret key.
///
/// # Errors
///
/// Returns [`NostrError::InvalidKey`] if the bytes are not a valid scalar.
pub fn public_key_from_secret(secret_bytes: &[u8; 32]) -> Result<[u8; 32]> {
    let secret_key = SecretKey::from_slice(secret_bytes)
        .map_err(|_| NostrError::InvalidKey("secret key out of range".to_string()))?;
    let keypair = Keypair::from_secret_key(&SECP, &secret_key);
    let (public_key, _parity) = keypair.x_only_public_key();
    Ok(public_key.serialize())
}

/// Parses a 64-char hex x-only public key.
///
/// # Errors
///
/// Returns [`NostrError::InvalidKey`] for malformed hex or a point that is
/// not on the curve.
pub fn parse_public_key(hex_key: &str) -> Result<XOnlyPublicKey> {
    let bytes: [u8; 32] = hex::decode(hex_key)?
        .try_into()
        .map_err(|_| NostrError::InvalidKey("public key must be 32 bytes".to_string()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| NostrError::InvalidKey(e.to_string()))
}

/// Normalizes a public key given as 64-char lowercase hex or NIP-19 `npub`
/// to hex.
///
/// # Errors
///
/// Returns [`NostrError::InvalidKey`] for anything else, including points
/// that are not on the curve.
pub fn public_key_hex(input: &str) -> Result<String> {
    if input.starts_with("npub1") {
        let key = PublicKey::from_bech32(input)
            .map_err(|e| NostrError::InvalidKey(format!("invalid npub: {e}")))?;
        return Ok(key.to_hex());
    }
    if !is_lower_hex_32(input) {
        return Err(NostrError::InvalidKey(
            "public key must be 64 lowercase hex characters or an npub".to_string(),
        ));
    }
    parse_public_key(input)?;
    Ok(input.to_string())
}

/// Returns true if `value` is 64 lowercase hex characters.
#[must_use]
pub fn is_lower_hex_32(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000003";

    #[test]
    fn parse_secret_key_accepts_hex() {
        let secret = parse_secret_key(SECRET_HEX).unwrap();
        assert_eq!(secret[31], 3);
    }

    #[test]
    fn parse_secret_key_accepts_nsec() {
        use nostr::prelude::ToBech32;

        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();
        let secret = parse_secret_key(&nsec).unwrap();
        assert_eq!(*secret, keys.secret_key().secret_bytes());
    }

    #[test]
    fn parse_secret_key_rejects_garbage() {
        assert!(parse_secret_key("").is_err());
        assert!(parse_secret_key("nsec1invalid").is_err());
        assert!(parse_secret_key("zz").is_err());
    }

    #[test]
    fn parse_secret_key_error_does_not_echo_input() {
        let err = parse_secret_key("nsec1supersecretvalue").unwrap_err();
        assert!(!err.to_string().contains("supersecretvalue"));
    }

    #[test]
    fn public_key_from_secret_matches_nostr_keys() {
        let keys = Keys::generate();
        let derived = public_key_from_secret(&keys.secret_key().secret_bytes()).unwrap();
        assert_eq!(derived, keys.public_key().to_bytes());
    }

    #[test]
    fn public_key_from_zero_secret_fails() {
        assert!(public_key_from_secret(&[0u8; 32]).is_err());
    }

    #[test]
    fn parse_public_key_roundtrip() {
        let keys = Keys::generate();
        let hex_key = hex::encode(keys.public_key().to_bytes());
        let parsed = parse_public_key(&hex_key).unwrap();
        assert_eq!(parsed.serialize(), keys.public_key().to_bytes());
    }

    #[test]
    fn parse_public_key_rejects_short_input() {
        assert!(parse_public_key("abcd").is_err());
        assert!(parse_public_key("not hex").is_err());
    }

    #[test]
    fn public_key_hex_accepts_npub_and_hex() {
        use nostr::prelude::ToBech32;

        let keys = Keys::generate();
        let hex_key = keys.public_key().to_hex();
        let npub = keys.public_key().to_bech32().unwrap();

        assert_eq!(public_key_hex(&npub).unwrap(), hex_key);
        assert_eq!(public_key_hex(&hex_key).unwrap(), hex_key);
        assert!(public_key_hex(&hex_key.to_uppercase()).is_err());
        assert!(public_key_hex("npub1invalid").is_err());
    }

    #[test]
    fn lower_hex_check() {
        assert!(is_lower_hex_32(&"a".repeat(64)));
        assert!(!is_lower_hex_32(&"A".repeat(64)));
        assert!(!is_lower_hex_32(&"a".repeat(63)));
        assert!(!is_lower_hex_32(&"g".repeat(64)));
    }
}
