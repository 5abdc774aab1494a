//! Shared helpers for the integration tests.
//!
//! Events are signed through a real [`KeyVault`] backed by the in-memory
//! key-value store, so every event here passes full verification.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use grove_core::nostr::{Event, SubscriptionHash, UnsignedEvent, KIND_TEXT_NOTE};
use grove_core::relay::RelayMessage;
use grove_core::vault::{KeyVault, MemoryKeyValueStore};
use grove_core::CoreConfig;

/// Secret key `...01`.
pub const SECRET_ONE: &str = "0000000000000000000000000000000000000000000000000000000000000001";

/// Public key for [`SECRET_ONE`].
pub const PUBKEY_ONE: &str = "79be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

/// Creates an unlocked vault for [`SECRET_ONE`] in a fresh memory store.
pub async fn test_vault() -> Arc<KeyVault> {
    let vault = KeyVault::create(
        Arc::new(MemoryKeyValueStore::new()),
        "test passphrase",
        SECRET_ONE,
        &CoreConfig::default(),
    )
    .await
    .expect("vault creation should succeed");
    Arc::new(vault)
}

/// Signs a text note with the given content and timestamp.
pub fn note(vault: &KeyVault, content: &str, created_at: i64) -> Event {
    note_of_kind(vault, KIND_TEXT_NOTE, content, created_at)
}

/// Signs an event of any kind.
pub fn note_of_kind(vault: &KeyVault, kind: u16, content: &str, created_at: i64) -> Event {
    vault
        .sign(UnsignedEvent::new(vault.public_key(), kind, vec![], content).with_created_at(created_at))
        .expect("signing should succeed")
}

/// Wraps `event` in an `EVENT` frame for `hash`.
pub fn event_frame(hash: &SubscriptionHash, event: &Event) -> RelayMessage {
    RelayMessage::Event {
        subscription_id: hash.to_hex(),
        event: Box::new(event.clone()),
    }
}

/// Polls `condition` until it holds, panicking after about a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
