//! Integration tests for local cache queries and provenance tracking.

mod helpers;

use std::collections::HashSet;
use std::sync::Arc;

use grove_core::cache::{LocalEventCache, SightingOutcome};
use grove_core::nostr::{subscription_hash, Filter, VerifiedEvent};
use grove_core::CoreConfig;
use helpers::{note, note_of_kind, test_vault, PUBKEY_ONE};

fn verified(event: grove_core::nostr::Event) -> VerifiedEvent {
    event.verify().expect("test events are correctly signed")
}

fn file_backed_cache(dir: &tempfile::TempDir) -> LocalEventCache {
    let config = CoreConfig {
        database_path: Some(dir.path().join("cache.db")),
        ..CoreConfig::default()
    };
    LocalEventCache::from_config(&config).expect("cache should open")
}

#[tokio::test]
async fn limit_returns_newest_first() {
    let dir = tempfile::tempdir().unwrap();
    let cache = file_backed_cache(&dir);
    let vault = test_vault().await;
    let hash = subscription_hash(&[Filter::new().kind(1)]).unwrap();

    for created_at in [10, 30, 20] {
        let event = verified(note(&vault, &format!("note {created_at}"), created_at));
        cache.record_sighting(&hash, &event, "wss://relay.test").unwrap();
    }
    let reaction = verified(note_of_kind(&vault, 7, "+", 40));
    cache.record_sighting(&hash, &reaction, "wss://relay.test").unwrap();

    let found = cache.query(&Filter::new().kind(1).limit(2)).unwrap();
    let stamps: Vec<i64> = found.iter().map(|e| e.created_at).collect();
    assert_eq!(stamps, vec![30, 20]);
}

#[tokio::test]
async fn query_all_unions_filters_without_duplicates() {
    let cache = LocalEventCache::from_config(&CoreConfig::default()).unwrap();
    let vault = test_vault().await;
    let hash = subscription_hash(&[Filter::new().author(PUBKEY_ONE)]).unwrap();

    let text = verified(note(&vault, "text", 100));
    let reaction = verified(note_of_kind(&vault, 7, "+", 200));
    for event in [&text, &reaction] {
        cache.record_sighting(&hash, event, "wss://relay.test").unwrap();
    }

    let found = cache
        .query_all(&[Filter::new().kind(1), Filter::new().author(PUBKEY_ONE)])
        .unwrap();
    let ids: Vec<&str> = found.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![reaction.id.as_str(), text.id.as_str()]);
}

#[tokio::test]
async fn provenance_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let vault = test_vault().await;
    let event = verified(note(&vault, "persisted", 500));
    let hash = subscription_hash(&[Filter::new().kind(1)]).unwrap();

    {
        let cache = file_backed_cache(&dir);
        assert_eq!(
            cache.record_sighting(&hash, &event, "wss://a.test").unwrap(),
            SightingOutcome::Inserted
        );
        assert_eq!(
            cache.record_sighting(&hash, &event, "wss://b.test").unwrap(),
            SightingOutcome::Merged
        );
        assert!(cache.mark_unavailable(&event.id, "wss://a.test").unwrap());
    }

    let cache = file_backed_cache(&dir);
    let cached = cache.get(&event.id).unwrap().unwrap();
    assert_eq!(cached.event.content, "persisted");
    assert!(!cached.relays["wss://a.test"].available);
    assert!(cached.relays["wss://b.test"].available);

    cache.record_sighting(&hash, &event, "wss://a.test").unwrap();
    assert!(cache.relays_for(&event.id).unwrap()["wss://a.test"].available);
}

#[tokio::test]
async fn concurrent_sightings_keep_every_relay() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(file_backed_cache(&dir));
    let vault = test_vault().await;
    let event = verified(note(&vault, "contended", 900));
    let hash = subscription_hash(&[Filter::new().kind(1)]).unwrap();

    let relay_count = 8;
    let tasks: Vec<_> = (0..relay_count)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let event = event.clone();
            tokio::task::spawn_blocking(move || {
                cache.record_sighting(&hash, &event, &format!("wss://relay{i}.test"))
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().unwrap());
    }

    let inserted = outcomes
        .iter()
        .filter(|o| **o == SightingOutcome::Inserted)
        .count();
    assert_eq!(inserted, 1, "exactly one sighting creates the record");
    assert_eq!(cache.len().unwrap(), 1);

    let relays: HashSet<String> = cache.relays_for(&event.id).unwrap().into_keys().collect();
    assert_eq!(relays.len(), relay_count);
}
