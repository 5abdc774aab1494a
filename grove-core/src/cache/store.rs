//! `SQLite` storage for cached events.
//!
//! Events are stored once by id; every relay that delivered an event gets a
//! row in `event_relays`. Single-letter tags are indexed in `event_tags` so
//! tag filters can be narrowed in SQL.

// SQLite operations need to hold the lock for the duration of the operation.
#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use super::error::{CacheError, Result};
use super::types::{CachedEvent, RelaySighting, SightingOutcome};
use crate::nostr::{Event, Filter, VerifiedEvent};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_COLUMNS: &str = "id, pubkey, created_at, kind, content, tags_json, sig";

/// `SQLite`-based event storage.
///
/// Thread-safe wrapper around a `SQLite` connection. Only verified events
/// can be written.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Creates a store that lives only as long as the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                pubkey TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                kind INTEGER NOT NULL,
                content TEXT NOT NULL,
                tags_json TEXT NOT NULL,
                sig TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            CREATE INDEX IF NOT EXISTS idx_events_pubkey ON events(pubkey);
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at);

            -- Single-letter tags, for tag filters
            CREATE TABLE IF NOT EXISTS event_tags (
                event_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (event_id, name, value),
                FOREIGN KEY (event_id) REFERENCES events(id)
            );

            CREATE INDEX IF NOT EXISTS idx_event_tags_lookup ON event_tags(name, value);

            -- Provenance: which relays delivered each event
            CREATE TABLE IF NOT EXISTS event_relays (
                event_id TEXT NOT NULL,
                relay_url TEXT NOT NULL,
                available INTEGER NOT NULL DEFAULT 1,
                last_checked INTEGER NOT NULL,
                PRIMARY KEY (event_id, relay_url),
                FOREIGN KEY (event_id) REFERENCES events(id)
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CacheError::Storage(format!("Failed to acquire database lock: {e}")))
    }

    /// Records that `relay_url` delivered `event` at `seen_at`.
    ///
    /// Inserts the event if it is new; otherwise only the relay entry is
    /// created or refreshed. The payload of a cached event never changes.
    /// Runs as one immediate transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::WriteConflict`] if another writer holds the
    /// database past the busy timeout, or another database error.
    pub fn record_sighting(
        &self,
        event: &VerifiedEvent,
        relay_url: &str,
        seen_at: i64,
    ) -> Result<SightingOutcome> {
        let tags_json = serde_json::to_string(&event.tags)?;

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            r"
            INSERT OR IGNORE INTO events (id, pubkey, created_at, kind, content, tags_json, sig)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                event.id,
                event.pubkey,
                event.created_at,
                event.kind,
                event.content,
                tags_json,
                event.sig,
            ],
        )? == 1;

        if inserted {
            let mut insert_tag = tx.prepare_cached(
                "INSERT OR IGNORE INTO event_tags (event_id, name, value) VALUES (?1, ?2, ?3)",
            )?;
            for tag in &event.tags {
                if let [name, value, ..] = tag.as_slice() {
                    if is_indexable_tag(name) {
                        insert_tag.execute(params![event.id, name, value])?;
                    }
                }
            }
        }

        tx.execute(
            r"
            INSERT INTO event_relays (event_id, relay_url, available, last_checked)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(event_id, relay_url) DO UPDATE SET
                available = 1,
                last_checked = excluded.last_checked
            ",
            params![event.id, relay_url, seen_at],
        )?;

        tx.commit()?;

        Ok(if inserted {
            SightingOutcome::Inserted
        } else {
            SightingOutcome::Merged
        })
    }

    /// Gets a cached event and its provenance.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, id: &str) -> Result<Option<CachedEvent>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id],
                EventRow::from_row,
            )
            .optional()?;

        let Some(row) = row else {
            return Ok(None);
        };
        let relays = load_relays(&conn, id)?;
        Ok(Some(CachedEvent {
            event: row.into_event()?,
            relays,
        }))
    }

    /// Gets the relays that delivered `id`. Empty if the event is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn relays_for(&self, id: &str) -> Result<BTreeMap<String, RelaySighting>> {
        let conn = self.lock()?;
        load_relays(&conn, id)
    }

    /// Marks `relay_url` as no longer serving `id`.
    ///
    /// Returns false if the relay never delivered the event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn mark_unavailable(&self, id: &str, relay_url: &str, checked_at: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            r"
            UPDATE event_relays SET available = 0, last_checked = ?3
            WHERE event_id = ?1 AND relay_url = ?2
            ",
            params![id, relay_url, checked_at],
        )?;
        Ok(changed > 0)
    }

    /// Finds cached events matching `filter`, newest first.
    ///
    /// Ties on `created_at` are broken by ascending id. The result is
    /// truncated to `filter.limit` when present.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn query(&self, filter: &Filter) -> Result<Vec<Event>> {
        let Some((sql, values)) = build_query(filter) else {
            return Ok(Vec::new());
        };

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), EventRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut events = Vec::new();
        for row in rows {
            if events.len() >= limit {
                break;
            }
            let event = row.into_event()?;
            if filter.matches(&event) {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Number of cached events.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|e| CacheError::InvalidData(e.to_string()))
    }

    /// Returns true if no events are cached.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

struct EventRow {
    id: String,
    pubkey: String,
    created_at: i64,
    kind: u16,
    content: String,
    tags_json: String,
    sig: String,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pubkey: row.get(1)?,
            created_at: row.get(2)?,
            kind: row.get(3)?,
            content: row.get(4)?,
            tags_json: row.get(5)?,
            sig: row.get(6)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        Ok(Event {
            tags: serde_json::from_str(&self.tags_json)?,
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            content: self.content,
            sig: self.sig,
        })
    }
}

fn load_relays(conn: &Connection, id: &str) -> Result<BTreeMap<String, RelaySighting>> {
    let mut stmt = conn.prepare_cached(
        "SELECT relay_url, available, last_checked FROM event_relays WHERE event_id = ?1",
    )?;
    let relays = stmt
        .query_map(params![id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                RelaySighting {
                    available: row.get(1)?,
                    last_checked: row.get(2)?,
                },
            ))
        })?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
    Ok(relays)
}

fn is_indexable_tag(name: &str) -> bool {
    let mut chars = name.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_alphabetic())
}

/// Builds the narrowing query for `filter`.
///
/// Returns `None` when a present constraint list is empty, since such a
/// filter matches nothing.
fn build_query(filter: &Filter) -> Option<(String, Vec<Value>)> {
    if filter.limit == Some(0) {
        return None;
    }

    let mut clauses = Vec::new();
    let mut values = Vec::new();

    if let Some(ids) = &filter.ids {
        clauses.push(in_clause("id", ids.iter().cloned().map(Value::Text), &mut values)?);
    }
    if let Some(authors) = &filter.authors {
        clauses.push(in_clause(
            "pubkey",
            authors.iter().cloned().map(Value::Text),
            &mut values,
        )?);
    }
    if let Some(kinds) = &filter.kinds {
        clauses.push(in_clause(
            "kind",
            kinds.iter().map(|k| Value::Integer(i64::from(*k))),
            &mut values,
        )?);
    }
    for (key, wanted) in &filter.tags {
        let name = key.strip_prefix('#').unwrap_or(key);
        values.push(Value::Text(name.to_string()));
        let inner = in_clause("value", wanted.iter().cloned().map(Value::Text), &mut values)?;
        clauses.push(format!(
            "id IN (SELECT event_id FROM event_tags WHERE name = ? AND {inner})"
        ));
    }
    if let Some(since) = filter.since {
        clauses.push("created_at >= ?".to_string());
        values.push(Value::Integer(since));
    }
    if let Some(until) = filter.until {
        clauses.push("created_at <= ?".to_string());
        values.push(Value::Integer(until));
    }

    let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, id ASC");
    Some((sql, values))
}

fn in_clause(
    column: &str,
    items: impl Iterator<Item = Value>,
    values: &mut Vec<Value>,
) -> Option<String> {
    let before = values.len();
    values.extend(items);
    let count = values.len() - before;
    if count == 0 {
        return None;
    }
    let placeholders = vec!["?"; count].join(", ");
    Some(format!("{column} IN ({placeholders})"))
}
