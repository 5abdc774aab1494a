//! Subscription filters (NIP-01).
//!
//! A [`Filter`] is a set of optional constraints; an event matches when it
//! satisfies every constraint that is present. A subscription is a slice of
//! filters combined with OR semantics.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::nostr::error::{NostrError, Result};
use crate::nostr::event::Event;
use crate::nostr::keys::is_lower_hex_32;

/// A single NIP-01 filter.
///
/// Tag constraints are stored under their wire key (`"#e"`, `"#p"`, ...).
/// An empty constraint list matches nothing, mirroring relay behaviour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event ids to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author public keys to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds to match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Tag constraints keyed by `#` plus the single-letter tag name.
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,

    /// Inclusive lower bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,

    /// Inclusive upper bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,

    /// Maximum number of stored events to return, newest first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// Creates an empty filter that matches every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an event id constraint.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id.into());
        self
    }

    /// Adds an author constraint.
    #[must_use]
    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(pubkey.into());
        self
    }

    /// Adds a single kind constraint.
    #[must_use]
    pub fn kind(mut self, kind: u16) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    /// Adds several kind constraints.
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds.get_or_insert_with(Vec::new).extend(kinds);
        self
    }

    /// Adds values for a single-letter tag constraint (`#<name>`).
    #[must_use]
    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{name}"))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Sets the inclusive lower time bound.
    #[must_use]
    pub const fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    /// Sets the inclusive upper time bound.
    #[must_use]
    pub const fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Parses a filter from NIP-01 JSON.
    ///
    /// # Errors
    ///
    /// Returns [`NostrError::Encoding`] if the JSON is not a valid filter.
    pub fn from_json(json: &str) -> Result<Self> {
        let filter: Self =
            serde_json::from_str(json).map_err(|e| NostrError::Encoding(e.to_string()))?;
        filter.validate()?;
        Ok(filter)
    }

    /// Serializes the filter to NIP-01 JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(NostrError::from)
    }

    /// Checks that every field can be canonically encoded.
    ///
    /// # Errors
    ///
    /// Returns [`NostrError::Encoding`] for tag keys that are not `#` plus
    /// one ASCII letter, or ids/authors that are not 64-char lowercase hex.
    pub fn validate(&self) -> Result<()> {
        for (field, values) in [("ids", &self.ids), ("authors", &self.authors)] {
            if let Some(bad) = values
                .iter()
                .flatten()
                .find(|value| !is_lower_hex_32(value))
            {
                return Err(NostrError::Encoding(format!(
                    "{field} entry is not 32-byte lowercase hex: {bad}"
                )));
            }
        }

        for key in self.tags.keys() {
            if tag_name(key).is_none() {
                return Err(NostrError::Encoding(format!("invalid tag filter key: {key}")));
            }
        }

        Ok(())
    }

    /// Returns the canonical JSON form used for hashing.
    ///
    /// Keys are emitted in sorted order and every array is sorted and
    /// deduplicated, so two filters with the same constraints always produce
    /// the same string regardless of how they were built.
    ///
    /// # Errors
    ///
    /// Returns [`NostrError::Encoding`] if the filter fails validation.
    pub fn canonical_json(&self) -> Result<String> {
        self.validate()?;

        let mut fields: BTreeMap<&str, Value> = BTreeMap::new();

        if let Some(ids) = &self.ids {
            fields.insert("ids", sorted_strings(ids));
        }
        if let Some(authors) = &self.authors {
            fields.insert("authors", sorted_strings(authors));
        }
        if let Some(kinds) = &self.kinds {
            let kinds: BTreeSet<u16> = kinds.iter().copied().collect();
            fields.insert("kinds", Value::from(kinds.into_iter().collect::<Vec<_>>()));
        }
        for (key, values) in &self.tags {
            fields.insert(key.as_str(), sorted_strings(values));
        }
        if let Some(since) = self.since {
            fields.insert("since", Value::from(since));
        }
        if let Some(until) = self.until {
            fields.insert("until", Value::from(until));
        }
        if let Some(limit) = self.limit {
            fields.insert("limit", Value::from(limit));
        }

        serde_json::to_string(&fields).map_err(|e| NostrError::Encoding(e.to_string()))
    }

    /// Returns true if `event` satisfies every present constraint.
    ///
    /// `limit` is not a per-event constraint and is ignored here.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|author| author == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        self.tags.iter().all(|(key, wanted)| {
            tag_name(key).is_some_and(|name| {
                event
                    .tag_values(name)
                    .any(|value| wanted.iter().any(|w| w == value))
            })
        })
    }
}

/// Extracts the tag name from a `#x` filter key.
pub(crate) fn tag_name(key: &str) -> Option<&str> {
    let name = key.strip_prefix('#')?;
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => Some(name),
        _ => None,
    }
}

fn sorted_strings(values: &[String]) -> Value {
    let set: BTreeSet<&str> = values.iter().map(String::as_str).collect();
    Value::from(set.into_iter().collect::<Vec<_>>())
}
