//! Identity Map, Entity Registry and Known-Missing set.
//!
//! The session keeps every [`DocumentRecord`](crate::record::DocumentRecord)
//! in one table keyed by [`RecordKey`]. Three indexes point into it:
//!
//! - **Identity Map**: normalized document id -> record. Ids compare
//!   case-insensitively. Prefix ids the server completes (`users/`) are never
//!   indexed, so several new documents may share one.
//! - **Entity Registry**: entity instance -> record, so one in-memory
//!   instance is never stored under two ids.
//! - **Known-Missing set**: ids the server confirmed absent, consulted before
//!   issuing a redundant load.
//!
//! # Example
//!
//! ```
//! use docdb_session::identity_map::{IdentityMap, KnownMissing};
//! use docdb_session::record::RecordKey;
//!
//! let mut map = IdentityMap::new();
//! let mut missing = KnownMissing::new();
//! missing.insert("Users/404");
//! assert!(missing.contains("users/404"));
//! assert!(map.is_empty());
//! ```

use crate::record::{EntityKey, RecordKey};
use docdb_core::normalize_id;
use std::collections::{HashMap, HashSet};

/// Normalized id -> record.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    entries: HashMap<String, RecordKey>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a record under `id`. Returns the record previously indexed
    /// under the same normalized id, if any.
    pub fn insert(&mut self, id: &str, key: RecordKey) -> Option<RecordKey> {
        self.entries.insert(normalize_id(id), key)
    }

    pub fn get(&self, id: &str) -> Option<RecordKey> {
        self.entries.get(&normalize_id(id)).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(&normalize_id(id))
    }

    pub fn remove(&mut self, id: &str) -> Option<RecordKey> {
        self.entries.remove(&normalize_id(id))
    }

    /// Drop every id pointing at `key`.
    pub fn remove_record(&mut self, key: RecordKey) {
        self.entries.retain(|_, k| *k != key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Entity instance -> record.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    entries: HashMap<EntityKey, RecordKey>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: EntityKey, key: RecordKey) {
        self.entries.insert(entity, key);
    }

    pub fn get(&self, entity: EntityKey) -> Option<RecordKey> {
        self.entries.get(&entity).copied()
    }

    pub fn contains(&self, entity: EntityKey) -> bool {
        self.entries.contains_key(&entity)
    }

    pub fn remove(&mut self, entity: EntityKey) -> Option<RecordKey> {
        self.entries.remove(&entity)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records that currently hold an entity, in key order.
    pub fn records(&self) -> Vec<RecordKey> {
        let mut keys: Vec<RecordKey> = self.entries.values().copied().collect();
        keys.sort();
        keys
    }
}

/// Ids confirmed absent on the server during this session.
#[derive(Debug, Default, Clone)]
pub struct KnownMissing {
    ids: HashSet<String>,
}

impl KnownMissing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: &str) {
        self.ids.insert(normalize_id(id));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(&normalize_id(id))
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.ids.remove(&normalize_id(id))
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
