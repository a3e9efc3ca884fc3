//! Document metadata: reserved keys and the dirty-tracking metadata wrapper.
//!
//! Every stored document carries a `@metadata` object. The server owns the
//! system keys (prefixed with `@`); user code may add its own keys through a
//! [`MetadataDictionary`] obtained from the session. The wrapper records every
//! mutation made through its setters so the session knows the document must be
//! written back even when the entity body itself is unchanged.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};

/// Name of the metadata container inside a document body.
pub const METADATA: &str = "@metadata";
pub const COLLECTION: &str = "@collection";
pub const ID: &str = "@id";
pub const CHANGE_VECTOR: &str = "@change-vector";
pub const LAST_MODIFIED: &str = "@last-modified";
pub const FLAGS: &str = "@flags";
pub const EXPIRES: &str = "@expires";
pub const NESTED_OBJECT_TYPES: &str = "@nested-object-types";
pub const PROJECTION: &str = "@projection";
pub const COUNTERS: &str = "@counters";
pub const ATTACHMENTS: &str = "@attachments";

/// All reserved system metadata keys. These round-trip verbatim.
pub const RESERVED_KEYS: &[&str] = &[
    COLLECTION,
    ID,
    CHANGE_VECTOR,
    LAST_MODIFIED,
    FLAGS,
    EXPIRES,
    NESTED_OBJECT_TYPES,
    METADATA,
    PROJECTION,
    COUNTERS,
    ATTACHMENTS,
];

/// Check whether a key is one of the reserved system metadata keys.
pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Split a stored document into its body and its `@metadata` object.
pub fn split_document(mut document: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let metadata = match document.remove(METADATA) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    (document, metadata)
}

#[derive(Debug)]
struct MetadataNode {
    values: Map<String, Value>,
    children: BTreeMap<String, MetadataDictionary>,
    dirty: bool,
    parent: Weak<RwLock<MetadataNode>>,
}

impl MetadataNode {
    fn mark_dirty(&mut self) {
        self.dirty = true;
        if let Some(parent) = self.parent.upgrade() {
            parent
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .mark_dirty();
        }
    }
}

/// A mutable view over a document's metadata with explicit dirty tracking.
///
/// Cloning the dictionary clones the handle, not the data: all clones observe
/// the same values and the same dirty flag. Nested objects are exposed as
/// child dictionaries that keep a weak pointer to their parent, so editing a
/// child marks the whole chain dirty without creating a reference cycle.
#[derive(Debug, Clone)]
pub struct MetadataDictionary {
    node: Arc<RwLock<MetadataNode>>,
}

impl Default for MetadataDictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataDictionary {
    /// Create an empty, clean dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::from_map(Map::new())
    }

    /// Wrap an existing metadata object. The result starts clean.
    #[must_use]
    pub fn from_map(values: Map<String, Value>) -> Self {
        Self {
            node: Arc::new(RwLock::new(MetadataNode {
                values,
                children: BTreeMap::new(),
                dirty: false,
                parent: Weak::new(),
            })),
        }
    }

    fn with_parent(values: Map<String, Value>, parent: &Arc<RwLock<MetadataNode>>) -> Self {
        Self {
            node: Arc::new(RwLock::new(MetadataNode {
                values,
                children: BTreeMap::new(),
                dirty: false,
                parent: Arc::downgrade(parent),
            })),
        }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<Value> {
        let node = self.node.read().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = node.children.get(key) {
            return Some(Value::Object(child.to_map()));
        }
        node.values.get(key).cloned()
    }

    /// Get a string value by key.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get a nested object as a child dictionary.
    ///
    /// Mutations through the child are visible in this dictionary and mark it
    /// dirty. Returns `None` when the key is absent or not an object.
    pub fn get_object(&self, key: &str) -> Option<MetadataDictionary> {
        let mut node = self.node.write().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = node.children.get(key) {
            return Some(child.clone());
        }
        let Some(Value::Object(values)) = node.values.remove(key) else {
            return None;
        };
        let child = MetadataDictionary::with_parent(values, &self.node);
        node.children.insert(key.to_string(), child.clone());
        Some(child)
    }

    /// Set a value, marking the dictionary (and its ancestors) dirty.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let mut node = self.node.write().unwrap_or_else(|e| e.into_inner());
        node.children.remove(&key);
        node.values.insert(key, value.into());
        node.mark_dirty();
    }

    /// Remove a value. Marks dirty only if something was removed.
    pub fn remove(&self, key: &str) -> Option<Value> {
        let mut node = self.node.write().unwrap_or_else(|e| e.into_inner());
        let removed = match node.children.remove(key) {
            Some(child) => Some(Value::Object(child.to_map())),
            None => node.values.remove(key),
        };
        if removed.is_some() {
            node.mark_dirty();
        }
        removed
    }

    /// Check whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        let node = self.node.read().unwrap_or_else(|e| e.into_inner());
        node.children.contains_key(key) || node.values.contains_key(key)
    }

    /// Whether any setter has been called on this dictionary or a child.
    pub fn is_dirty(&self) -> bool {
        self.node.read().unwrap_or_else(|e| e.into_inner()).dirty
    }

    /// Reset the dirty flag (after the metadata was persisted).
    pub fn mark_clean(&self) {
        let node = self.node.read().unwrap_or_else(|e| e.into_inner());
        for child in node.children.values() {
            child.mark_clean();
        }
        drop(node);
        self.node.write().unwrap_or_else(|e| e.into_inner()).dirty = false;
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        let node = self.node.read().unwrap_or_else(|e| e.into_inner());
        node.values.len() + node.children.len()
    }

    /// Check if the dictionary has no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot the dictionary, including children, as a JSON object.
    pub fn to_map(&self) -> Map<String, Value> {
        let node = self.node.read().unwrap_or_else(|e| e.into_inner());
        let mut map = node.values.clone();
        for (key, child) in &node.children {
            map.insert(key.clone(), Value::Object(child.to_map()));
        }
        map
    }
}
