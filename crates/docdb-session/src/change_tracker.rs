//! Change detection for tracked documents.
//!
//! Compares the last known body of a document against the freshly serialized
//! entity. Objects are diffed key by key, recursively; arrays are diffed
//! position by position, so a reordered array reports changes even when it
//! holds the same values. System metadata keys never take part in the diff.
//!
//! Two modes are offered: [`has_changes`] stops at the first difference and
//! [`compute_changes`] collects every difference for diagnostics.

use docdb_core::metadata::{CHANGE_VECTOR, COLLECTION, ID, LAST_MODIFIED, METADATA};
use serde_json::{Map, Value};
use std::fmt;

/// Keys excluded from comparison at every nesting level.
const IGNORED_KEYS: &[&str] = &[LAST_MODIFIED, COLLECTION, CHANGE_VECTOR, ID, METADATA];

/// Kind of a single detected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    DocumentAdded,
    DocumentDeleted,
    FieldChanged,
    NewField,
    RemovedField,
    ArrayValueChanged,
    ArrayValueAdded,
    ArrayValueRemoved,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::DocumentAdded => "DocumentAdded",
            ChangeType::DocumentDeleted => "DocumentDeleted",
            ChangeType::FieldChanged => "FieldChanged",
            ChangeType::NewField => "NewField",
            ChangeType::RemovedField => "RemovedField",
            ChangeType::ArrayValueChanged => "ArrayValueChanged",
            ChangeType::ArrayValueAdded => "ArrayValueAdded",
            ChangeType::ArrayValueRemoved => "ArrayValueRemoved",
        };
        f.write_str(name)
    }
}

/// One detected difference.
///
/// `field_path` is the path of the object holding the field (`Address`,
/// `Lines[0]`); for array element changes it points at the element itself
/// (`Tags[2]`). Top-level fields have an empty path.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub change: ChangeType,
    pub field_name: String,
    pub field_path: String,
    pub field_old_value: Option<Value>,
    pub field_new_value: Option<Value>,
}

impl DocumentChange {
    /// A whole-document change with no field information.
    pub fn document(change: ChangeType) -> Self {
        Self {
            change,
            field_name: String::new(),
            field_path: String::new(),
            field_old_value: None,
            field_new_value: None,
        }
    }

    /// Full dotted location of the change, e.g. `Address.City`.
    pub fn full_path(&self) -> String {
        match (self.field_path.is_empty(), self.change) {
            (true, _) => self.field_name.clone(),
            (
                false,
                ChangeType::ArrayValueChanged
                | ChangeType::ArrayValueAdded
                | ChangeType::ArrayValueRemoved,
            ) => self.field_path.clone(),
            (false, _) => format!("{}.{}", self.field_path, self.field_name),
        }
    }
}

/// Whether `current` differs from `original`. Stops at the first difference.
pub fn has_changes(original: &Map<String, Value>, current: &Map<String, Value>) -> bool {
    compare_objects("", original, current, None)
}

/// Every difference between `original` and `current`, in key order.
pub fn compute_changes(
    original: &Map<String, Value>,
    current: &Map<String, Value>,
) -> Vec<DocumentChange> {
    let mut changes = Vec::new();
    compare_objects("", original, current, Some(&mut changes));
    tracing::trace!(changes = changes.len(), "Computed document changes");
    changes
}

fn is_ignored(key: &str) -> bool {
    IGNORED_KEYS.contains(&key)
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn push(
    changes: &mut Option<&mut Vec<DocumentChange>>,
    change: ChangeType,
    field_name: &str,
    field_path: &str,
    old: Option<&Value>,
    new: Option<&Value>,
) {
    if let Some(changes) = changes.as_deref_mut() {
        changes.push(DocumentChange {
            change,
            field_name: field_name.to_string(),
            field_path: field_path.to_string(),
            field_old_value: old.cloned(),
            field_new_value: new.cloned(),
        });
    }
}

/// Returns `true` when a difference was found. With `changes == None` it
/// returns on the first difference.
fn compare_objects(
    path: &str,
    original: &Map<String, Value>,
    current: &Map<String, Value>,
    mut changes: Option<&mut Vec<DocumentChange>>,
) -> bool {
    let mut changed = false;

    for (key, new_value) in current {
        if is_ignored(key) || original.contains_key(key) {
            continue;
        }
        if changes.is_none() {
            return true;
        }
        changed = true;
        push(&mut changes, ChangeType::NewField, key, path, None, Some(new_value));
    }

    for (key, old_value) in original {
        if is_ignored(key) || current.contains_key(key) {
            continue;
        }
        if changes.is_none() {
            return true;
        }
        changed = true;
        push(&mut changes, ChangeType::RemovedField, key, path, Some(old_value), None);
    }

    for (key, new_value) in current {
        if is_ignored(key) {
            continue;
        }
        let Some(old_value) = original.get(key) else {
            continue;
        };

        let field_changed = match (old_value, new_value) {
            (Value::Object(old), Value::Object(new)) => {
                compare_objects(&join_path(path, key), old, new, changes.as_deref_mut())
            }
            (Value::Array(old), Value::Array(new)) => {
                compare_arrays(path, key, old, new, changes.as_deref_mut())
            }
            (old, new) if old == new => false,
            (old, new) => {
                push(&mut changes, ChangeType::FieldChanged, key, path, Some(old), Some(new));
                true
            }
        };

        if field_changed {
            if changes.is_none() {
                return true;
            }
            changed = true;
        }
    }

    changed
}

fn compare_arrays(
    path: &str,
    name: &str,
    original: &[Value],
    current: &[Value],
    mut changes: Option<&mut Vec<DocumentChange>>,
) -> bool {
    if changes.is_none() && original.len() != current.len() {
        return true;
    }

    let mut changed = false;
    let common = original.len().min(current.len());
    for position in 0..common {
        let element_path = format!("{}[{position}]", join_path(path, name));
        let element_changed = match (&original[position], &current[position]) {
            (Value::Object(old), Value::Object(new)) => {
                compare_objects(&element_path, old, new, changes.as_deref_mut())
            }
            (Value::Array(old), Value::Array(new)) => {
                let nested_name = format!("{name}[{position}]");
                compare_arrays(path, &nested_name, old, new, changes.as_deref_mut())
            }
            (old, new) if old == new => false,
            (old, new) => {
                push(
                    &mut changes,
                    ChangeType::ArrayValueChanged,
                    name,
                    &element_path,
                    Some(old),
                    Some(new),
                );
                true
            }
        };
        if element_changed {
            if changes.is_none() {
                return true;
            }
            changed = true;
        }
    }

    for (position, old) in original.iter().enumerate().skip(common) {
        let element_path = format!("{}[{position}]", join_path(path, name));
        push(&mut changes, ChangeType::ArrayValueRemoved, name, &element_path, Some(old), None);
        changed = true;
    }
    for (position, new) in current.iter().enumerate().skip(common) {
        let element_path = format!("{}[{position}]", join_path(path, name));
        push(&mut changes, ChangeType::ArrayValueAdded, name, &element_path, None, Some(new));
        changed = true;
    }

    changed
}
