//! Tracked document records and type-erased entity handles.
//!
//! A [`DocumentRecord`] holds everything the session knows about one
//! document: its id, last known change vector and metadata, the body
//! snapshot used for change detection, and the live entity (if one was
//! materialized). Entities are shared as [`EntityRef<T>`] (`Arc<RwLock<T>>`)
//! so the caller and the session observe the same instance.

use docdb_core::metadata::METADATA;
use docdb_core::{Entity, Error, MetadataDictionary, Result};
use serde_json::{Map, Value};
use std::any::Any;
use std::sync::{Arc, RwLock};

/// A shared reference to an entity tracked by a session.
pub type EntityRef<T> = Arc<RwLock<T>>;

/// Wrap a value so it can be stored in a session.
pub fn entity_ref<T: Entity>(entity: T) -> EntityRef<T> {
    Arc::new(RwLock::new(entity))
}

/// Identity of an entity instance (the address of its shared allocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey(usize);

impl EntityKey {
    /// Key for a typed entity reference.
    pub fn of<T: Entity>(entity: &EntityRef<T>) -> Self {
        Self(Arc::as_ptr(entity).cast::<()>() as usize)
    }
}

/// Key of a record in the session's record table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(pub(crate) u64);

/// When the session sends a change vector with a PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyCheckMode {
    /// Follow the session's optimistic-concurrency setting.
    #[default]
    Auto,
    /// Always send the change vector (store was given one explicitly).
    Forced,
    /// Never send a change vector.
    Disabled,
}

/// Object-safe view of an `RwLock<T: Entity>`.
trait ErasedEntity: Send + Sync {
    fn to_value(&self) -> Result<Value>;
    fn set_id(&self, id: &str);
    fn replace_from(&self, value: Value) -> Result<()>;
    fn type_name(&self) -> &'static str;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> ErasedEntity for RwLock<T> {
    fn to_value(&self) -> Result<Value> {
        let guard = self.read().unwrap_or_else(|e| e.into_inner());
        Ok(serde_json::to_value(&*guard)?)
    }

    fn set_id(&self, id: &str) {
        self.write().unwrap_or_else(|e| e.into_inner()).set_id(id);
    }

    fn replace_from(&self, value: Value) -> Result<()> {
        let fresh: T = serde_json::from_value(value)?;
        *self.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        T::type_name()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A type-erased entity held by a record.
#[derive(Clone)]
pub struct TrackedEntity {
    inner: Arc<dyn ErasedEntity>,
    key: EntityKey,
}

impl std::fmt::Debug for TrackedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEntity")
            .field("type", &self.inner.type_name())
            .field("key", &self.key)
            .finish()
    }
}

impl TrackedEntity {
    pub fn new<T: Entity>(entity: &EntityRef<T>) -> Self {
        Self {
            key: EntityKey::of(entity),
            inner: Arc::clone(entity) as Arc<dyn ErasedEntity>,
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.type_name()
    }

    /// Recover the typed reference. `None` if `T` is not the stored type.
    pub fn downcast<T: Entity>(&self) -> Option<EntityRef<T>> {
        Arc::clone(&self.inner).into_any().downcast::<RwLock<T>>().ok()
    }

    /// Serialize the entity into a document body without the identity
    /// property.
    pub fn to_body(&self, identity_property: &str) -> Result<Map<String, Value>> {
        match self.inner.to_value()? {
            Value::Object(mut map) => {
                map.remove(identity_property);
                map.remove(METADATA);
                Ok(map)
            }
            other => Err(Error::Serde(format!(
                "Entity of type {} must serialize to a JSON object, got {}",
                self.inner.type_name(),
                json_kind(&other)
            ))),
        }
    }

    /// Write an id back into the entity.
    pub fn set_id(&self, id: &str) {
        self.inner.set_id(id);
    }

    /// Replace the entity's state with a document body.
    pub fn refresh(&self, body: &Map<String, Value>, id: &str, identity_property: &str) -> Result<()> {
        self.inner
            .replace_from(with_identity(body, id, identity_property))?;
        self.inner.set_id(id);
        Ok(())
    }
}

/// Deserialize a document body into a fresh entity.
pub fn materialize<T: Entity>(
    body: &Map<String, Value>,
    id: &str,
    identity_property: &str,
) -> Result<T> {
    let mut entity: T = serde_json::from_value(with_identity(body, id, identity_property))?;
    entity.set_id(id);
    Ok(entity)
}

fn with_identity(body: &Map<String, Value>, id: &str, identity_property: &str) -> Value {
    let mut map = body.clone();
    map.remove(METADATA);
    map.insert(identity_property.to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Everything the session knows about one document.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    /// Id as given by the user or the server (original casing).
    pub id: String,
    pub change_vector: Option<String>,
    /// Last known `@metadata`.
    pub metadata: Map<String, Value>,
    /// User-facing metadata wrapper, created on first access.
    pub metadata_instance: Option<MetadataDictionary>,
    /// Body snapshot used for change detection (no `@metadata`).
    pub document: Option<Map<String, Value>>,
    pub entity: Option<TrackedEntity>,
    pub new_document: bool,
    pub ignore_changes: bool,
    pub concurrency_check: ConcurrencyCheckMode,
}

impl DocumentRecord {
    /// A record for a document received from the server.
    pub fn loaded(id: impl Into<String>, document: Map<String, Value>, metadata: Map<String, Value>) -> Self {
        let change_vector = metadata
            .get(docdb_core::metadata::CHANGE_VECTOR)
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id: id.into(),
            change_vector,
            metadata,
            metadata_instance: None,
            document: Some(document),
            entity: None,
            new_document: false,
            ignore_changes: false,
            concurrency_check: ConcurrencyCheckMode::Auto,
        }
    }

    /// A record for an entity stored in this session and not yet saved.
    pub fn new_entity(
        id: impl Into<String>,
        entity: TrackedEntity,
        metadata: Map<String, Value>,
        change_vector: Option<String>,
        concurrency_check: ConcurrencyCheckMode,
    ) -> Self {
        Self {
            id: id.into(),
            change_vector,
            metadata,
            metadata_instance: None,
            document: None,
            entity: Some(entity),
            new_document: true,
            ignore_changes: false,
            concurrency_check,
        }
    }

    /// The metadata wrapper, created from the last known metadata on first use.
    pub fn metadata_dictionary(&mut self) -> MetadataDictionary {
        self.metadata_instance
            .get_or_insert_with(|| MetadataDictionary::from_map(self.metadata.clone()))
            .clone()
    }

    /// Whether user code changed the metadata through the wrapper.
    pub fn is_metadata_dirty(&self) -> bool {
        self.metadata_instance
            .as_ref()
            .is_some_and(MetadataDictionary::is_dirty)
    }

    /// Metadata to send: last known values overlaid with wrapper edits.
    pub fn merged_metadata(&self) -> Map<String, Value> {
        match &self.metadata_instance {
            Some(instance) => {
                let mut merged = self.metadata.clone();
                for (key, value) in instance.to_map() {
                    merged.insert(key, value);
                }
                merged
            }
            None => self.metadata.clone(),
        }
    }

    /// Replace metadata after a successful write and reset the wrapper.
    pub fn apply_metadata(&mut self, metadata: Map<String, Value>) {
        if let Some(cv) = metadata
            .get(docdb_core::metadata::CHANGE_VECTOR)
            .and_then(Value::as_str)
        {
            self.change_vector = Some(cv.to_string());
        }
        self.metadata = metadata;
        self.metadata_instance = None;
    }
}
