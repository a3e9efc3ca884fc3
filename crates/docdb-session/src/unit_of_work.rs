//! Unit of Work state for a document session.
//!
//! The Unit of Work owns every tracked [`DocumentRecord`] and the indexes that
//! point into them. It performs no I/O: the session asks it to plan a batch,
//! sends the batch, and hands the server's reply back to be applied.
//!
//! # Overview
//!
//! The Unit of Work:
//! - Tracks loaded documents and stored entities
//! - Rejects a second live entity for an already tracked id
//! - Tracks deleted entities and explicitly deferred commands
//! - Diffs every tracked entity against its last known body at save time
//! - Applies per-command batch results back into the identity map
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(conventions);
//! uow.store(&user, Some("users/1"), None, ConcurrencyCheckMode::Auto)?;
//!
//! let plan = uow.prepare_save(&mut callbacks)?;
//! let body = send(plan.batch.to_request_body()).await?;
//! uow.apply_batch_results(&plan, Some(body), &mut callbacks)?;
//! ```

use crate::batch::{BatchPlan, CommandData, CommandType};
use crate::change_tracker::{ChangeType, DocumentChange, compute_changes, has_changes};
use crate::identity_map::{EntityRegistry, IdentityMap, KnownMissing};
use crate::record::{
    ConcurrencyCheckMode, DocumentRecord, EntityKey, EntityRef, RecordKey, TrackedEntity,
    entity_ref, materialize,
};
use crate::{AfterSaveChangesEvent, BeforeStoreEvent, SessionEventCallbacks};
use docdb_core::metadata::{CHANGE_VECTOR, COLLECTION, ID, METADATA, split_document};
use docdb_core::{
    DocumentConventions, Entity, Error, IdentityConflictKind, MetadataDictionary, Result,
    SERVER_IDENTITY_SUFFIX, is_prefix_id, normalize_id,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Where a command in a prepared batch came from.
#[derive(Debug, Clone)]
pub enum CommandOrigin {
    /// PUT derived from a changed or new entity.
    SessionPut {
        record: RecordKey,
        /// Body to keep as the new snapshot once the server accepts it.
        body: Map<String, Value>,
        /// Metadata that was sent with the document.
        metadata: Map<String, Value>,
    },
    /// DELETE of an entity passed to `delete`.
    SessionDelete { record: RecordKey },
    /// A deferred command.
    Deferred,
}

/// A batch ready to send plus what each command should update on success.
#[derive(Debug, Clone, Default)]
pub struct SavePlan {
    pub batch: BatchPlan,
    pub origins: Vec<CommandOrigin>,
}

impl SavePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Outcome of looking an id up in the session before going to the server.
#[derive(Debug)]
pub enum Lookup<T> {
    /// Answered locally: the tracked entity, or `None` when known missing.
    Local(Option<EntityRef<T>>),
    /// The document must be fetched.
    Fetch,
}

/// Pending counts, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub tracked: usize,
    pub deleted: usize,
    pub deferred: usize,
}

/// Tracks every document known to one session.
#[derive(Debug)]
pub struct UnitOfWork {
    conventions: Arc<DocumentConventions>,
    records: BTreeMap<RecordKey, DocumentRecord>,
    next_key: u64,
    identity_map: IdentityMap,
    entities: EntityRegistry,
    known_missing: KnownMissing,
    /// Records whose entity was passed to `delete`.
    deleted: BTreeSet<RecordKey>,
    deferred: Vec<CommandData>,
    deferred_keys: HashSet<(CommandType, String)>,
    deferred_ids: HashSet<String>,
    no_tracking: bool,
}

impl UnitOfWork {
    /// Create an empty unit of work.
    pub fn new(conventions: Arc<DocumentConventions>) -> Self {
        Self {
            conventions,
            records: BTreeMap::new(),
            next_key: 0,
            identity_map: IdentityMap::new(),
            entities: EntityRegistry::new(),
            known_missing: KnownMissing::new(),
            deleted: BTreeSet::new(),
            deferred: Vec::new(),
            deferred_keys: HashSet::new(),
            deferred_ids: HashSet::new(),
            no_tracking: false,
        }
    }

    /// Disable tracking: loads and queries return detached entities and
    /// `store` is rejected.
    pub fn set_no_tracking(&mut self, no_tracking: bool) {
        self.no_tracking = no_tracking;
    }

    pub fn is_no_tracking(&self) -> bool {
        self.no_tracking
    }

    pub fn conventions(&self) -> &DocumentConventions {
        &self.conventions
    }

    fn identity_property(&self) -> &str {
        self.conventions.identity_property_name()
    }

    fn insert_record(&mut self, record: DocumentRecord) -> RecordKey {
        let key = RecordKey(self.next_key);
        self.next_key += 1;
        self.records.insert(key, record);
        key
    }

    fn record_for_id(&self, id: &str) -> Option<(RecordKey, &DocumentRecord)> {
        let key = self.identity_map.get(id)?;
        self.records.get(&key).map(|r| (key, r))
    }

    fn record_for_entity(&self, entity: EntityKey) -> Option<(RecordKey, &DocumentRecord)> {
        let key = self.entities.get(entity)?;
        self.records.get(&key).map(|r| (key, r))
    }

    /// Forget a record and every index pointing at it.
    fn remove_record(&mut self, key: RecordKey) -> Option<DocumentRecord> {
        let record = self.records.remove(&key)?;
        self.identity_map.remove_record(key);
        if let Some(entity) = &record.entity {
            self.entities.remove(entity.key());
        }
        self.deleted.remove(&key);
        Some(record)
    }

    // ========================================================================
    // Store / Delete / Defer
    // ========================================================================

    /// Start tracking `entity`.
    ///
    /// Without an explicit id the entity's own id is used, falling back to the
    /// collection prefix (`users/`) so the server assigns one. Returns the id
    /// the entity is tracked under.
    pub fn store<T: Entity>(
        &mut self,
        entity: &EntityRef<T>,
        id: Option<&str>,
        change_vector: Option<&str>,
        concurrency_check: ConcurrencyCheckMode,
    ) -> Result<String> {
        if self.no_tracking {
            return Err(Error::InvalidOperation(
                "Cannot store entities in a session opened without tracking".to_string(),
            ));
        }

        let entity_key = EntityKey::of(entity);
        if let Some((key, record)) = self.record_for_entity(entity_key) {
            if self.deleted.contains(&key) {
                return Err(Error::identity_conflict(
                    IdentityConflictKind::StoreAfterDelete,
                    record.id.clone(),
                    "Can't store object, it was already deleted in this session",
                ));
            }
            if let Some(requested) = id {
                if normalize_id(requested) != normalize_id(&record.id) {
                    return Err(Error::identity_conflict(
                        IdentityConflictKind::AlreadyTrackedUnderOtherId,
                        requested,
                        format!("Entity is already tracked under id '{}'", record.id),
                    ));
                }
            }
            let record_id = record.id.clone();
            if let Some(record) = self.records.get_mut(&key) {
                if let Some(cv) = change_vector {
                    record.change_vector = Some(cv.to_string());
                }
                record.concurrency_check = concurrency_check;
            }
            return Ok(record_id);
        }

        let collection = T::collection_name().map_or_else(
            || self.conventions.find_collection_name(T::type_name()),
            str::to_string,
        );
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                let own = entity.read().unwrap_or_else(|e| e.into_inner()).id();
                own.filter(|id| !id.is_empty())
                    .unwrap_or_else(|| self.conventions.id_prefix(&collection))
            }
        };

        if id.is_empty() {
            return Err(Error::InvalidOperation(
                "Document id must not be empty".to_string(),
            ));
        }
        if id.ends_with(SERVER_IDENTITY_SUFFIX) {
            return Err(Error::InvalidOperation(format!(
                "Document id '{id}' ends with '{SERVER_IDENTITY_SUFFIX}', which is reserved for server generated ids"
            )));
        }
        if self.deferred_ids.contains(&normalize_id(&id)) {
            return Err(Error::InvalidOperation(format!(
                "Can't store document, there is a deferred command registered for this document in the session. Document id: {id}"
            )));
        }

        let prefix = is_prefix_id(&id, self.conventions.separator());
        let tracked = TrackedEntity::new(entity);

        if !prefix {
            if let Some((key, existing)) = self.record_for_id(&id) {
                if existing.entity.is_some() {
                    return Err(Error::identity_conflict(
                        IdentityConflictKind::NonUniqueInstance,
                        id,
                        "Attempted to associate a different object with an id already tracked by the session",
                    ));
                }
                // A document known from a load or an include: attach the entity.
                if let Some(record) = self.records.get_mut(&key) {
                    record.entity = Some(tracked);
                    record.concurrency_check = concurrency_check;
                    if let Some(cv) = change_vector {
                        record.change_vector = Some(cv.to_string());
                    }
                }
                self.entities.insert(entity_key, key);
                self.known_missing.remove(&id);
                entity
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .set_id(&id);
                return Ok(id);
            }
        }

        let mut metadata = Map::new();
        metadata.insert(COLLECTION.to_string(), Value::String(collection));
        metadata.insert(
            self.conventions.rust_type_key().to_string(),
            Value::String(T::type_name().to_string()),
        );

        let record = DocumentRecord::new_entity(
            id.clone(),
            tracked,
            metadata,
            change_vector.map(str::to_string),
            concurrency_check,
        );
        let key = self.insert_record(record);
        self.entities.insert(entity_key, key);
        if !prefix {
            self.identity_map.insert(&id, key);
            entity
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .set_id(&id);
        }
        self.known_missing.remove(&id);

        tracing::debug!(id = %id, prefix, "Stored entity");
        Ok(id)
    }

    /// Mark a tracked entity for deletion.
    ///
    /// An entity that was stored but never saved is simply forgotten.
    pub fn delete_entity<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        let Some((key, record)) = self.record_for_entity(EntityKey::of(entity)) else {
            return Err(Error::InvalidOperation(format!(
                "{} is not associated with the session, cannot delete unknown entity instance",
                T::type_name()
            )));
        };

        if record.new_document {
            let id = record.id.clone();
            self.remove_record(key);
            tracing::debug!(id = %id, "Dropped unsaved entity");
            return Ok(());
        }

        let id = record.id.clone();
        self.deleted.insert(key);
        self.known_missing.insert(&id);
        tracing::debug!(id = %id, "Marked entity for deletion");
        Ok(())
    }

    /// Delete a document by id.
    ///
    /// A tracked entity that has unsaved changes cannot be deleted by id.
    pub fn delete_id(&mut self, id: &str, expected_change_vector: Option<&str>) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidOperation(
                "Document id must not be empty".to_string(),
            ));
        }

        let mut tracked_cv = None;
        if let Some((key, record)) = self.record_for_id(id) {
            if self.entity_changed(record)? {
                return Err(Error::InvalidOperation(format!(
                    "Can't delete changed entity using identifier. Use delete(entity) instead. Document id: {id}"
                )));
            }
            tracked_cv = record.change_vector.clone();
            self.remove_record(key);
        }

        self.known_missing.insert(id);

        let change_vector = expected_change_vector.map(str::to_string).or(
            if self.conventions.is_optimistic_concurrency() {
                tracked_cv
            } else {
                None
            },
        );
        let mut command = CommandData::delete(id);
        if let Some(cv) = change_vector {
            command = command.with_change_vector(cv);
        }
        self.defer(vec![command])
    }

    /// Queue raw commands for the next save.
    ///
    /// Fails without queueing anything when a command with the same type and
    /// id is already deferred.
    pub fn defer(&mut self, commands: Vec<CommandData>) -> Result<()> {
        let mut incoming = HashSet::new();
        for command in &commands {
            let key = command.dedup_key();
            if self.deferred_keys.contains(&key) || !incoming.insert(key) {
                return Err(Error::InvalidOperation(format!(
                    "A {} command for document '{}' is already deferred in this session",
                    command.command_type().as_str(),
                    command.id()
                )));
            }
        }
        for command in commands {
            self.deferred_keys.insert(command.dedup_key());
            self.deferred_ids.insert(normalize_id(command.id()));
            self.deferred.push(command);
        }
        Ok(())
    }

    pub fn deferred_commands(&self) -> &[CommandData] {
        &self.deferred
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Resolve `id` without the network if possible.
    pub fn lookup<T: Entity>(&mut self, id: &str) -> Result<Lookup<T>> {
        if self.known_missing.contains(id) {
            return Ok(Lookup::Local(None));
        }
        let Some(key) = self.identity_map.get(id) else {
            return Ok(Lookup::Fetch);
        };
        if self.deleted.contains(&key) {
            return Ok(Lookup::Local(None));
        }
        match self.entity_for_record::<T>(key)? {
            Some(entity) => Ok(Lookup::Local(Some(entity))),
            None => Ok(Lookup::Fetch),
        }
    }

    /// The typed entity for a record, materializing it from the snapshot when
    /// the record only holds a document.
    fn entity_for_record<T: Entity>(&mut self, key: RecordKey) -> Result<Option<EntityRef<T>>> {
        let identity = self.identity_property().to_string();
        let Some(record) = self.records.get_mut(&key) else {
            return Ok(None);
        };

        if let Some(tracked) = &record.entity {
            return tracked.downcast::<T>().map(Some).ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "Document '{}' is tracked as {}, not {}",
                    record.id,
                    tracked.type_name(),
                    T::type_name()
                ))
            });
        }

        let Some(document) = &record.document else {
            return Ok(None);
        };
        let entity = entity_ref(materialize::<T>(document, &record.id, &identity)?);
        let tracked = TrackedEntity::new(&entity);
        let entity_key = tracked.key();
        record.entity = Some(tracked);
        self.entities.insert(entity_key, key);
        Ok(Some(entity))
    }

    /// Register a document received from the server (load result, include,
    /// query result). Returns the record key it is tracked under.
    ///
    /// A record that already holds an entity keeps its state; the server copy
    /// only refreshes records without one.
    pub fn register_document(&mut self, document: Map<String, Value>) -> Result<RecordKey> {
        let (body, metadata) = split_document(document);
        let Some(id) = metadata.get(ID).and_then(Value::as_str).map(str::to_string) else {
            return Err(Error::protocol_with_data(
                "Document is missing '@metadata.@id'",
                Value::Object(metadata),
            ));
        };

        if let Some(key) = self.identity_map.get(&id) {
            if let Some(record) = self.records.get_mut(&key) {
                if record.entity.is_none() {
                    record.document = Some(body);
                    record.apply_metadata(metadata);
                }
            }
            return Ok(key);
        }

        let key = self.insert_record(DocumentRecord::loaded(id.clone(), body, metadata));
        self.identity_map.insert(&id, key);
        self.known_missing.remove(&id);
        tracing::debug!(id = %id, "Registered document");
        Ok(key)
    }

    /// Register a document and return its tracked entity.
    pub fn track_document<T: Entity>(&mut self, document: Map<String, Value>) -> Result<EntityRef<T>> {
        let key = self.register_document(document)?;
        self.entity_for_record::<T>(key)?.ok_or_else(|| {
            Error::protocol_violation("Registered document has neither an entity nor a body")
        })
    }

    /// Record that the server has no document with this id.
    pub fn mark_missing(&mut self, id: &str) {
        self.known_missing.insert(id);
    }

    /// Whether the id is tracked (as a document or entity) or known missing.
    pub fn is_loaded(&self, id: &str) -> bool {
        if self.known_missing.contains(id) {
            return true;
        }
        self.record_for_id(id)
            .is_some_and(|(_, r)| r.document.is_some() || r.entity.is_some())
    }

    /// Whether the id is known to be deleted or missing.
    pub fn is_deleted(&self, id: &str) -> bool {
        self.known_missing.contains(id)
    }

    // ========================================================================
    // Entity queries
    // ========================================================================

    fn record_of<T: Entity>(&self, entity: &EntityRef<T>) -> Result<(RecordKey, &DocumentRecord)> {
        self.record_for_entity(EntityKey::of(entity)).ok_or_else(|| {
            Error::InvalidOperation(format!(
                "{} is not associated with the session",
                T::type_name()
            ))
        })
    }

    /// Id the entity is tracked under.
    pub fn id_for<T: Entity>(&self, entity: &EntityRef<T>) -> Result<String> {
        self.record_of(entity).map(|(_, r)| r.id.clone())
    }

    /// Last known change vector; `None` for an entity never saved.
    pub fn change_vector_for<T: Entity>(&self, entity: &EntityRef<T>) -> Result<Option<String>> {
        self.record_of(entity).map(|(_, r)| r.change_vector.clone())
    }

    /// Metadata wrapper for the entity. Edits made through it are saved with
    /// the next `save_changes`.
    pub fn metadata_for<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<MetadataDictionary> {
        let (key, _) = self.record_of(entity)?;
        self.records
            .get_mut(&key)
            .map(DocumentRecord::metadata_dictionary)
            .ok_or_else(|| Error::Custom("Record vanished while reading metadata".to_string()))
    }

    /// Stop diffing this entity; it will not be saved unless deleted.
    pub fn ignore_changes_for<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<()> {
        let (key, _) = self.record_of(entity)?;
        if let Some(record) = self.records.get_mut(&key) {
            record.ignore_changes = true;
        }
        Ok(())
    }

    /// Stop tracking the entity. Pending changes to it are discarded.
    pub fn evict<T: Entity>(&mut self, entity: &EntityRef<T>) {
        if let Some(key) = self.entities.get(EntityKey::of(entity)) {
            if let Some(record) = self.remove_record(key) {
                tracing::debug!(id = %record.id, "Evicted entity");
            }
        }
    }

    /// Forget everything, including deferred commands and known-missing ids.
    pub fn clear(&mut self) {
        self.records.clear();
        self.identity_map.clear();
        self.entities.clear();
        self.known_missing.clear();
        self.deleted.clear();
        self.clear_deferred();
    }

    fn clear_deferred(&mut self) {
        self.deferred.clear();
        self.deferred_keys.clear();
        self.deferred_ids.clear();
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            tracked: self.entities.len(),
            deleted: self.deleted.len(),
            deferred: self.deferred.len(),
        }
    }

    // ========================================================================
    // Change detection
    // ========================================================================

    fn entity_changed(&self, record: &DocumentRecord) -> Result<bool> {
        let Some(entity) = &record.entity else {
            return Ok(false);
        };
        if record.new_document || record.is_metadata_dirty() {
            return Ok(true);
        }
        let current = entity.to_body(self.identity_property())?;
        Ok(record
            .document
            .as_ref()
            .is_none_or(|original| has_changes(original, &current)))
    }

    /// Whether the entity would be written by the next save.
    pub fn has_changed<T: Entity>(&self, entity: &EntityRef<T>) -> Result<bool> {
        let (key, record) = self.record_of(entity)?;
        if self.deleted.contains(&key) {
            return Ok(true);
        }
        self.entity_changed(record)
    }

    /// Whether the next save would send anything.
    pub fn has_changes(&self) -> Result<bool> {
        if !self.deleted.is_empty() || !self.deferred.is_empty() {
            return Ok(true);
        }
        for key in self.entities.records() {
            if let Some(record) = self.records.get(&key) {
                if !record.ignore_changes && self.entity_changed(record)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Every pending change, keyed by document id.
    pub fn what_changed(&self) -> Result<BTreeMap<String, Vec<DocumentChange>>> {
        let mut out = BTreeMap::new();

        for key in &self.deleted {
            if let Some(record) = self.records.get(key) {
                out.insert(
                    record.id.clone(),
                    vec![DocumentChange::document(ChangeType::DocumentDeleted)],
                );
            }
        }

        for key in self.entities.records() {
            if self.deleted.contains(&key) {
                continue;
            }
            let Some(record) = self.records.get(&key) else {
                continue;
            };
            let Some(entity) = &record.entity else {
                continue;
            };
            if record.ignore_changes {
                continue;
            }
            if record.new_document {
                out.insert(
                    record.id.clone(),
                    vec![DocumentChange::document(ChangeType::DocumentAdded)],
                );
                continue;
            }
            let current = entity.to_body(self.identity_property())?;
            let changes = match &record.document {
                Some(original) => compute_changes(original, &current),
                None => vec![DocumentChange::document(ChangeType::DocumentAdded)],
            };
            if !changes.is_empty() {
                out.insert(record.id.clone(), changes);
            }
        }

        Ok(out)
    }

    // ========================================================================
    // Save
    // ========================================================================

    fn change_vector_to_send(&self, record: &DocumentRecord) -> Option<String> {
        if self.conventions.is_optimistic_concurrency() {
            if record.concurrency_check == ConcurrencyCheckMode::Disabled {
                None
            } else {
                // An empty change vector asks the server to verify the
                // document does not exist yet.
                Some(record.change_vector.clone().unwrap_or_default())
            }
        } else if record.concurrency_check == ConcurrencyCheckMode::Forced {
            record.change_vector.clone()
        } else {
            None
        }
    }

    /// Build the batch for the next save: deletes, then changed entities,
    /// then deferred commands.
    ///
    /// Entities with a deferred command for their id are left to that
    /// command. Lifecycle callbacks run here, before anything is sent.
    pub fn prepare_save(&mut self, events: &mut SessionEventCallbacks) -> Result<SavePlan> {
        let mut plan = SavePlan::default();
        let optimistic = self.conventions.is_optimistic_concurrency();

        let deleted: Vec<RecordKey> = self.deleted.iter().copied().collect();
        for key in deleted {
            let Some(record) = self.records.get(&key) else {
                continue;
            };
            if self.deferred_ids.contains(&normalize_id(&record.id)) {
                continue;
            }
            events.fire_before_delete(&record.id)?;
            let mut command = CommandData::delete(record.id.clone());
            if optimistic || record.concurrency_check == ConcurrencyCheckMode::Forced {
                if let Some(cv) = &record.change_vector {
                    command = command.with_change_vector(cv.clone());
                }
            }
            plan.batch.push(command);
            plan.origins.push(CommandOrigin::SessionDelete { record: key });
        }

        let identity = self.identity_property().to_string();
        for key in self.entities.records() {
            if self.deleted.contains(&key) {
                continue;
            }
            let Some(record) = self.records.get_mut(&key) else {
                continue;
            };
            let Some(entity) = record.entity.clone() else {
                continue;
            };
            if record.ignore_changes || self.deferred_ids.contains(&normalize_id(&record.id)) {
                continue;
            }

            let body = entity.to_body(&identity)?;
            let changed = record.new_document
                || record.is_metadata_dirty()
                || record
                    .document
                    .as_ref()
                    .is_none_or(|original| has_changes(original, &body));
            tracing::trace!(id = %record.id, changed, "Checked entity for changes");
            if !changed {
                continue;
            }

            let metadata = record.metadata_dictionary();
            let event = BeforeStoreEvent::new(&record.id, metadata, &entity);
            events.fire_before_store(&event)?;

            // Callbacks may have edited the entity.
            let body = entity.to_body(&identity)?;
            let metadata = record.merged_metadata();
            let mut document = body.clone();
            document.insert(METADATA.to_string(), Value::Object(metadata.clone()));

            let record = &self.records[&key];
            let mut command = CommandData::put(record.id.clone(), document);
            if let Some(cv) = self.change_vector_to_send(record) {
                command = command.with_change_vector(cv);
            }
            plan.batch.push(command);
            plan.origins.push(CommandOrigin::SessionPut {
                record: key,
                body,
                metadata,
            });
        }

        for command in &self.deferred {
            if command.command_type() == CommandType::Delete {
                events.fire_before_delete(command.id())?;
            }
            plan.batch.push(command.clone());
            plan.origins.push(CommandOrigin::Deferred);
        }

        let (puts, deletes, patches) = plan.batch.counts();
        tracing::debug!(puts, deletes, patches, "Prepared batch");
        Ok(plan)
    }

    /// Apply the server's reply to a batch.
    ///
    /// Every result is validated before anything is updated, so a malformed
    /// reply leaves the session untouched. Once validated, every result is
    /// applied and the deferred commands are cleared before any
    /// `after_save_changes` callback runs. The first error is returned once
    /// every callback has fired.
    pub fn apply_batch_results(
        &mut self,
        plan: &SavePlan,
        response: Option<Value>,
        events: &mut SessionEventCallbacks,
    ) -> Result<()> {
        let results = validate_results(plan, response)?;

        let mut first_error = None;
        let mut saved = Vec::new();
        for ((command, origin), result) in plan
            .batch
            .commands
            .iter()
            .zip(&plan.origins)
            .zip(results)
        {
            let applied = match origin {
                CommandOrigin::SessionPut {
                    record,
                    body,
                    metadata,
                } => {
                    saved.push(*record);
                    self.apply_session_put(*record, body, metadata, result)
                }
                CommandOrigin::SessionDelete { record } => {
                    if let Some(removed) = self.remove_record(*record) {
                        self.known_missing.insert(&removed.id);
                    }
                    Ok(())
                }
                CommandOrigin::Deferred => self.apply_deferred(command, result),
            };
            if let Err(e) = applied {
                first_error.get_or_insert(e);
            }
        }
        self.clear_deferred();

        for key in saved {
            let Some(record) = self.records.get(&key) else {
                continue;
            };
            let event = AfterSaveChangesEvent::new(&record.id, record.entity.as_ref());
            if let Err(e) = events.fire_after_save_changes(&event) {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Settle a tracked entity under the id the server stored it as.
    ///
    /// An id already held by another record means the server overwrote that
    /// document: the stale record is evicted so the identity map keeps one
    /// record per id, and the collision is reported.
    fn apply_session_put(
        &mut self,
        key: RecordKey,
        body: &Map<String, Value>,
        sent_metadata: &Map<String, Value>,
        result: Map<String, Value>,
    ) -> Result<()> {
        let Some(id) = result.get(ID).and_then(Value::as_str).map(str::to_string) else {
            return Err(Error::protocol_violation("PUT result is missing '@id'"));
        };

        let mut metadata = sent_metadata.clone();
        for (name, value) in result {
            if name != "Type" {
                metadata.insert(name, value);
            }
        }

        let Some(record) = self.records.get_mut(&key) else {
            return Ok(());
        };
        let old_id = std::mem::replace(&mut record.id, id.clone());
        record.apply_metadata(metadata);
        record.document = Some(body.clone());
        record.new_document = false;
        if let Some(entity) = &record.entity {
            entity.set_id(&id);
        }

        if normalize_id(&old_id) != normalize_id(&id) {
            self.identity_map.remove_record(key);
        }
        let collision = self
            .identity_map
            .get(&id)
            .filter(|other| *other != key)
            .and_then(|other| self.remove_record(other));
        self.identity_map.insert(&id, key);
        self.known_missing.remove(&id);
        tracing::debug!(id = %id, "Applied PUT result");

        match collision {
            Some(evicted) => {
                tracing::warn!(
                    id = %id,
                    evicted = %evicted.id,
                    "Server-assigned id replaced a tracked document"
                );
                Err(Error::identity_conflict(
                    IdentityConflictKind::NonUniqueInstance,
                    id,
                    "The server stored a new document under an id the session already tracked; the previously tracked document is no longer tracked",
                ))
            }
            None => Ok(()),
        }
    }

    fn apply_deferred(&mut self, command: &CommandData, result: Map<String, Value>) -> Result<()> {
        let id = command.id();
        match command.command_type() {
            CommandType::Put => {
                if let Some(key) = self.identity_map.get(id) {
                    if let Some(record) = self.records.get_mut(&key) {
                        let mut metadata = record.metadata.clone();
                        for (name, value) in result {
                            if name != "Type" {
                                metadata.insert(name, value);
                            }
                        }
                        record.apply_metadata(metadata);
                        record.new_document = false;
                    }
                }
                self.known_missing.remove(id);
            }
            CommandType::Delete => {
                if let Some(key) = self.identity_map.get(id) {
                    self.remove_record(key);
                }
                self.known_missing.insert(id);
            }
            CommandType::Patch => {
                let Some(key) = self.identity_map.get(id) else {
                    return Ok(());
                };
                let identity = self.identity_property().to_string();
                let Some(record) = self.records.get_mut(&key) else {
                    return Ok(());
                };
                if let Some(cv) = result.get("ChangeVector").and_then(Value::as_str) {
                    record.change_vector = Some(cv.to_string());
                }
                if let Some(Value::Object(modified)) = result.get("ModifiedDocument") {
                    let (body, metadata) = split_document(modified.clone());
                    if let Some(entity) = &record.entity {
                        entity.refresh(&body, &record.id, &identity)?;
                    }
                    record.document = Some(body);
                    if !metadata.is_empty() {
                        record.apply_metadata(metadata);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Check the shape of a batch reply against the plan that produced it.
fn validate_results(plan: &SavePlan, response: Option<Value>) -> Result<Vec<Map<String, Value>>> {
    let Some(response) = response.filter(|v| !v.is_null()) else {
        return Err(Error::protocol_violation(
            "Got null response from the server after a batch request",
        ));
    };
    let results = match response.get("Results") {
        Some(Value::Array(results)) => results.clone(),
        _ => {
            return Err(Error::protocol_with_data(
                "Batch response is missing 'Results'",
                response,
            ));
        }
    };
    if results.len() != plan.batch.len() {
        return Err(Error::protocol_violation(format!(
            "Batch sent {} commands but the server returned {} results",
            plan.batch.len(),
            results.len()
        )));
    }

    let mut out = Vec::with_capacity(results.len());
    for (command, result) in plan.batch.commands.iter().zip(results) {
        let result = match result {
            Value::Object(map) => map,
            other => {
                return Err(Error::protocol_with_data(
                    format!("Result for '{}' is not an object", command.id()),
                    other,
                ));
            }
        };
        if command.command_type() == CommandType::Put {
            for required in [ID, CHANGE_VECTOR] {
                if !result.get(required).is_some_and(Value::is_string) {
                    return Err(Error::protocol_with_data(
                        format!("PUT result for '{}' is missing '{required}'", command.id()),
                        Value::Object(result),
                    ));
                }
            }
        }
        out.push(result);
    }
    Ok(out)
}
