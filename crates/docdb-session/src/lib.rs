//! Session and Unit of Work for docdb.
//!
//! `docdb-session` is the **unit-of-work layer**. It tracks documents loaded
//! from or stored into one session, detects what changed, and turns many
//! logical operations into as few round trips as possible.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per document id.
//! - **Change tracking**: structural diff of entities against their last
//!   known body; only changed documents are written.
//! - **Batching**: one `save_changes` is one batch request; pending lazy
//!   reads share one multi-get.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: nothing is written until `save_changes`.
//! - **Shared entities**: entities are `Arc<RwLock<T>>` so caller and session
//!   observe the same instance.
//! - **Type erasure**: records hold entities behind an object-safe trait.
//! - **Cancel-correct**: all network operations use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let store = DocumentStore::new(executor).database("shop");
//! let mut session = store.open_session();
//!
//! // Store a new entity (written on save_changes)
//! let user = entity_ref(User { id: None, name: "Ann".into() });
//! session.store(&user)?;
//!
//! // Load by id (served from the identity map when already tracked)
//! let order = session.load::<Order>(&cx, "orders/1").await?;
//!
//! // Send everything in one batch
//! session.save_changes(&cx).await?;
//! ```

pub mod batch;
pub mod budget;
pub mod change_tracker;
pub mod identity_map;
pub mod lazy;
pub mod operations;
pub mod record;
pub mod unit_of_work;

pub use batch::{BatchPlan, CommandData, CommandType, PatchRequest};
pub use budget::{RequestBudget, RequestStats};
pub use change_tracker::{ChangeType, DocumentChange, compute_changes, has_changes};
pub use identity_map::{EntityRegistry, IdentityMap, KnownMissing};
pub use lazy::{
    GetRequest, GetResponse, LazyCountOperation, LazyHandle, LazyLoadOperation, LazyOperation,
    LazyQueryOperation,
};
pub use operations::QueryResult;
pub use record::{ConcurrencyCheckMode, EntityKey, EntityRef, TrackedEntity, entity_ref};
pub use unit_of_work::{PendingCounts, UnitOfWork};

use asupersync::{Cx, Outcome};
use docdb_core::{
    DocumentConventions, Entity, Error, HttpMethod, HttpRequest, HttpResponse, MetadataDictionary,
    RequestExecutor, ResponseCache,
};
use docdb_query::QueryBuilder;
use lazy::{multi_get_body, parse_multi_get};
use operations::{LoadResponse, QueryResponse, detached, load_request, query_request};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use unit_of_work::Lookup;

/// Rounds of force-retried lazy requests before giving up.
const MAX_LAZY_RETRY_ROUNDS: usize = 3;

// ============================================================================
// Session Events
// ============================================================================

type BeforeStoreFn = Box<dyn FnMut(&BeforeStoreEvent<'_>) -> Result<(), Error> + Send>;
type AfterSaveChangesFn = Box<dyn FnMut(&AfterSaveChangesEvent<'_>) -> Result<(), Error> + Send>;
type BeforeDeleteFn = Box<dyn FnMut(&str) -> Result<(), Error> + Send>;
type BeforeQueryFn = Box<dyn FnMut(&mut QueryBuilder) -> Result<(), Error> + Send>;

/// Passed to `before_store` callbacks for every entity about to be written.
pub struct BeforeStoreEvent<'a> {
    id: &'a str,
    metadata: MetadataDictionary,
    entity: &'a TrackedEntity,
}

impl<'a> BeforeStoreEvent<'a> {
    pub(crate) fn new(id: &'a str, metadata: MetadataDictionary, entity: &'a TrackedEntity) -> Self {
        Self {
            id,
            metadata,
            entity,
        }
    }

    pub fn document_id(&self) -> &str {
        self.id
    }

    /// Metadata that will be sent with the document. Edits are included.
    pub fn metadata(&self) -> &MetadataDictionary {
        &self.metadata
    }

    /// The entity, if it is a `T`.
    pub fn entity<T: Entity>(&self) -> Option<EntityRef<T>> {
        self.entity.downcast()
    }
}

/// Passed to `after_save_changes` callbacks for every saved entity.
pub struct AfterSaveChangesEvent<'a> {
    id: &'a str,
    entity: Option<&'a TrackedEntity>,
}

impl<'a> AfterSaveChangesEvent<'a> {
    pub(crate) fn new(id: &'a str, entity: Option<&'a TrackedEntity>) -> Self {
        Self { id, entity }
    }

    pub fn document_id(&self) -> &str {
        self.id
    }

    pub fn entity<T: Entity>(&self) -> Option<EntityRef<T>> {
        self.entity.and_then(|e| e.downcast())
    }
}

/// Holds registered session-level event callbacks.
///
/// Callbacks run synchronously at fixed points of the unit-of-work
/// lifecycle. Returning `Err` aborts the operation; callbacks that run before
/// a request abort it before anything is sent.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_store: Vec<BeforeStoreFn>,
    after_save_changes: Vec<AfterSaveChangesFn>,
    before_delete: Vec<BeforeDeleteFn>,
    before_query: Vec<BeforeQueryFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_store", &self.before_store.len())
            .field("after_save_changes", &self.after_save_changes.len())
            .field("before_delete", &self.before_delete.len())
            .field("before_query", &self.before_query.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    pub(crate) fn fire_before_store(&mut self, event: &BeforeStoreEvent<'_>) -> Result<(), Error> {
        for cb in &mut self.before_store {
            cb(event)?;
        }
        Ok(())
    }

    pub(crate) fn fire_after_save_changes(
        &mut self,
        event: &AfterSaveChangesEvent<'_>,
    ) -> Result<(), Error> {
        for cb in &mut self.after_save_changes {
            cb(event)?;
        }
        Ok(())
    }

    pub(crate) fn fire_before_delete(&mut self, id: &str) -> Result<(), Error> {
        for cb in &mut self.before_delete {
            cb(id)?;
        }
        Ok(())
    }

    pub(crate) fn fire_before_query(&mut self, query: &mut QueryBuilder) -> Result<(), Error> {
        for cb in &mut self.before_query {
            cb(query)?;
        }
        Ok(())
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Per-session options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Database the session talks to. `None` sends paths unprefixed.
    pub database: Option<String>,
    /// Return detached entities and reject `store`.
    pub no_tracking: bool,
    /// Never use the response cache.
    pub no_caching: bool,
}

impl SessionOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }

    #[must_use]
    pub fn no_tracking(mut self, value: bool) -> Self {
        self.no_tracking = value;
        self
    }

    #[must_use]
    pub fn no_caching(mut self, value: bool) -> Self {
        self.no_caching = value;
        self
    }
}

// ============================================================================
// Document Store
// ============================================================================

/// Factory for sessions sharing one executor and one set of conventions.
///
/// Session ids come from a counter owned by the store.
pub struct DocumentStore<E: RequestExecutor> {
    executor: Arc<E>,
    conventions: Arc<DocumentConventions>,
    database: Option<String>,
    next_session_id: AtomicU64,
}

impl<E: RequestExecutor> std::fmt::Debug for DocumentStore<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("database", &self.database)
            .field("conventions", &self.conventions)
            .field("sessions_opened", &self.sessions_opened())
            .finish_non_exhaustive()
    }
}

impl<E: RequestExecutor> DocumentStore<E> {
    /// Create a store with default conventions.
    pub fn new(executor: E) -> Self {
        Self::with_conventions(executor, DocumentConventions::default())
    }

    pub fn with_conventions(executor: E, conventions: DocumentConventions) -> Self {
        Self {
            executor: Arc::new(executor),
            conventions: Arc::new(conventions),
            database: None,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Default database for sessions opened from this store.
    #[must_use]
    pub fn database(mut self, name: impl Into<String>) -> Self {
        self.database = Some(name.into());
        self
    }

    pub fn conventions(&self) -> &DocumentConventions {
        &self.conventions
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Number of sessions opened so far.
    pub fn sessions_opened(&self) -> u64 {
        self.next_session_id.load(Ordering::Relaxed) - 1
    }

    /// Open a session on the store's default database.
    pub fn open_session(&self) -> Session<E> {
        self.open_session_with(SessionOptions::default())
    }

    /// Open a session with explicit options.
    pub fn open_session_with(&self, mut options: SessionOptions) -> Session<E> {
        if options.database.is_none() {
            options.database.clone_from(&self.database);
        }
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, database = ?options.database, "Opening session");
        Session::new(
            id,
            Arc::clone(&self.executor),
            Arc::clone(&self.conventions),
            options,
        )
    }
}

// ============================================================================
// Session
// ============================================================================

/// The Session is the central unit-of-work manager.
///
/// It tracks documents loaded from or stored into the database and sends
/// changes back in one batch on [`save_changes`](Self::save_changes).
/// A session is meant to be used by one task at a time.
pub struct Session<E: RequestExecutor> {
    id: u64,
    executor: Arc<E>,
    conventions: Arc<DocumentConventions>,
    options: SessionOptions,
    uow: UnitOfWork,
    budget: RequestBudget,
    event_callbacks: SessionEventCallbacks,
    pending_lazy: Vec<Box<dyn LazyOperation>>,
}

impl<E: RequestExecutor> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("pending", &self.uow.pending_counts())
            .field("requests", &self.budget.count())
            .field("pending_lazy", &self.pending_lazy.len())
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

impl<E: RequestExecutor> Session<E> {
    /// Create a session. Usually called through [`DocumentStore::open_session`].
    pub fn new(
        id: u64,
        executor: Arc<E>,
        conventions: Arc<DocumentConventions>,
        options: SessionOptions,
    ) -> Self {
        let mut uow = UnitOfWork::new(Arc::clone(&conventions));
        uow.set_no_tracking(options.no_tracking);
        Self {
            id,
            executor,
            budget: RequestBudget::new(conventions.max_requests_per_session()),
            conventions,
            options,
            uow,
            event_callbacks: SessionEventCallbacks::default(),
            pending_lazy: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn conventions(&self) -> &DocumentConventions {
        &self.conventions
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback run for each entity about to be written.
    pub fn on_before_store(
        &mut self,
        f: impl FnMut(&BeforeStoreEvent<'_>) -> Result<(), Error> + Send + 'static,
    ) {
        self.event_callbacks.before_store.push(Box::new(f));
    }

    /// Register a callback run for each entity after a successful save.
    pub fn on_after_save_changes(
        &mut self,
        f: impl FnMut(&AfterSaveChangesEvent<'_>) -> Result<(), Error> + Send + 'static,
    ) {
        self.event_callbacks.after_save_changes.push(Box::new(f));
    }

    /// Register a callback run for each document id about to be deleted.
    pub fn on_before_delete(&mut self, f: impl FnMut(&str) -> Result<(), Error> + Send + 'static) {
        self.event_callbacks.before_delete.push(Box::new(f));
    }

    /// Register a callback that sees (and may change) every query before it
    /// is rendered.
    pub fn on_before_query(
        &mut self,
        f: impl FnMut(&mut QueryBuilder) -> Result<(), Error> + Send + 'static,
    ) {
        self.event_callbacks.before_query.push(Box::new(f));
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn scoped(&self, mut request: HttpRequest) -> HttpRequest {
        if let Some(database) = &self.options.database {
            request.path = format!("/databases/{}{}", database, request.path);
        }
        request
    }

    /// Count the request against the budget, then execute it.
    async fn send(
        &mut self,
        cx: &Cx,
        operation: &'static str,
        request: HttpRequest,
    ) -> Outcome<HttpResponse, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if let Err(e) = self.budget.record(operation) {
            return Outcome::Err(e);
        }
        let request = self.scoped(request);
        tracing::trace!(
            session = self.id,
            method = request.method.as_str(),
            url = %request.url(),
            "Sending request"
        );
        self.executor.execute(cx, &request).await
    }

    /// Requests sent by this session so far.
    pub fn number_of_requests(&self) -> usize {
        self.budget.count()
    }

    pub fn request_stats(&self) -> RequestStats {
        self.budget.stats()
    }

    /// Change the request budget for the rest of the session.
    pub fn set_max_number_of_requests(&mut self, max: usize) {
        self.budget.set_max(max);
    }

    // ========================================================================
    // Store / Delete
    // ========================================================================

    /// Track a new entity. Its id comes from the entity or, failing that,
    /// from the server on save.
    pub fn store<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<String, Error> {
        self.uow
            .store(entity, None, None, ConcurrencyCheckMode::Auto)
    }

    /// Track a new entity under `id`.
    pub fn store_with_id<T: Entity>(&mut self, entity: &EntityRef<T>, id: &str) -> Result<String, Error> {
        self.uow
            .store(entity, Some(id), None, ConcurrencyCheckMode::Auto)
    }

    /// Track an entity with an explicit concurrency check.
    ///
    /// `Some(cv)` requires the server document to be at `cv`; `None` disables
    /// the check for this entity.
    pub fn store_with_change_vector<T: Entity>(
        &mut self,
        entity: &EntityRef<T>,
        id: &str,
        change_vector: Option<&str>,
    ) -> Result<String, Error> {
        let mode = if change_vector.is_some() {
            ConcurrencyCheckMode::Forced
        } else {
            ConcurrencyCheckMode::Disabled
        };
        self.uow.store(entity, Some(id), change_vector, mode)
    }

    /// Mark a tracked entity for deletion.
    pub fn delete<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<(), Error> {
        self.uow.delete_entity(entity)
    }

    /// Delete a document by id, tracked or not.
    pub fn delete_by_id(&mut self, id: &str) -> Result<(), Error> {
        self.uow.delete_id(id, None)
    }

    /// Delete a document by id if it is at `change_vector`.
    pub fn delete_by_id_with_change_vector(&mut self, id: &str, change_vector: &str) -> Result<(), Error> {
        self.uow.delete_id(id, Some(change_vector))
    }

    /// Queue raw commands for the next `save_changes`.
    pub fn defer(&mut self, commands: Vec<CommandData>) -> Result<(), Error> {
        self.uow.defer(commands)
    }

    // ========================================================================
    // Tracking state
    // ========================================================================

    pub fn is_loaded(&self, id: &str) -> bool {
        self.uow.is_loaded(id)
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.uow.is_deleted(id)
    }

    pub fn get_document_id<T: Entity>(&self, entity: &EntityRef<T>) -> Result<String, Error> {
        self.uow.id_for(entity)
    }

    pub fn get_change_vector_for<T: Entity>(&self, entity: &EntityRef<T>) -> Result<Option<String>, Error> {
        self.uow.change_vector_for(entity)
    }

    pub fn get_metadata_for<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<MetadataDictionary, Error> {
        self.uow.metadata_for(entity)
    }

    pub fn has_changes(&self) -> Result<bool, Error> {
        self.uow.has_changes()
    }

    pub fn has_changed<T: Entity>(&self, entity: &EntityRef<T>) -> Result<bool, Error> {
        self.uow.has_changed(entity)
    }

    pub fn what_changed(&self) -> Result<BTreeMap<String, Vec<DocumentChange>>, Error> {
        self.uow.what_changed()
    }

    pub fn ignore_changes_for<T: Entity>(&mut self, entity: &EntityRef<T>) -> Result<(), Error> {
        self.uow.ignore_changes_for(entity)
    }

    pub fn evict<T: Entity>(&mut self, entity: &EntityRef<T>) {
        self.uow.evict(entity);
    }

    /// Forget every tracked document, deferred command and pending lazy
    /// operation.
    pub fn clear(&mut self) {
        self.uow.clear();
        self.pending_lazy.clear();
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.uow.pending_counts()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Load a document.
    ///
    /// Tracked and known-missing ids are answered without a request.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load<T: Entity>(&mut self, cx: &Cx, id: &str) -> Outcome<Option<EntityRef<T>>, Error> {
        match self.load_internal::<T>(cx, &[id.to_string()], &[]).await {
            Outcome::Ok(mut found) => Outcome::Ok(found.remove(id).flatten()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Load several documents in at most one request.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load_many<T: Entity>(
        &mut self,
        cx: &Cx,
        ids: &[&str],
    ) -> Outcome<BTreeMap<String, Option<EntityRef<T>>>, Error> {
        let ids: Vec<String> = ids.iter().map(|id| (*id).to_string()).collect();
        self.load_internal::<T>(cx, &ids, &[]).await
    }

    /// Load a document together with the documents its `includes` paths
    /// reference. Included documents are tracked and later loads of them
    /// need no request.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn load_with_includes<T: Entity>(
        &mut self,
        cx: &Cx,
        id: &str,
        includes: &[&str],
    ) -> Outcome<Option<EntityRef<T>>, Error> {
        let includes: Vec<String> = includes.iter().map(|p| (*p).to_string()).collect();
        match self
            .load_internal::<T>(cx, &[id.to_string()], &includes)
            .await
        {
            Outcome::Ok(mut found) => Outcome::Ok(found.remove(id).flatten()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn load_internal<T: Entity>(
        &mut self,
        cx: &Cx,
        ids: &[String],
        includes: &[String],
    ) -> Outcome<BTreeMap<String, Option<EntityRef<T>>>, Error> {
        if ids.iter().any(String::is_empty) {
            return Outcome::Err(Error::InvalidOperation(
                "Document id must not be empty".to_string(),
            ));
        }
        if self.uow.is_no_tracking() {
            return self.load_detached::<T>(cx, ids, includes).await;
        }

        let mut to_fetch: Vec<String> = Vec::new();
        for id in ids {
            match self.uow.lookup::<T>(id) {
                Ok(Lookup::Local(_)) => {}
                Ok(Lookup::Fetch) => {
                    if !to_fetch.contains(id) {
                        to_fetch.push(id.clone());
                    }
                }
                Err(e) => return Outcome::Err(e),
            }
        }

        if !to_fetch.is_empty() {
            tracing::debug!(count = to_fetch.len(), "Fetching documents");
            let request = load_request(&to_fetch, includes);
            let response = match self.send(cx, "load", request).await {
                Outcome::Ok(r) => r,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            if response.is_not_found() {
                for id in &to_fetch {
                    self.uow.mark_missing(id);
                }
            } else if !response.is_success() {
                return Outcome::Err(response.into_error());
            } else if let Err(e) = LoadResponse::parse(response.body, to_fetch.len())
                .and_then(|parsed| parsed.apply(&mut self.uow, &to_fetch))
            {
                return Outcome::Err(e);
            }
        }

        let mut found = BTreeMap::new();
        for id in ids {
            match self.uow.lookup::<T>(id) {
                Ok(Lookup::Local(entity)) => {
                    found.insert(id.clone(), entity);
                }
                Ok(Lookup::Fetch) => {
                    found.insert(id.clone(), None);
                }
                Err(e) => return Outcome::Err(e),
            }
        }
        Outcome::Ok(found)
    }

    async fn load_detached<T: Entity>(
        &mut self,
        cx: &Cx,
        ids: &[String],
        includes: &[String],
    ) -> Outcome<BTreeMap<String, Option<EntityRef<T>>>, Error> {
        let response = match self.send(cx, "load", load_request(ids, includes)).await {
            Outcome::Ok(r) => r,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if response.is_not_found() {
            return Outcome::Ok(ids.iter().map(|id| (id.clone(), None)).collect());
        }
        if !response.is_success() {
            return Outcome::Err(response.into_error());
        }
        let parsed = match LoadResponse::parse(response.body, ids.len()) {
            Ok(p) => p,
            Err(e) => return Outcome::Err(e),
        };

        let identity = self.conventions.identity_property_name();
        let mut found = BTreeMap::new();
        for (id, result) in ids.iter().zip(parsed.results) {
            let entity = match result.map(|doc| detached::<T>(doc, identity)).transpose() {
                Ok(entity) => entity,
                Err(e) => return Outcome::Err(e),
            };
            found.insert(id.clone(), entity);
        }
        Outcome::Ok(found)
    }

    // ========================================================================
    // Save
    // ========================================================================

    /// Send every pending change in one batch.
    ///
    /// Nothing is sent when nothing changed.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.id))]
    pub async fn save_changes(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let plan = match self.uow.prepare_save(&mut self.event_callbacks) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        if plan.is_empty() {
            tracing::debug!("No changes to save");
            return Outcome::Ok(());
        }

        tracing::debug!(commands = plan.batch.len(), "Sending batch");
        let request =
            HttpRequest::new(HttpMethod::Post, "/bulk_docs").with_body(plan.batch.to_request_body());
        let response = match self.send(cx, "save_changes", request).await {
            Outcome::Ok(r) => r,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if !response.is_success() {
            let error = response.into_error();
            if error.is_concurrency_conflict() {
                tracing::warn!(error = %error, "Batch rejected by concurrency check");
            }
            return Outcome::Err(error);
        }

        match self
            .uow
            .apply_batch_results(&plan, response.body, &mut self.event_callbacks)
        {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    // ========================================================================
    // Query
    // ========================================================================

    /// A query over the collection of `T`.
    pub fn query_collection<T: Entity>(&self) -> QueryBuilder {
        let collection = T::collection_name().map_or_else(
            || self.conventions.find_collection_name(T::type_name()),
            str::to_string,
        );
        self.apply_query_options(QueryBuilder::from_collection(&self.conventions, collection))
    }

    /// A query over a named index.
    pub fn query_index(&self, index: &str) -> QueryBuilder {
        self.apply_query_options(QueryBuilder::from_index(&self.conventions, index))
    }

    fn apply_query_options(&self, mut query: QueryBuilder) -> QueryBuilder {
        if self.options.no_tracking {
            query.no_tracking();
        }
        if self.options.no_caching {
            query.no_caching();
        }
        query
    }

    fn freeze_query(&mut self, query: &mut QueryBuilder) -> Result<docdb_query::IndexQuery, Error> {
        self.event_callbacks.fire_before_query(query)?;
        query.to_index_query()
    }

    fn is_tracking(&self, query: &QueryBuilder) -> bool {
        !query.is_no_tracking() && !self.uow.is_no_tracking()
    }

    /// Run a query. Tracked results share instances with the identity map.
    #[tracing::instrument(level = "debug", skip(self, cx, query))]
    pub async fn execute_query<T: Entity>(
        &mut self,
        cx: &Cx,
        mut query: QueryBuilder,
    ) -> Outcome<QueryResult<T>, Error> {
        let index_query = match self.freeze_query(&mut query) {
            Ok(q) => q,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(query = %index_query.query, "Executing query");

        let response = match self.send(cx, "query", query_request(&index_query)).await {
            Outcome::Ok(r) => r,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if !response.is_success() {
            return Outcome::Err(response.into_error());
        }

        let tracking = self.is_tracking(&query);
        match QueryResponse::parse(response.body)
            .and_then(|parsed| parsed.into_result::<T>(&mut self.uow, tracking))
        {
            Ok(result) => Outcome::Ok(result),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Number of documents matching a query.
    pub async fn count(&mut self, cx: &Cx, mut query: QueryBuilder) -> Outcome<u64, Error> {
        query.take(0);
        let index_query = match self.freeze_query(&mut query) {
            Ok(q) => q,
            Err(e) => return Outcome::Err(e),
        };
        let response = match self.send(cx, "query", query_request(&index_query)).await {
            Outcome::Ok(r) => r,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        if !response.is_success() {
            return Outcome::Err(response.into_error());
        }
        match QueryResponse::parse(response.body) {
            Ok(parsed) => Outcome::Ok(parsed.total_results),
            Err(e) => Outcome::Err(e),
        }
    }

    // ========================================================================
    // Lazy
    // ========================================================================

    /// Queue a lazy operation for the next flush.
    pub fn add_lazy_operation(&mut self, operation: Box<dyn LazyOperation>) {
        self.pending_lazy.push(operation);
    }

    pub fn pending_lazy_operations(&self) -> usize {
        self.pending_lazy.len()
    }

    /// Lazily load documents by id.
    pub fn lazily_load<T: Entity>(
        &mut self,
        ids: &[&str],
    ) -> LazyHandle<BTreeMap<String, Option<EntityRef<T>>>> {
        self.lazily_load_with_includes(ids, &[])
    }

    pub fn lazily_load_with_includes<T: Entity>(
        &mut self,
        ids: &[&str],
        includes: &[&str],
    ) -> LazyHandle<BTreeMap<String, Option<EntityRef<T>>>> {
        let (operation, handle) = LazyLoadOperation::<T>::new(
            ids.iter().map(|id| (*id).to_string()).collect(),
            includes.iter().map(|p| (*p).to_string()).collect(),
        );
        self.add_lazy_operation(Box::new(operation));
        handle
    }

    /// Lazily run a query.
    pub fn lazily_query<T: Entity>(
        &mut self,
        mut query: QueryBuilder,
    ) -> Result<LazyHandle<QueryResult<T>>, Error> {
        let index_query = self.freeze_query(&mut query)?;
        let tracking = self.is_tracking(&query);
        let (operation, handle) = LazyQueryOperation::<T>::new(index_query, tracking);
        self.add_lazy_operation(Box::new(operation));
        Ok(handle)
    }

    /// Lazily count the results of a query.
    pub fn lazily_count(&mut self, mut query: QueryBuilder) -> Result<LazyHandle<u64>, Error> {
        let index_query = self.freeze_query(&mut query)?;
        let (operation, handle) = LazyCountOperation::new(index_query);
        self.add_lazy_operation(Box::new(operation));
        Ok(handle)
    }

    /// Send every pending lazy operation in one multi-get.
    ///
    /// Operations answered from the session are resolved without a request.
    /// A sub-response flagged for retry (a `304` whose cache entry vanished)
    /// is re-sent in a follow-up round; its siblings keep their results. A
    /// failure of one operation is delivered only to its handle. When the
    /// multi-get itself fails or is cancelled, every operation in it fails.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(session = self.id))]
    pub async fn execute_pending_lazy_operations(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let mut pending = std::mem::take(&mut self.pending_lazy);
        let executor = Arc::clone(&self.executor);
        let cache = if self.options.no_caching {
            None
        } else {
            executor.cache()
        };

        for round in 0..=MAX_LAZY_RETRY_ROUNDS {
            let mut batch: Vec<(Box<dyn LazyOperation>, GetRequest)> = Vec::new();
            for mut operation in pending.drain(..) {
                if let Some(mut request) = operation.create_request(&mut self.uow) {
                    if let Some(cached) = cache.and_then(|c| c.get(&request.cache_key())) {
                        request.headers.insert(
                            "If-None-Match".to_string(),
                            format!("\"{}\"", cached.change_vector),
                        );
                    }
                    batch.push((operation, request));
                }
            }
            if batch.is_empty() {
                return Outcome::Ok(());
            }
            if round == MAX_LAZY_RETRY_ROUNDS {
                for (mut operation, request) in batch {
                    tracing::warn!(
                        operation = operation.name(),
                        url = %request.cache_key(),
                        "Lazy operation gave up after repeated retries"
                    );
                    operation.fail(Error::Custom(format!(
                        "Lazy {} operation still required a retry after {} rounds",
                        operation.name(),
                        MAX_LAZY_RETRY_ROUNDS
                    )));
                }
                return Outcome::Ok(());
            }

            tracing::debug!(round, operations = batch.len(), "Sending multi-get");
            let requests: Vec<GetRequest> = batch.iter().map(|(_, r)| r.clone()).collect();
            let request =
                HttpRequest::new(HttpMethod::Post, "/multi_get").with_body(multi_get_body(&requests));
            let response = match self.send(cx, "lazy", request).await {
                Outcome::Ok(r) => r,
                Outcome::Err(e) => {
                    fail_all(batch, &e);
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    for (mut operation, _) in batch {
                        operation.fail(Error::Cancelled);
                    }
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    fail_all(batch, &Error::Custom("Multi-get request panicked".to_string()));
                    return Outcome::Panicked(p);
                }
            };
            if !response.is_success() {
                let error = response.into_error();
                fail_all(batch, &error);
                return Outcome::Err(error);
            }
            let responses = match parse_multi_get(response.body, batch.len()) {
                Ok(r) => r,
                Err(e) => {
                    fail_all(batch, &e);
                    return Outcome::Err(e);
                }
            };

            for ((mut operation, request), mut sub) in batch.into_iter().zip(responses) {
                let key = request.cache_key();
                if sub.is_not_modified() {
                    match cache.and_then(|c| c.get(&key)) {
                        Some(cached) => {
                            sub.result = Some(cached.body);
                            sub.status_code = 200;
                        }
                        None => sub.force_retry = true,
                    }
                } else if sub.is_success() {
                    if let (Some(cache), Some(etag), Some(body)) =
                        (cache, sub.header("ETag"), sub.result.as_ref())
                    {
                        cache.set(&key, etag.trim_matches('"'), body.clone());
                    }
                }

                if sub.force_retry {
                    tracing::warn!(
                        operation = operation.name(),
                        url = %key,
                        "Lazy response must be retried, re-queueing"
                    );
                    pending.push(operation);
                    continue;
                }
                if !sub.is_success() && sub.status_code != 404 {
                    operation.fail(sub.to_error());
                    continue;
                }
                if let Err(e) = operation.handle_response(&mut self.uow, sub) {
                    tracing::debug!(operation = operation.name(), error = %e, "Lazy operation failed");
                    operation.fail(e);
                }
            }
        }

        Outcome::Ok(())
    }

    /// Get the value of a lazy handle, flushing pending operations first if
    /// it is not resolved yet.
    pub async fn resolve_lazy<T>(&mut self, cx: &Cx, handle: &LazyHandle<T>) -> Outcome<T, Error> {
        if !handle.is_resolved() {
            match self.execute_pending_lazy_operations(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        match handle.take() {
            Some(Ok(value)) => Outcome::Ok(value),
            Some(Err(e)) => Outcome::Err(e),
            None => Outcome::Err(Error::InvalidOperation(
                "Lazy value was already taken or its operation was never queued".to_string(),
            )),
        }
    }
}

fn fail_all(batch: Vec<(Box<dyn LazyOperation>, GetRequest)>, error: &Error) {
    for (mut operation, _) in batch {
        operation.fail(error.clone());
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use docdb_core::MemoryResponseCache;
    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        age: u32,
    }

    impl Entity for User {
        fn id(&self) -> Option<String> {
            self.id.clone()
        }

        fn set_id(&mut self, id: &str) {
            self.id = Some(id.to_string());
        }
    }

    fn user(name: &str) -> EntityRef<User> {
        entity_ref(User {
            id: None,
            name: name.to_string(),
            age: 30,
        })
    }

    #[derive(Default)]
    struct MockState {
        requests: Vec<HttpRequest>,
        replies: VecDeque<Result<HttpResponse, String>>,
    }

    struct MockExecutor {
        state: Arc<Mutex<MockState>>,
        cache: Option<MemoryResponseCache>,
    }

    impl MockExecutor {
        fn new(state: Arc<Mutex<MockState>>) -> Self {
            Self { state, cache: None }
        }

        fn with_cache(state: Arc<Mutex<MockState>>) -> Self {
            Self {
                state,
                cache: Some(MemoryResponseCache::new(16)),
            }
        }
    }

    impl RequestExecutor for MockExecutor {
        fn execute(
            &self,
            _cx: &Cx,
            request: &HttpRequest,
        ) -> impl Future<Output = Outcome<HttpResponse, Error>> + Send {
            let state = Arc::clone(&self.state);
            let request = request.clone();
            async move {
                let mut guard = state.lock().expect("lock poisoned");
                guard.requests.push(request);
                match guard.replies.pop_front() {
                    Some(Ok(response)) => Outcome::Ok(response),
                    Some(Err(message)) => Outcome::Err(Error::Custom(message)),
                    None => Outcome::Err(Error::Custom("no scripted reply".to_string())),
                }
            }
        }

        fn cache(&self) -> Option<&dyn ResponseCache> {
            self.cache.as_ref().map(|c| c as &dyn ResponseCache)
        }
    }

    fn reply(state: &Arc<Mutex<MockState>>, response: HttpResponse) {
        state.lock().unwrap().replies.push_back(Ok(response));
    }

    fn requests(state: &Arc<Mutex<MockState>>) -> Vec<HttpRequest> {
        state.lock().unwrap().requests.clone()
    }

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            Outcome::Ok(_) => panic!("expected an error"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn store_with(state: &Arc<Mutex<MockState>>) -> DocumentStore<MockExecutor> {
        DocumentStore::new(MockExecutor::new(Arc::clone(state))).database("shop")
    }

    fn user_doc(id: &str, name: &str, cv: &str) -> Value {
        json!({
            "name": name,
            "age": 30,
            "@metadata": { "@id": id, "@change-vector": cv, "@collection": "Users" }
        })
    }

    #[test]
    fn test_store_hands_out_increasing_session_ids() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let a = store.open_session();
        let b = store.open_session_with(SessionOptions::new().database("other"));
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(store.sessions_opened(), 2);
        assert_eq!(a.options().database.as_deref(), Some("shop"));
        assert_eq!(b.options().database.as_deref(), Some("other"));
    }

    #[test]
    fn test_session_event_callbacks_debug() {
        let mut callbacks = SessionEventCallbacks::default();
        callbacks.before_delete.push(Box::new(|_| Ok(())));
        let debug = format!("{callbacks:?}");
        assert!(debug.contains("before_delete: 1"));
    }

    #[test]
    fn test_save_changes_round_trip() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            let ann = user("Ann");
            session.store(&ann).unwrap();

            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [{
                    "Type": "PUT",
                    "@id": "users/9",
                    "@change-vector": "A:1-abc",
                    "@collection": "Users",
                    "@last-modified": "2024-01-01T00:00:00.0000000Z"
                }] })),
            );
            unwrap_outcome(session.save_changes(&cx).await);

            let sent = requests(&state);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].method, HttpMethod::Post);
            assert_eq!(sent[0].path, "/databases/shop/bulk_docs");
            let command = &sent[0].body.as_ref().unwrap()["Commands"][0];
            assert_eq!(command["Type"], json!("PUT"));
            assert_eq!(command["Id"], json!("users/"));

            assert_eq!(
                session.get_change_vector_for(&ann).unwrap().as_deref(),
                Some("A:1-abc")
            );
            let loaded = unwrap_outcome(session.load::<User>(&cx, "users/9").await).unwrap();
            assert!(Arc::ptr_eq(&loaded, &ann));

            // Idempotent: nothing changed, nothing sent.
            unwrap_outcome(session.save_changes(&cx).await);
            assert_eq!(requests(&state).len(), 1);
            assert_eq!(session.number_of_requests(), 1);
        });
    }

    #[test]
    fn test_load_known_missing_short_circuits() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            reply(&state, HttpResponse::ok(json!({ "Results": [null] })));
            assert!(unwrap_outcome(session.load::<User>(&cx, "users/404").await).is_none());
            assert!(unwrap_outcome(session.load::<User>(&cx, "users/404").await).is_none());
            assert_eq!(requests(&state).len(), 1);
            assert!(session.is_loaded("users/404"));

            reply(&state, HttpResponse::status(404));
            assert!(unwrap_outcome(session.load::<User>(&cx, "users/405").await).is_none());
            assert!(session.is_deleted("users/405"));
        });
    }

    #[test]
    fn test_load_many_fetches_only_unknown_ids() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [user_doc("users/1", "Ann", "A:1")] })),
            );
            unwrap_outcome(session.load::<User>(&cx, "users/1").await);

            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [user_doc("users/2", "Bob", "A:2"), null] })),
            );
            let found = unwrap_outcome(
                session
                    .load_many::<User>(&cx, &["users/1", "users/2", "users/3"])
                    .await,
            );
            assert_eq!(found.len(), 3);
            assert_eq!(found["users/2"].as_ref().unwrap().read().unwrap().name, "Bob");
            assert!(found["users/3"].is_none());

            let sent = requests(&state);
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[1].url(), "/databases/shop/docs?id=users%2F2&id=users%2F3");
        });
    }

    #[test]
    fn test_load_with_includes_tracks_included_documents() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            reply(
                &state,
                HttpResponse::ok(json!({
                    "Results": [user_doc("users/1", "Ann", "A:1")],
                    "Includes": { "users/2": user_doc("users/2", "Bob", "A:2") }
                })),
            );
            unwrap_outcome(
                session
                    .load_with_includes::<User>(&cx, "users/1", &["Friend"])
                    .await,
            );
            assert!(requests(&state)[0].url().ends_with("&include=Friend"));

            let bob = unwrap_outcome(session.load::<User>(&cx, "users/2").await).unwrap();
            assert_eq!(bob.read().unwrap().name, "Bob");
            assert_eq!(requests(&state).len(), 1);
        });
    }

    #[test]
    fn test_modified_entity_is_saved_with_change_vector() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = DocumentStore::with_conventions(
            MockExecutor::new(Arc::clone(&state)),
            DocumentConventions::default().use_optimistic_concurrency(true),
        );
        let mut session = store.open_session();

        rt.block_on(async {
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [user_doc("users/1", "Ann", "A:1")] })),
            );
            let ann = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
            assert!(!session.has_changes().unwrap());

            ann.write().unwrap().age = 31;
            let changes = session.what_changed().unwrap();
            assert_eq!(changes["users/1"][0].field_name, "age");

            reply(
                &state,
                HttpResponse::status(409)
                    .with_header("Content-Type", "application/json"),
            );
            let err = expect_err(session.save_changes(&cx).await);
            assert!(err.is_concurrency_conflict());

            let sent = requests(&state);
            let command = &sent[1].body.as_ref().unwrap()["Commands"][0];
            assert_eq!(sent[1].path, "/bulk_docs");
            assert_eq!(command["ChangeVector"], json!("A:1"));
            assert_eq!(command["Document"]["age"], json!(31));
            // Still pending after a failed save.
            assert!(session.has_changed(&ann).unwrap());
        });
    }

    #[test]
    fn test_save_changes_protocol_violation_leaves_state() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            let ann = user("Ann");
            session.store_with_id(&ann, "users/1").unwrap();
            reply(&state, HttpResponse::ok(json!({ "Nope": [] })));
            let err = expect_err(session.save_changes(&cx).await);
            assert!(err.is_protocol_violation());
            assert!(session.get_change_vector_for(&ann).unwrap().is_none());
        });
    }

    #[test]
    fn test_callbacks_fire_in_order_and_can_abort() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();
        let log = Arc::new(Mutex::new(Vec::<String>::new()));

        let seen = Arc::clone(&log);
        session.on_before_store(move |event| {
            event.metadata().set("stamped", true);
            if let Some(user) = event.entity::<User>() {
                user.write().unwrap().age = 99;
            }
            seen.lock().unwrap().push(format!("before_store {}", event.document_id()));
            Ok(())
        });
        let seen = Arc::clone(&log);
        session.on_after_save_changes(move |event| {
            seen.lock().unwrap().push(format!("after_save {}", event.document_id()));
            Ok(())
        });

        rt.block_on(async {
            let ann = user("Ann");
            session.store_with_id(&ann, "users/1").unwrap();
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [{
                    "Type": "PUT", "@id": "users/1", "@change-vector": "A:1"
                }] })),
            );
            unwrap_outcome(session.save_changes(&cx).await);

            let sent = requests(&state);
            let document = &sent[0].body.as_ref().unwrap()["Commands"][0]["Document"];
            assert_eq!(document["age"], json!(99));
            assert_eq!(document["@metadata"]["stamped"], json!(true));
            assert_eq!(
                *log.lock().unwrap(),
                vec!["before_store users/1".to_string(), "after_save users/1".to_string()]
            );
            assert_eq!(
                session.get_metadata_for(&ann).unwrap().get("stamped"),
                Some(json!(true))
            );
        });

        session.on_before_delete(|id| Err(Error::Custom(format!("refusing to delete {id}"))));
        rt.block_on(async {
            session.delete_by_id("users/2").unwrap();
            let err = expect_err(session.save_changes(&cx).await);
            assert!(matches!(err, Error::Custom(_)));
            assert_eq!(requests(&state).len(), 1);
        });
    }

    #[test]
    fn test_failing_after_save_callback_does_not_resend_the_batch() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();
        session.on_after_save_changes(|event| {
            Err(Error::Custom(format!("could not index {}", event.document_id())))
        });

        rt.block_on(async {
            let ann = user("Ann");
            session.store_with_id(&ann, "users/1").unwrap();
            session
                .defer(vec![CommandData::patch(
                    "users/2",
                    PatchRequest::new("this.age += 1"),
                )])
                .unwrap();
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [
                    { "Type": "PUT", "@id": "users/1", "@change-vector": "A:1" },
                    { "Type": "PATCH", "Id": "users/2", "ChangeVector": "A:2" }
                ] })),
            );
            let err = expect_err(session.save_changes(&cx).await);
            assert_eq!(err.to_string(), "could not index users/1");
            assert_eq!(
                session.get_change_vector_for(&ann).unwrap().as_deref(),
                Some("A:1")
            );
            assert_eq!(session.pending_counts().deferred, 0);

            // The server already committed both commands.
            unwrap_outcome(session.save_changes(&cx).await);
            assert_eq!(requests(&state).len(), 1);
        });
    }

    #[test]
    fn test_request_budget_is_enforced() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = DocumentStore::with_conventions(
            MockExecutor::new(Arc::clone(&state)),
            DocumentConventions::default().max_number_of_requests_per_session(1),
        );
        let mut session = store.open_session();

        rt.block_on(async {
            reply(&state, HttpResponse::ok(json!({ "Results": [null] })));
            unwrap_outcome(session.load::<User>(&cx, "users/1").await);
            let err = expect_err(session.load::<User>(&cx, "users/2").await);
            assert!(matches!(err, Error::RequestBudgetExceeded(_)));
            // The rejected request was never sent.
            assert_eq!(requests(&state).len(), 1);
        });
    }

    #[test]
    fn test_query_execution_and_before_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();
        session.on_before_query(|query| {
            query.wait_for_non_stale_results();
            Ok(())
        });

        rt.block_on(async {
            let mut query = session.query_collection::<User>();
            query.where_equals("name", "Ann").unwrap();

            reply(
                &state,
                HttpResponse::ok(json!({
                    "Results": [user_doc("users/1", "Ann", "A:1")],
                    "TotalResults": 1,
                    "IsStale": false
                })),
            );
            let result = unwrap_outcome(session.execute_query::<User>(&cx, query).await);
            assert_eq!(result.len(), 1);

            let sent = requests(&state);
            assert_eq!(sent[0].path, "/databases/shop/queries");
            let body = sent[0].body.as_ref().unwrap();
            assert_eq!(body["Query"], json!("from Users where name = $p0"));
            assert_eq!(body["QueryParameters"]["p0"], json!("Ann"));
            assert_eq!(body["WaitForNonStaleResults"], json!(true));

            // The result is tracked.
            let same = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
            assert!(Arc::ptr_eq(&same, &result.results[0]));

            reply(&state, HttpResponse::ok(json!({ "Results": [], "TotalResults": 42 })));
            let count = unwrap_outcome(session.count(&cx, session.query_collection::<User>()).await);
            assert_eq!(count, 42);
            assert_eq!(requests(&state)[1].body.as_ref().unwrap()["PageSize"], json!(0));
        });
    }

    #[test]
    fn test_no_tracking_session() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session_with(SessionOptions::new().no_tracking(true));

        rt.block_on(async {
            assert!(session.store(&user("Ann")).is_err());
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [user_doc("users/1", "Ann", "A:1")] })),
            );
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [user_doc("users/1", "Ann", "A:1")] })),
            );
            let a = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
            let b = unwrap_outcome(session.load::<User>(&cx, "users/1").await).unwrap();
            assert!(!Arc::ptr_eq(&a, &b));
            assert_eq!(a.read().unwrap().id.as_deref(), Some("users/1"));
            assert_eq!(requests(&state).len(), 2);
        });
    }

    #[test]
    fn test_lazy_operations_share_one_request() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            let users = session.lazily_load::<User>(&["users/1"]);
            let count = session
                .lazily_count(session.query_collection::<User>())
                .unwrap();
            assert_eq!(session.pending_lazy_operations(), 2);

            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [
                    { "Result": { "Results": [user_doc("users/1", "Ann", "A:1")] }, "StatusCode": 200 },
                    { "Result": { "Results": [], "TotalResults": 7 }, "StatusCode": 200 }
                ] })),
            );
            let loaded = unwrap_outcome(session.resolve_lazy(&cx, &users).await);
            assert!(loaded["users/1"].is_some());
            assert_eq!(unwrap_outcome(session.resolve_lazy(&cx, &count).await), 7);

            let sent = requests(&state);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].path, "/databases/shop/multi_get");
            let body = sent[0].body.as_ref().unwrap();
            assert_eq!(body["Requests"][0]["Url"], json!("/docs"));
            assert_eq!(body["Requests"][1]["Url"], json!("/queries"));
            assert_eq!(session.pending_lazy_operations(), 0);

            // Now tracked: resolves without a request.
            let again = session.lazily_load::<User>(&["users/1"]);
            unwrap_outcome(session.execute_pending_lazy_operations(&cx).await);
            assert!(again.take().unwrap().unwrap()["users/1"].is_some());
            assert_eq!(requests(&state).len(), 1);
        });
    }

    #[test]
    fn test_lazy_failure_is_isolated() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            let broken = session
                .lazily_query::<User>(session.query_collection::<User>())
                .unwrap();
            let users = session.lazily_load::<User>(&["users/1"]);

            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [
                    { "Result": { "NotResults": true }, "StatusCode": 200 },
                    { "Result": { "Results": [user_doc("users/1", "Ann", "A:1")] }, "StatusCode": 200 }
                ] })),
            );
            unwrap_outcome(session.execute_pending_lazy_operations(&cx).await);

            assert!(broken.take().unwrap().unwrap_err().is_protocol_violation());
            let loaded = users.take().unwrap().unwrap();
            assert_eq!(loaded["users/1"].as_ref().unwrap().read().unwrap().name, "Ann");
        });
    }

    #[test]
    fn test_lazy_transport_error_fails_every_operation() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            let a = session.lazily_load::<User>(&["users/1"]);
            let b = session.lazily_load::<User>(&["users/2"]);
            state
                .lock()
                .unwrap()
                .replies
                .push_back(Err("connection reset".to_string()));
            let err = expect_err(session.execute_pending_lazy_operations(&cx).await);
            assert_eq!(err.to_string(), "connection reset");
            assert!(a.take().unwrap().is_err());
            assert!(b.take().unwrap().is_err());
        });
    }

    #[test]
    fn test_lazy_budget_overrun_reaches_every_handle() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();
        session.set_max_number_of_requests(0);

        rt.block_on(async {
            let users = session.lazily_load::<User>(&["users/1"]);
            let count = session
                .lazily_count(session.query_collection::<User>())
                .unwrap();
            let err = expect_err(session.execute_pending_lazy_operations(&cx).await);
            assert!(matches!(err, Error::RequestBudgetExceeded(_)));

            let err = users.take().unwrap().unwrap_err();
            assert!(matches!(err, Error::RequestBudgetExceeded(ref e) if e.max_requests == 0));
            let err = count.take().unwrap().unwrap_err();
            assert!(matches!(err, Error::RequestBudgetExceeded(_)));
            assert!(requests(&state).is_empty());
        });
    }

    #[test]
    fn test_lazy_server_error_keeps_its_status() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            let a = session.lazily_load::<User>(&["users/1"]);
            let b = session.lazily_load::<User>(&["users/2"]);
            reply(&state, HttpResponse::status(503));
            let err = expect_err(session.execute_pending_lazy_operations(&cx).await);
            assert!(err.is_retryable());

            for handle in [a, b] {
                match handle.take().unwrap() {
                    Err(Error::Server(e)) => assert_eq!(e.status, 503),
                    other => panic!("expected a server error, got {other:?}"),
                }
            }
        });
    }

    #[test]
    fn test_lazy_cancellation_fails_every_operation() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        cx.set_cancel_reason(asupersync::CancelReason::user("shutting down"));

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = store_with(&state);
        let mut session = store.open_session();

        rt.block_on(async {
            let users = session.lazily_load::<User>(&["users/1"]);
            let count = session
                .lazily_count(session.query_collection::<User>())
                .unwrap();
            match session.execute_pending_lazy_operations(&cx).await {
                Outcome::Cancelled(_) => {}
                other => panic!("expected cancellation, got {other:?}"),
            }
            assert!(matches!(users.take().unwrap(), Err(Error::Cancelled)));
            assert!(matches!(count.take().unwrap(), Err(Error::Cancelled)));
            assert!(requests(&state).is_empty());
            assert_eq!(session.number_of_requests(), 0);
        });
    }

    #[test]
    fn test_lazy_not_modified_uses_cache_and_retries_when_evicted() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let state = Arc::new(Mutex::new(MockState::default()));
        let store = DocumentStore::new(MockExecutor::with_cache(Arc::clone(&state)));
        let mut session = store.open_session();
        let cached_body = json!({ "Results": [], "TotalResults": 3 });

        rt.block_on(async {
            let query = session.query_collection::<User>();
            let hash = query.query_hash().unwrap();
            let key = format!("/queries?queryHash={hash}");
            store.executor().cache().unwrap().set(&key, "A:1", cached_body);

            // Served from the cache on 304.
            let count = session.lazily_query::<User>(query).unwrap();
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [
                    { "Result": null, "StatusCode": 304 }
                ] })),
            );
            let result = unwrap_outcome(session.resolve_lazy(&cx, &count).await);
            assert_eq!(result.total_results, 3);
            let sent = requests(&state);
            assert_eq!(
                sent[0].body.as_ref().unwrap()["Requests"][0]["Headers"]["If-None-Match"],
                json!("\"A:1\"")
            );

            // A 304 after the entry vanished is retried without the header.
            let count = session
                .lazily_query::<User>(session.query_collection::<User>())
                .unwrap();
            let users = session.lazily_load::<User>(&["users/1"]);
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [
                    { "Result": null, "StatusCode": 304 },
                    { "Result": { "Results": [null] }, "StatusCode": 200 }
                ] })),
            );
            store.executor().cache().unwrap().remove(&key);
            reply(
                &state,
                HttpResponse::ok(json!({ "Results": [
                    { "Result": { "Results": [], "TotalResults": 4 }, "StatusCode": 200,
                      "Headers": { "ETag": "\"A:2\"" } }
                ] })),
            );
            unwrap_outcome(session.execute_pending_lazy_operations(&cx).await);
            assert!(users.take().unwrap().unwrap()["users/1"].is_none());
            assert_eq!(count.take().unwrap().unwrap().total_results, 4);
            assert_eq!(requests(&state).len(), 3);
            let cached = store.executor().cache().unwrap().get(&key).unwrap();
            assert_eq!(cached.change_vector, "A:2");
        });
    }
}
