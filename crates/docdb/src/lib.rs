//! docdb - client-side unit of work and query builder for a document database.
//!
//! docdb provides the runtime a document-database driver needs between the
//! application and the wire:
//!
//! - Sessions with an identity map and structural change tracking
//! - One batch request per `save_changes`
//! - A fluent query builder that renders query text with positional parameters
//! - Lazy reads merged into a single multi-get round trip
//! - A per-session request budget
//!
//! The transport is not part of this crate. Anything implementing
//! [`RequestExecutor`] can carry the requests.
//!
//! # Quick Start
//!
//! ```ignore
//! use docdb::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Hero {
//!     #[serde(default)]
//!     id: Option<String>,
//!     name: String,
//!     age: Option<i32>,
//! }
//!
//! impl Entity for Hero {
//!     fn id(&self) -> Option<String> {
//!         self.id.clone()
//!     }
//!
//!     fn set_id(&mut self, id: &str) {
//!         self.id = Some(id.to_string());
//!     }
//! }
//!
//! async fn main_example(cx: &Cx, executor: impl RequestExecutor) {
//!     let store = DocumentStore::new(executor).database("heroes");
//!     let mut session = store.open_session();
//!
//!     // Store
//!     let hero = entity_ref(Hero { id: None, name: "Spider-Man".into(), age: Some(25) });
//!     session.store(&hero).unwrap();
//!     session.save_changes(cx).await;
//!
//!     // Query
//!     let mut query = session.query_collection::<Hero>();
//!     query.where_greater_than("age", 18).unwrap();
//!     let heroes = session.execute_query::<Hero>(cx, query).await;
//!
//!     // Update: change the entity, save again
//!     hero.write().unwrap().age = Some(26);
//!     session.save_changes(cx).await;
//!
//!     // Delete
//!     session.delete(&hero).unwrap();
//!     session.save_changes(cx).await;
//! }
//! ```
//!
//! # Features
//!
//! - **Identity**: one instance per document id within a session
//! - **Structured concurrency**: built on asupersync for cancel-correct operations
//! - **Optimistic concurrency**: change vectors sent per document when enabled
//! - **Round-trip economy**: batched writes, multi-get reads, includes

// Re-export all public types from sub-crates
pub use docdb_core::{
    // asupersync re-exports
    Budget,
    // Core types
    CachedResponse,
    ConcurrencyError,
    Cx,
    DocumentConventions,
    Entity,
    Error,
    HttpMethod,
    HttpRequest,
    HttpResponse,
    IdentityConflictKind,
    MemoryResponseCache,
    MetadataDictionary,
    Outcome,
    QueryBuilderErrorKind,
    QueryOperator,
    RegionId,
    RequestExecutor,
    ResponseCache,
    Result,
    TaskId,
};

pub use docdb_query::{
    IndexQuery, OrderingType, QueryBuilder, SpatialRelation, SpatialUnits, WhereOperator,
};

pub use docdb_session::{
    AfterSaveChangesEvent, BeforeStoreEvent, ChangeType, CommandData, CommandType,
    ConcurrencyCheckMode, DocumentChange, DocumentStore, EntityRef, LazyHandle, LazyOperation,
    PatchRequest, QueryResult, RequestStats, Session, SessionOptions, entity_ref,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use docdb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Budget,
        // Batch commands
        CommandData,
        Cx,
        // Configuration
        DocumentConventions,
        // Session
        DocumentStore,
        // Core traits and types
        Entity,
        EntityRef,
        Error,
        LazyHandle,
        MetadataDictionary,
        OrderingType,
        Outcome,
        PatchRequest,
        // Query building
        QueryBuilder,
        QueryOperator,
        QueryResult,
        RegionId,
        RequestExecutor,
        Result,
        Session,
        SessionOptions,
        TaskId,
        entity_ref,
    };
}
