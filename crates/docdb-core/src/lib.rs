//! Core types and traits for the docdb client.
//!
//! This crate provides the foundations shared by the query builder and the
//! session:
//!
//! - `Entity` trait for mapping serde types to documents
//! - `DocumentConventions` for client-side configuration
//! - `MetadataDictionary` for dirty-tracked document metadata
//! - `RequestExecutor` trait for the consumed transport capability
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod cache;
pub mod conventions;
pub mod entity;
pub mod error;
pub mod executor;
pub mod identifiers;
pub mod metadata;

pub use cache::{CachedResponse, MemoryResponseCache, ResponseCache};
pub use conventions::{DocumentConventions, QueryOperator, default_collection_name};
pub use entity::Entity;
pub use error::{
    ConcurrencyError, Error, IdentityConflictError, IdentityConflictKind, ProtocolError,
    QueryBuilderError, QueryBuilderErrorKind, RequestBudgetError, Result, ServerError,
};
pub use executor::{HttpMethod, HttpRequest, HttpResponse, RequestExecutor};
pub use identifiers::{
    SERVER_IDENTITY_SUFFIX, escape_field_if_necessary, escape_include, is_prefix_id,
    is_valid_parameter_name, normalize_id,
};
pub use metadata::MetadataDictionary;
