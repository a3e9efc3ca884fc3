//! Entity trait for mapping Rust structs to stored documents.
//!
//! An entity is any `serde` type. The session serializes it to a JSON object
//! (minus the identity property) and deserializes documents back into it.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A type that can be stored as a document.
///
/// Every method has a default, so most entities only need an empty impl:
///
/// ```
/// use docdb_core::Entity;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     id: Option<String>,
///     name: String,
/// }
///
/// impl Entity for User {
///     fn id(&self) -> Option<String> {
///         self.id.clone()
///     }
///
///     fn set_id(&mut self, id: &str) {
///         self.id = Some(id.to_string());
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Explicit collection name. `None` defers to the conventions.
    fn collection_name() -> Option<&'static str> {
        None
    }

    /// The id currently held by the entity, if it carries one.
    fn id(&self) -> Option<String> {
        None
    }

    /// Write back the id assigned by the session or the server.
    fn set_id(&mut self, _id: &str) {}

    /// Rust type name recorded in metadata.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}
