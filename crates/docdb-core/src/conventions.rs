//! Document conventions: client-side configuration shared by every session
//! opened from one document store.

use std::fmt;
use std::sync::Arc;

/// Default boolean operator used to join consecutive query predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOperator {
    #[default]
    And,
    Or,
}

impl QueryOperator {
    /// Keyword used in query text.
    pub const fn as_str(self) -> &'static str {
        match self {
            QueryOperator::And => "and",
            QueryOperator::Or => "or",
        }
    }
}

type CollectionNameFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Client conventions.
///
/// # Example
///
/// ```
/// use docdb_core::DocumentConventions;
///
/// let conventions = DocumentConventions::default()
///     .max_number_of_requests_per_session(50)
///     .use_optimistic_concurrency(true);
/// assert_eq!(conventions.max_requests_per_session(), 50);
/// assert_eq!(conventions.find_collection_name("my_app::model::Company"), "Companies");
/// ```
#[derive(Clone)]
pub struct DocumentConventions {
    max_requests_per_session: usize,
    optimistic_concurrency: bool,
    identity_parts_separator: char,
    identity_property: String,
    default_query_operator: QueryOperator,
    rust_type_metadata_key: String,
    collection_name: Option<CollectionNameFn>,
}

impl fmt::Debug for DocumentConventions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentConventions")
            .field("max_requests_per_session", &self.max_requests_per_session)
            .field("optimistic_concurrency", &self.optimistic_concurrency)
            .field("identity_parts_separator", &self.identity_parts_separator)
            .field("identity_property", &self.identity_property)
            .field("default_query_operator", &self.default_query_operator)
            .field("rust_type_metadata_key", &self.rust_type_metadata_key)
            .field("custom_collection_name", &self.collection_name.is_some())
            .finish()
    }
}

impl Default for DocumentConventions {
    fn default() -> Self {
        Self {
            max_requests_per_session: 30,
            optimistic_concurrency: false,
            identity_parts_separator: '/',
            identity_property: "id".to_string(),
            default_query_operator: QueryOperator::And,
            rust_type_metadata_key: "Raven-Rust-Type".to_string(),
            collection_name: None,
        }
    }
}

impl DocumentConventions {
    /// Create conventions with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of requests a single session may issue.
    pub fn max_number_of_requests_per_session(mut self, n: usize) -> Self {
        self.max_requests_per_session = n;
        self
    }

    /// Enable/disable optimistic concurrency for new sessions.
    pub fn use_optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.optimistic_concurrency = enabled;
        self
    }

    /// Set the identity parts separator (default `/`).
    pub fn identity_parts_separator(mut self, separator: char) -> Self {
        self.identity_parts_separator = separator;
        self
    }

    /// Set the entity property holding the document id (default `id`).
    pub fn identity_property(mut self, name: impl Into<String>) -> Self {
        self.identity_property = name.into();
        self
    }

    /// Set the operator used between consecutive predicates.
    pub fn default_query_operator(mut self, op: QueryOperator) -> Self {
        self.default_query_operator = op;
        self
    }

    /// Set the metadata key that records the Rust type of stored entities.
    pub fn rust_type_metadata_key(mut self, key: impl Into<String>) -> Self {
        self.rust_type_metadata_key = key.into();
        self
    }

    /// Override how Rust type names map to collection names.
    pub fn collection_name_fn(mut self, f: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.collection_name = Some(Arc::new(f));
        self
    }

    pub fn max_requests_per_session(&self) -> usize {
        self.max_requests_per_session
    }

    pub fn is_optimistic_concurrency(&self) -> bool {
        self.optimistic_concurrency
    }

    pub fn separator(&self) -> char {
        self.identity_parts_separator
    }

    pub fn identity_property_name(&self) -> &str {
        &self.identity_property
    }

    pub fn query_operator(&self) -> QueryOperator {
        self.default_query_operator
    }

    pub fn rust_type_key(&self) -> &str {
        &self.rust_type_metadata_key
    }

    /// Resolve the collection name for a Rust type name.
    pub fn find_collection_name(&self, type_name: &str) -> String {
        match &self.collection_name {
            Some(f) => f(type_name),
            None => default_collection_name(type_name),
        }
    }

    /// Prefix used for ids the server completes, e.g. `users/`.
    pub fn id_prefix(&self, collection: &str) -> String {
        format!(
            "{}{}",
            collection.to_lowercase(),
            self.identity_parts_separator
        )
    }
}

/// Default type → collection mapping: last path segment, generic arguments
/// dropped, simple English pluralization.
pub fn default_collection_name(type_name: &str) -> String {
    let without_generics = type_name.split('<').next().unwrap_or(type_name);
    let short = without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics);
    pluralize(short)
}

fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }
    let lower = word.to_lowercase();
    if lower.ends_with('y')
        && !lower.ends_with("ay")
        && !lower.ends_with("ey")
        && !lower.ends_with("oy")
        && !lower.ends_with("uy")
    {
        return format!("{}ies", &word[..word.len() - 1]);
    }
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{word}es");
    }
    format!("{word}s")
}
