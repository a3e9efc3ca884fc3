//! Error types for docdb operations.

use std::fmt;
use std::sync::Arc;

/// The primary error type for all docdb operations.
#[derive(Debug, Clone)]
pub enum Error {
    /// A second live entity was associated with an already tracked identifier
    IdentityConflict(IdentityConflictError),
    /// Malformed or missing fields in a server response
    Protocol(ProtocolError),
    /// A write was rejected because its change-vector precondition failed
    Concurrency(ConcurrencyError),
    /// Invalid use of the query builder, detected before any request is sent
    QueryBuilder(QueryBuilderError),
    /// The session issued more requests than its configured budget allows
    RequestBudgetExceeded(RequestBudgetError),
    /// An operation that is not valid in the current session state
    InvalidOperation(String),
    /// Non-success status returned by the server
    Server(ServerError),
    /// Entity (de)serialization errors
    Serde(String),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IdentityConflictError {
    pub kind: IdentityConflictKind,
    pub id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityConflictKind {
    /// Another entity instance is already tracked under this id
    NonUniqueInstance,
    /// The entity is already tracked under a different id
    AlreadyTrackedUnderOtherId,
    /// The entity was deleted earlier in this session
    StoreAfterDelete,
}

#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ConcurrencyError {
    pub id: Option<String>,
    pub expected_change_vector: Option<String>,
    pub actual_change_vector: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct QueryBuilderError {
    pub kind: QueryBuilderErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryBuilderErrorKind {
    /// Open/close subclause calls do not balance
    UnbalancedClause,
    /// AND/OR placed where an operator is not allowed
    MisplacedOperator,
    /// Boost, fuzzy or proximity not attached to a predicate
    MisplacedModifier,
    /// Modifier value out of range
    InvalidModifierValue,
    /// Builder mutation attempted after a raw query was set, or vice versa
    RawQuery,
    /// Invalid or duplicate parameter name
    InvalidParameter,
    /// Invalid field, collection or index usage
    InvalidUsage,
}

#[derive(Debug, Clone)]
pub struct RequestBudgetError {
    pub max_requests: usize,
}

#[derive(Debug, Clone)]
pub struct ServerError {
    pub status: u16,
    pub message: String,
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Nothing this core detects is retried automatically: conflicts must be
    /// resolved by the caller and protocol/builder errors are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Server(s) => matches!(s.status, 502..=504),
            _ => false,
        }
    }

    /// Is this an optimistic-concurrency conflict?
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Error::Concurrency(_))
    }

    /// Is this a malformed server response?
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Is this an identity conflict?
    pub fn is_identity_conflict(&self) -> bool {
        matches!(self, Error::IdentityConflict(_))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: None,
        })
    }

    /// Create a protocol violation error.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::protocol(message)
    }

    /// Create a protocol violation error that keeps the offending payload.
    pub fn protocol_with_data(message: impl Into<String>, raw: serde_json::Value) -> Self {
        Error::Protocol(ProtocolError {
            message: message.into(),
            raw_data: Some(raw),
        })
    }

    /// Create a query builder error.
    pub fn query_builder(kind: QueryBuilderErrorKind, message: impl Into<String>) -> Self {
        Error::QueryBuilder(QueryBuilderError {
            kind,
            message: message.into(),
        })
    }

    /// Create an identity conflict error.
    pub fn identity_conflict(
        kind: IdentityConflictKind,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::IdentityConflict(IdentityConflictError {
            kind,
            id: id.into(),
            message: message.into(),
        })
    }

    /// Get the query builder error kind, if this is one.
    pub fn query_builder_kind(&self) -> Option<QueryBuilderErrorKind> {
        match self {
            Error::QueryBuilder(q) => Some(q.kind),
            _ => None,
        }
    }

    /// Get the identity conflict kind, if this is one.
    pub fn identity_conflict_kind(&self) -> Option<IdentityConflictKind> {
        match self {
            Error::IdentityConflict(c) => Some(c.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::IdentityConflict(e) => write!(f, "Identity conflict on '{}': {}", e.id, e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Concurrency(e) => write!(f, "Concurrency conflict: {}", e),
            Error::QueryBuilder(e) => write!(f, "Query builder error: {}", e.message),
            Error::RequestBudgetExceeded(e) => write!(f, "{}", e),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::Server(e) => write!(f, "Server error (status {}): {}", e.status, e.message),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Server(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for IdentityConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConcurrencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.id, &self.expected_change_vector, &self.actual_change_vector) {
            (Some(id), Some(expected), Some(actual)) => write!(
                f,
                "{} (document '{}', expected change vector '{}', actual '{}')",
                self.message, id, expected, actual
            ),
            (Some(id), _, _) => write!(f, "{} (document '{}')", self.message, id),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for QueryBuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for RequestBudgetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "The maximum number of requests ({}) allowed for this session has been reached. \
             Reduce the number of remote calls: batch loads, use includes or lazy operations, \
             or raise max_number_of_requests_per_session",
            self.max_requests
        )
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status)
    }
}

impl From<IdentityConflictError> for Error {
    fn from(err: IdentityConflictError) -> Self {
        Error::IdentityConflict(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConcurrencyError> for Error {
    fn from(err: ConcurrencyError) -> Self {
        Error::Concurrency(err)
    }
}

impl From<QueryBuilderError> for Error {
    fn from(err: QueryBuilderError) -> Self {
        Error::QueryBuilder(err)
    }
}

impl From<RequestBudgetError> for Error {
    fn from(err: RequestBudgetError) -> Self {
        Error::RequestBudgetExceeded(err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for docdb operations.
pub type Result<T> = std::result::Result<T, Error>;
