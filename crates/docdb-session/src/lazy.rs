//! Lazy batching of reads.
//!
//! A lazy operation describes one read as a [`GetRequest`] plus a handler
//! for its slice of the reply. Pending operations are flushed together as a
//! single `POST /multi_get`:
//!
//! ```text
//! {"Requests": [{"Url", "Query", "Method", "Headers", "Content"}, ...]}
//! {"Results":  [{"Result", "StatusCode", "Headers"}, ...]}
//! ```
//!
//! Each operation only ever sees its own response, so a failing handler never
//! affects its siblings. Callers observe results through a [`LazyHandle`].

use crate::operations::{LoadResponse, QueryResponse, QueryResult, load_request, query_request};
use crate::record::EntityRef;
use crate::unit_of_work::{Lookup, UnitOfWork};
use docdb_core::{Entity, Error, HttpMethod, HttpRequest, Result, ServerError};
use docdb_query::IndexQuery;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// One sub-request of a multi-get.
#[derive(Debug, Clone, PartialEq)]
pub struct GetRequest {
    /// Path relative to the database, e.g. `/docs`.
    pub url: String,
    /// Encoded query string with its leading `?`, or empty.
    pub query: String,
    pub method: HttpMethod,
    pub headers: BTreeMap<String, String>,
    pub content: Option<Value>,
}

impl GetRequest {
    pub fn from_http(request: &HttpRequest) -> Self {
        Self {
            url: request.path.clone(),
            query: request.query_string(),
            method: request.method,
            headers: request.headers.clone(),
            content: request.body.clone(),
        }
    }

    /// Key under which the response is cached.
    pub fn cache_key(&self) -> String {
        format!("{}{}", self.url, self.query)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "Url": self.url,
            "Query": self.query,
            "Method": self.method.as_str(),
            "Headers": self.headers,
            "Content": self.content,
        })
    }
}

/// One sub-response of a multi-get.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse {
    pub result: Option<Value>,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    /// Set when the response must be discarded and the request sent again.
    pub force_retry: bool,
}

impl GetResponse {
    fn from_json(value: &Value) -> Result<Self> {
        let Some(status_code) = value
            .get("StatusCode")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok())
        else {
            return Err(Error::protocol_with_data(
                "Multi-get result is missing 'StatusCode'",
                value.clone(),
            ));
        };
        let headers = match value.get("Headers") {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        };
        Ok(Self {
            result: value.get("Result").filter(|v| !v.is_null()).cloned(),
            status_code,
            headers,
            force_retry: false,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_not_modified(&self) -> bool {
        self.status_code == 304
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The error for a failed sub-request.
    pub fn to_error(&self) -> Error {
        let message = self
            .result
            .as_ref()
            .and_then(|r| r.get("Message"))
            .and_then(Value::as_str)
            .map_or_else(
                || format!("Lazy request failed with status {}", self.status_code),
                str::to_string,
            );
        Error::Server(ServerError {
            status: self.status_code,
            message,
            source: None,
        })
    }
}

/// Body of a multi-get request.
pub fn multi_get_body(requests: &[GetRequest]) -> Value {
    json!({ "Requests": requests.iter().map(GetRequest::to_json).collect::<Vec<_>>() })
}

/// Parse a multi-get reply, expecting one result per request.
pub fn parse_multi_get(body: Option<Value>, expected: usize) -> Result<Vec<GetResponse>> {
    let Some(body) = body.filter(|v| !v.is_null()) else {
        return Err(Error::protocol_violation("Got null response to a multi-get request"));
    };
    let Some(Value::Array(results)) = body.get("Results") else {
        return Err(Error::protocol_with_data(
            "Multi-get response is missing 'Results'",
            body,
        ));
    };
    if results.len() != expected {
        return Err(Error::protocol_violation(format!(
            "Multi-get sent {expected} requests but the server returned {} results",
            results.len()
        )));
    }
    results.iter().map(GetResponse::from_json).collect()
}

// ============================================================================
// Handles
// ============================================================================

type Slot<T> = Arc<Mutex<Option<Result<T>>>>;

/// Deferred result of a lazy operation.
#[derive(Debug)]
pub struct LazyHandle<T> {
    slot: Slot<T>,
}

impl<T> Clone for LazyHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for LazyHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LazyHandle<T> {
    /// An unresolved handle.
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether a value or an error has been delivered.
    pub fn is_resolved(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Take the delivered value. Returns `None` before resolution and after
    /// the value was taken.
    pub fn take(&self) -> Option<Result<T>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Deliver the value, replacing any earlier one.
    pub fn resolve(&self, value: Result<T>) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }
}

// ============================================================================
// Operations
// ============================================================================

/// A read that can be merged into a multi-get.
pub trait LazyOperation: Send {
    /// The sub-request to send, or `None` when the operation was answered
    /// from the session (it must resolve itself in that case).
    fn create_request(&mut self, uow: &mut UnitOfWork) -> Option<GetRequest>;

    /// Consume this operation's response.
    fn handle_response(&mut self, uow: &mut UnitOfWork, response: GetResponse) -> Result<()>;

    /// Deliver an error to the caller.
    fn fail(&mut self, error: Error);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Lazily load documents by id.
pub struct LazyLoadOperation<T: Entity> {
    ids: Vec<String>,
    includes: Vec<String>,
    requested: Vec<String>,
    handle: LazyHandle<BTreeMap<String, Option<EntityRef<T>>>>,
}

impl<T: Entity> LazyLoadOperation<T> {
    pub fn new(ids: Vec<String>, includes: Vec<String>) -> (Self, LazyHandle<BTreeMap<String, Option<EntityRef<T>>>>) {
        let handle = LazyHandle::new();
        (
            Self {
                ids,
                includes,
                requested: Vec::new(),
                handle: handle.clone(),
            },
            handle,
        )
    }

    fn collect(&self, uow: &mut UnitOfWork) -> Result<BTreeMap<String, Option<EntityRef<T>>>> {
        let mut out = BTreeMap::new();
        for id in &self.ids {
            let entity = match uow.lookup::<T>(id)? {
                Lookup::Local(entity) => entity,
                Lookup::Fetch => None,
            };
            out.insert(id.clone(), entity);
        }
        Ok(out)
    }
}

impl<T: Entity> LazyOperation for LazyLoadOperation<T> {
    fn create_request(&mut self, uow: &mut UnitOfWork) -> Option<GetRequest> {
        let mut requested = Vec::new();
        for id in &self.ids {
            match uow.lookup::<T>(id) {
                Ok(Lookup::Local(_)) => {}
                Ok(Lookup::Fetch) => requested.push(id.clone()),
                Err(e) => {
                    self.handle.resolve(Err(e));
                    return None;
                }
            }
        }

        if requested.is_empty() {
            let result = self.collect(uow);
            self.handle.resolve(result);
            return None;
        }

        let request = GetRequest::from_http(&load_request(&requested, &self.includes));
        self.requested = requested;
        Some(request)
    }

    fn handle_response(&mut self, uow: &mut UnitOfWork, response: GetResponse) -> Result<()> {
        if response.status_code == 404 {
            for id in &self.requested {
                uow.mark_missing(id);
            }
        } else {
            LoadResponse::parse(response.result, self.requested.len())?
                .apply(uow, &self.requested)?;
        }
        let result = self.collect(uow)?;
        self.handle.resolve(Ok(result));
        Ok(())
    }

    fn fail(&mut self, error: Error) {
        self.handle.resolve(Err(error));
    }

    fn name(&self) -> &'static str {
        "load"
    }
}

/// Lazily execute a query.
pub struct LazyQueryOperation<T: Entity> {
    query: IndexQuery,
    tracking: bool,
    handle: LazyHandle<QueryResult<T>>,
}

impl<T: Entity> LazyQueryOperation<T> {
    pub fn new(query: IndexQuery, tracking: bool) -> (Self, LazyHandle<QueryResult<T>>) {
        let handle = LazyHandle::new();
        (
            Self {
                query,
                tracking,
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl<T: Entity> LazyOperation for LazyQueryOperation<T> {
    fn create_request(&mut self, _uow: &mut UnitOfWork) -> Option<GetRequest> {
        Some(GetRequest::from_http(&query_request(&self.query)))
    }

    fn handle_response(&mut self, uow: &mut UnitOfWork, response: GetResponse) -> Result<()> {
        let result = QueryResponse::parse(response.result)?.into_result::<T>(uow, self.tracking)?;
        self.handle.resolve(Ok(result));
        Ok(())
    }

    fn fail(&mut self, error: Error) {
        self.handle.resolve(Err(error));
    }

    fn name(&self) -> &'static str {
        "query"
    }
}

/// Lazily count the results of a query.
pub struct LazyCountOperation {
    query: IndexQuery,
    handle: LazyHandle<u64>,
}

impl LazyCountOperation {
    pub fn new(mut query: IndexQuery) -> (Self, LazyHandle<u64>) {
        query.page_size = Some(0);
        let handle = LazyHandle::new();
        (
            Self {
                query,
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl LazyOperation for LazyCountOperation {
    fn create_request(&mut self, _uow: &mut UnitOfWork) -> Option<GetRequest> {
        Some(GetRequest::from_http(&query_request(&self.query)))
    }

    fn handle_response(&mut self, _uow: &mut UnitOfWork, response: GetResponse) -> Result<()> {
        let parsed = QueryResponse::parse(response.result)?;
        self.handle.resolve(Ok(parsed.total_results));
        Ok(())
    }

    fn fail(&mut self, error: Error) {
        self.handle.resolve(Err(error));
    }

    fn name(&self) -> &'static str {
        "count"
    }
}
