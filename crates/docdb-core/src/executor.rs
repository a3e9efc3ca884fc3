//! The request-executor contract.
//!
//! This module defines the narrow boundary between the session and the
//! transport that actually talks to the server:
//!
//! - [`HttpRequest`] - method, relative path, query string, headers and body
//! - [`HttpResponse`] - status code, headers and parsed JSON body
//! - [`RequestExecutor`] - the `execute(request) -> response` capability
//!
//! Topology, failover, connection pooling and byte transport all live behind
//! [`RequestExecutor`]. Executors are shared by many sessions; a session only
//! ever calls [`RequestExecutor::execute`] and reads the optional
//! [`ResponseCache`](crate::cache::ResponseCache) hook.

use crate::cache::ResponseCache;
use crate::error::{ConcurrencyError, Error, ServerError};
use asupersync::{Cx, Outcome};
use serde_json::Value;
use std::collections::BTreeMap;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Upper-case method name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// A request for the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Path relative to the database endpoint, e.g. `/docs`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Create a request without query parameters or body.
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Encoded query string including the leading `?`, or empty.
    pub fn query_string(&self) -> String {
        if self.query.is_empty() {
            return String::new();
        }
        let mut out = String::from("?");
        for (i, (name, value)) in self.query.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(&urlencoding::encode(name));
            out.push('=');
            out.push_str(&urlencoding::encode(value));
        }
        out
    }

    /// Relative URL (path + query string). Used as the response cache key.
    pub fn url(&self) -> String {
        format!("{}{}", self.path, self.query_string())
    }
}

/// A response from the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl HttpResponse {
    /// A `200 OK` response with a JSON body.
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: Some(body),
        }
    }

    /// A bodiless response with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Set a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// Look up a header case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Convert a non-success response into the matching error.
    ///
    /// `409` becomes a concurrency conflict; everything else is a server error.
    pub fn into_error(self) -> Error {
        let message = self
            .body
            .as_ref()
            .and_then(|b| b.get("Message").or_else(|| b.get("Error")))
            .and_then(Value::as_str)
            .map_or_else(|| format!("Request failed with status {}", self.status), str::to_string);

        if self.status == 409 {
            let field = |name: &str| {
                self.body
                    .as_ref()
                    .and_then(|b| b.get(name))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            return Error::Concurrency(ConcurrencyError {
                id: field("Id"),
                expected_change_vector: field("ExpectedChangeVector"),
                actual_change_vector: field("ActualChangeVector"),
                message,
            });
        }

        Error::Server(ServerError {
            status: self.status,
            message,
            source: None,
        })
    }
}

/// The consumed `execute(request) -> response` capability.
///
/// Implementations own topology selection, failover, retries of transient
/// faults and the byte transport. They must be `Send + Sync` because one
/// executor is shared by every session of a document store.
///
/// # Example
///
/// ```rust,ignore
/// let response = executor
///     .execute(&cx, &HttpRequest::new(HttpMethod::Get, "/docs").with_query("id", "users/1"))
///     .await;
/// ```
pub trait RequestExecutor: Send + Sync {
    /// Send one request and return the server's response.
    ///
    /// Non-success statuses are returned as responses, not errors; `Err` is
    /// reserved for transport failures.
    fn execute(
        &self,
        cx: &Cx,
        request: &HttpRequest,
    ) -> impl Future<Output = Outcome<HttpResponse, Error>> + Send;

    /// Optional response-cache hook shared with the transport.
    fn cache(&self) -> Option<&dyn ResponseCache> {
        None
    }
}
