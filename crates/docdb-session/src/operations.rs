//! Request shapes and response handling shared by direct and lazy reads.
//!
//! - Load: `GET /docs?id=..&include=..` answered by
//!   `{"Results": [doc | null, ...], "Includes": {id: doc}}`
//! - Query: `POST /queries?queryHash=..` with an [`IndexQuery`] body, answered
//!   by `{"Results": [...], "Includes": {...}, "TotalResults": n, "IsStale": b}`

use crate::record::{EntityRef, entity_ref, materialize};
use crate::unit_of_work::UnitOfWork;
use docdb_core::metadata::{ID, PROJECTION, split_document};
use docdb_core::{Entity, Error, HttpMethod, HttpRequest, Result};
use docdb_query::IndexQuery;
use serde_json::{Map, Value};

/// `GET /docs` for a set of ids plus include paths.
pub fn load_request(ids: &[String], includes: &[String]) -> HttpRequest {
    let mut request = HttpRequest::new(HttpMethod::Get, "/docs");
    for id in ids {
        request = request.with_query("id", id.clone());
    }
    for include in includes {
        request = request.with_query("include", include.clone());
    }
    request
}

/// `POST /queries` for a frozen query.
pub fn query_request(query: &IndexQuery) -> HttpRequest {
    HttpRequest::new(HttpMethod::Post, "/queries")
        .with_query("queryHash", query.query_hash())
        .with_body(query.to_json())
}

fn documents_in(includes: Option<&Value>) -> Vec<Map<String, Value>> {
    match includes {
        Some(Value::Object(map)) => map
            .values()
            .filter_map(|v| v.as_object().cloned())
            .collect(),
        _ => Vec::new(),
    }
}

/// Parsed reply to a load request.
#[derive(Debug, Clone, Default)]
pub struct LoadResponse {
    /// One entry per requested id; `None` for a missing document.
    pub results: Vec<Option<Map<String, Value>>>,
    pub includes: Vec<Map<String, Value>>,
}

impl LoadResponse {
    pub fn parse(body: Option<Value>, expected: usize) -> Result<Self> {
        let Some(body) = body.filter(|v| !v.is_null()) else {
            return Err(Error::protocol_violation("Got null response to a load request"));
        };
        let Some(Value::Array(results)) = body.get("Results") else {
            return Err(Error::protocol_with_data(
                "Load response is missing 'Results'",
                body,
            ));
        };
        if results.len() != expected {
            return Err(Error::protocol_violation(format!(
                "Requested {expected} documents but the server returned {} results",
                results.len()
            )));
        }
        let results = results
            .iter()
            .map(|r| r.as_object().cloned())
            .collect();
        Ok(Self {
            results,
            includes: documents_in(body.get("Includes")),
        })
    }

    /// Register results and includes with the session. Ids with a `null`
    /// result become known missing.
    pub fn apply(self, uow: &mut UnitOfWork, ids: &[String]) -> Result<()> {
        for include in self.includes {
            uow.register_document(include)?;
        }
        for (id, result) in ids.iter().zip(self.results) {
            match result {
                Some(document) => {
                    uow.register_document(document)?;
                }
                None => uow.mark_missing(id),
            }
        }
        Ok(())
    }
}

/// An entity materialized from a server document without tracking it.
pub fn detached<T: Entity>(document: Map<String, Value>, identity_property: &str) -> Result<EntityRef<T>> {
    let (body, metadata) = split_document(document);
    match metadata.get(ID).and_then(Value::as_str) {
        Some(id) => Ok(entity_ref(materialize::<T>(&body, id, identity_property)?)),
        None => Ok(entity_ref(serde_json::from_value(Value::Object(body))?)),
    }
}

/// Results of an executed query.
#[derive(Debug)]
pub struct QueryResult<T> {
    pub results: Vec<EntityRef<T>>,
    pub total_results: u64,
    pub is_stale: bool,
    pub index_name: Option<String>,
}

impl<T> QueryResult<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Parsed reply to a query request.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub results: Vec<Value>,
    pub includes: Vec<Map<String, Value>>,
    pub total_results: u64,
    pub is_stale: bool,
    pub index_name: Option<String>,
}

impl QueryResponse {
    pub fn parse(body: Option<Value>) -> Result<Self> {
        let Some(body) = body.filter(|v| !v.is_null()) else {
            return Err(Error::protocol_violation("Got null response to a query"));
        };
        let Some(Value::Array(results)) = body.get("Results") else {
            return Err(Error::protocol_with_data(
                "Query response is missing 'Results'",
                body,
            ));
        };
        Ok(Self {
            results: results.clone(),
            includes: documents_in(body.get("Includes")),
            total_results: body
                .get("TotalResults")
                .and_then(Value::as_u64)
                .unwrap_or(results.len() as u64),
            is_stale: body.get("IsStale").and_then(Value::as_bool).unwrap_or(false),
            index_name: body
                .get("IndexName")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    /// Turn the results into entities.
    ///
    /// With tracking, documents are registered in the session and an already
    /// tracked document yields the existing instance. Projections are never
    /// tracked.
    pub fn into_result<T: Entity>(self, uow: &mut UnitOfWork, tracking: bool) -> Result<QueryResult<T>> {
        let identity = uow.conventions().identity_property_name().to_string();
        if tracking {
            for include in self.includes {
                uow.register_document(include)?;
            }
        }

        let mut results = Vec::with_capacity(self.results.len());
        for result in self.results {
            let Value::Object(document) = result else {
                continue;
            };
            let projection = document
                .get(docdb_core::metadata::METADATA)
                .and_then(|m| m.get(PROJECTION))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let has_id = document
                .get(docdb_core::metadata::METADATA)
                .and_then(|m| m.get(ID))
                .is_some_and(Value::is_string);

            if tracking && !projection && has_id {
                results.push(uow.track_document::<T>(document)?);
            } else {
                results.push(detached::<T>(document, &identity)?);
            }
        }

        Ok(QueryResult {
            results,
            total_results: self.total_results,
            is_stale: self.is_stale,
            index_name: self.index_name,
        })
    }
}
