//! In-memory document server used by the integration tests.
//!
//! Implements just enough of the endpoints a session talks to:
//! `GET /docs`, `POST /bulk_docs`, `POST /queries` and `POST /multi_get`.
//! Queries understand `from <Collection>` with an optional single
//! `where <field> = $param` predicate; `PageSize` is honored.

#![allow(dead_code)]

use docdb::{
    Cx, Error, HttpMethod, HttpRequest, HttpResponse, MemoryResponseCache, Outcome,
    RequestExecutor, ResponseCache,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct ServerState {
    /// Lower-cased id -> stored document (body + `@metadata`).
    documents: BTreeMap<String, Map<String, Value>>,
    etag: u64,
    next_id: u64,
    requests: Vec<HttpRequest>,
}

/// A shared in-memory server. Clones talk to the same state.
#[derive(Clone, Default)]
pub struct InMemoryServer {
    state: Arc<Mutex<ServerState>>,
    cache: Option<Arc<MemoryResponseCache>>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server whose executor exposes a response cache.
    pub fn with_cache() -> Self {
        Self {
            state: Arc::default(),
            cache: Some(Arc::new(MemoryResponseCache::new(64))),
        }
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn document(&self, id: &str) -> Option<Map<String, Value>> {
        self.state
            .lock()
            .unwrap()
            .documents
            .get(&id.to_lowercase())
            .cloned()
    }

    /// Store a document directly, bypassing any session.
    pub fn seed(&self, id: &str, collection: &str, body: Value) {
        let mut state = self.state.lock().unwrap();
        let Value::Object(body) = body else {
            panic!("seed body must be an object");
        };
        state.put(id, collection, body);
    }

    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());
        let path = strip_database(&request.path);
        state.route(request.method, path, &request.query, request.body.as_ref(), &request.headers)
    }
}

impl RequestExecutor for InMemoryServer {
    fn execute(
        &self,
        _cx: &Cx,
        request: &HttpRequest,
    ) -> impl Future<Output = Outcome<HttpResponse, Error>> + Send {
        let response = self.handle(request);
        async move { Outcome::Ok(response) }
    }

    fn cache(&self) -> Option<&dyn ResponseCache> {
        self.cache.as_deref().map(|c| c as &dyn ResponseCache)
    }
}

fn strip_database(path: &str) -> &str {
    match path.strip_prefix("/databases/") {
        Some(rest) => rest.find('/').map_or("", |i| &rest[i..]),
        None => path,
    }
}

fn decode(input: &str) -> String {
    urlencoding::decode(input).map_or_else(|_| input.to_string(), |s| s.into_owned())
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode(k), decode(v)),
            None => (decode(pair), String::new()),
        })
        .collect()
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

impl ServerState {
    fn bump(&mut self) -> String {
        self.etag += 1;
        format!("A:{}-test", self.etag)
    }

    fn put(&mut self, id: &str, collection: &str, mut body: Map<String, Value>) -> Map<String, Value> {
        let change_vector = self.bump();
        let mut metadata = object(body.remove("@metadata").unwrap_or(Value::Null));
        metadata.insert("@id".into(), json!(id));
        metadata.insert("@change-vector".into(), json!(change_vector));
        metadata.insert("@collection".into(), json!(collection));
        metadata.insert("@last-modified".into(), json!("2024-01-01T00:00:00.0000000Z"));
        body.insert("@metadata".into(), Value::Object(metadata.clone()));
        self.documents.insert(id.to_lowercase(), body);
        metadata
    }

    fn current_change_vector(&self, id: &str) -> Option<String> {
        self.documents
            .get(&id.to_lowercase())
            .and_then(|d| d.get("@metadata"))
            .and_then(|m| m.get("@change-vector"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn route(
        &mut self,
        method: HttpMethod,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        headers: &BTreeMap<String, String>,
    ) -> HttpResponse {
        let response = match (method, path) {
            (HttpMethod::Get, "/docs") => self.get_docs(query),
            (HttpMethod::Post, "/bulk_docs") => self.bulk_docs(body),
            (HttpMethod::Post, "/queries") => self.query(body),
            (HttpMethod::Post, "/multi_get") => return self.multi_get(body),
            _ => HttpResponse::status(400),
        };
        let etag = format!("\"A:{}-test\"", self.etag);
        let matches = headers
            .get("If-None-Match")
            .is_some_and(|sent| *sent == etag);
        if method != HttpMethod::Post || path == "/queries" {
            if matches && response.is_success() {
                return HttpResponse::status(304);
            }
            return response.with_header("ETag", etag);
        }
        response
    }

    fn get_docs(&self, query: &[(String, String)]) -> HttpResponse {
        let ids: Vec<&str> = query
            .iter()
            .filter(|(k, _)| k == "id")
            .map(|(_, v)| v.as_str())
            .collect();
        let includes: Vec<&str> = query
            .iter()
            .filter(|(k, _)| k == "include")
            .map(|(_, v)| v.as_str())
            .collect();

        let results: Vec<Option<&Map<String, Value>>> = ids
            .iter()
            .map(|id| self.documents.get(&id.to_lowercase()))
            .collect();
        if ids.len() == 1 && results[0].is_none() {
            return HttpResponse::status(404);
        }

        let mut included = Map::new();
        for document in results.iter().flatten() {
            for path in &includes {
                if let Some(Value::String(target)) = document.get(*path) {
                    if let Some(doc) = self.documents.get(&target.to_lowercase()) {
                        included.insert(target.clone(), Value::Object(doc.clone()));
                    }
                }
            }
        }

        HttpResponse::ok(json!({
            "Results": results
                .into_iter()
                .map(|r| r.map_or(Value::Null, |d| Value::Object(d.clone())))
                .collect::<Vec<_>>(),
            "Includes": included,
        }))
    }

    fn bulk_docs(&mut self, body: Option<&Value>) -> HttpResponse {
        let Some(Value::Array(commands)) = body.and_then(|b| b.get("Commands")) else {
            return HttpResponse::status(400);
        };

        // Concurrency checks first: a batch is all or nothing.
        for command in commands {
            let id = command["Id"].as_str().unwrap_or_default();
            if let Some(expected) = command.get("ChangeVector").and_then(Value::as_str) {
                let actual = self.current_change_vector(id);
                let ok = if expected.is_empty() {
                    actual.is_none()
                } else {
                    actual.as_deref() == Some(expected)
                };
                if !ok {
                    return HttpResponse {
                        status: 409,
                        headers: BTreeMap::new(),
                        body: Some(json!({
                            "Message": format!("Optimistic concurrency violation on '{id}'"),
                            "Id": id,
                            "ExpectedChangeVector": expected,
                            "ActualChangeVector": actual,
                        })),
                    };
                }
            }
        }

        let mut results = Vec::new();
        for command in commands {
            let id = command["Id"].as_str().unwrap_or_default().to_string();
            match command["Type"].as_str() {
                Some("PUT") => {
                    let document = object(command["Document"].clone());
                    let collection = document
                        .get("@metadata")
                        .and_then(|m| m.get("@collection"))
                        .and_then(Value::as_str)
                        .unwrap_or("@empty")
                        .to_string();
                    let id = if id.ends_with('/') {
                        self.next_id += 1;
                        format!("{id}{}", self.next_id)
                    } else {
                        id
                    };
                    let mut result = self.put(&id, &collection, document);
                    result.insert("Type".into(), json!("PUT"));
                    results.push(Value::Object(result));
                }
                Some("DELETE") => {
                    let deleted = self.documents.remove(&id.to_lowercase()).is_some();
                    results.push(json!({ "Type": "DELETE", "@id": id, "Deleted": deleted }));
                }
                Some("PATCH") => {
                    let Some(mut document) = self.documents.get(&id.to_lowercase()).cloned() else {
                        results.push(json!({ "Type": "PATCH", "@id": id, "PatchStatus": "DocumentDoesNotExist" }));
                        continue;
                    };
                    // Scripts are not interpreted: every bound value is assigned
                    // to the field of the same name.
                    if let Some(Value::Object(values)) = command["Patch"].get("Values") {
                        for (name, value) in values {
                            document.insert(name.clone(), value.clone());
                        }
                    }
                    let collection = document
                        .get("@metadata")
                        .and_then(|m| m.get("@collection"))
                        .and_then(Value::as_str)
                        .unwrap_or("@empty")
                        .to_string();
                    let metadata = self.put(&id, &collection, document);
                    let modified = self.documents[&id.to_lowercase()].clone();
                    results.push(json!({
                        "Type": "PATCH",
                        "@id": id,
                        "ChangeVector": metadata["@change-vector"],
                        "ModifiedDocument": modified,
                        "PatchStatus": "Patched",
                    }));
                }
                _ => return HttpResponse::status(400),
            }
        }
        HttpResponse::ok(json!({ "Results": results }))
    }

    fn query(&self, body: Option<&Value>) -> HttpResponse {
        let Some(body) = body else {
            return HttpResponse::status(400);
        };
        let text = body["Query"].as_str().unwrap_or_default();
        let parameters = body.get("QueryParameters").cloned().unwrap_or(Value::Null);
        let mut words = text.split_whitespace();
        if words.next() != Some("from") {
            return HttpResponse::status(400);
        }
        let collection = words.next().unwrap_or_default();
        let rest: Vec<&str> = words.collect();
        let filter = match rest.as_slice() {
            ["where", field, "=", param, ..] => param
                .strip_prefix('$')
                .map(|p| ((*field).to_string(), parameters[p].clone())),
            _ => None,
        };

        let matching: Vec<Value> = self
            .documents
            .values()
            .filter(|d| d["@metadata"]["@collection"].as_str() == Some(collection))
            .filter(|d| filter.as_ref().is_none_or(|(field, value)| d.get(field) == Some(value)))
            .map(|d| Value::Object(d.clone()))
            .collect();
        let total = matching.len();
        let page_size = body
            .get("PageSize")
            .and_then(Value::as_u64)
            .map_or(total, |n| usize::try_from(n).unwrap_or(total));

        HttpResponse::ok(json!({
            "Results": matching.into_iter().take(page_size).collect::<Vec<_>>(),
            "Includes": {},
            "TotalResults": total,
            "IsStale": false,
        }))
    }

    fn multi_get(&mut self, body: Option<&Value>) -> HttpResponse {
        let Some(Value::Array(requests)) = body.and_then(|b| b.get("Requests")) else {
            return HttpResponse::status(400);
        };
        let mut results = Vec::new();
        for request in requests {
            let method = match request["Method"].as_str() {
                Some("POST") => HttpMethod::Post,
                _ => HttpMethod::Get,
            };
            let path = request["Url"].as_str().unwrap_or_default().to_string();
            let query = parse_query(request["Query"].as_str().unwrap_or_default());
            let headers: BTreeMap<String, String> = request
                .get("Headers")
                .and_then(Value::as_object)
                .map(|h| {
                    h.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            let content = request.get("Content").filter(|c| !c.is_null()).cloned();
            let response = self.route(method, &path, &query, content.as_ref(), &headers);
            results.push(json!({
                "Result": response.body,
                "StatusCode": response.status,
                "Headers": response.headers,
            }));
        }
        HttpResponse::ok(json!({ "Results": results }))
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub age: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

impl docdb::Entity for User {
    fn id(&self) -> Option<String> {
        self.id.clone()
    }

    fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

impl docdb::Entity for Company {
    fn id(&self) -> Option<String> {
        self.id.clone()
    }

    fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }
}

pub fn user(name: &str, age: u32) -> User {
    User {
        id: None,
        name: name.to_string(),
        age,
        company: None,
    }
}

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}
