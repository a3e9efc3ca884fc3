//! The frozen form of a query and its content hash.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Query text plus parameters and paging, ready to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndexQuery {
    pub query: String,
    pub query_parameters: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<usize>,
    pub wait_for_non_stale_results: bool,
    pub skip_duplicate_checking: bool,
    #[serde(skip)]
    pub disable_caching: bool,
}

impl IndexQuery {
    /// A bare query with no parameters.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            query_parameters: Map::new(),
            start: None,
            page_size: None,
            wait_for_non_stale_results: false,
            skip_duplicate_checking: false,
            disable_caching: false,
        }
    }

    /// Request body for the query endpoint.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Deterministic, order-sensitive content hash (lower-case hex SHA-256).
    ///
    /// Two queries hash equal when their text, flags, paging and parameters
    /// are equal.
    pub fn query_hash(&self) -> String {
        let mut hasher = QueryHashCalculator::new();
        hasher.write_str(&self.query);
        hasher.write_bool(self.wait_for_non_stale_results);
        hasher.write_bool(self.skip_duplicate_checking);
        hasher.write_opt_usize(self.start);
        hasher.write_opt_usize(self.page_size);
        hasher.write_parameters(&self.query_parameters);
        hasher.finish()
    }
}

/// Incremental hasher over query primitives.
///
/// Every write is tagged with its type and strings are length-prefixed, so
/// distinct write sequences never collide by concatenation.
#[derive(Debug, Clone, Default)]
pub struct QueryHashCalculator {
    hasher: Sha256,
}

impl QueryHashCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    fn tag(&mut self, tag: u8) {
        self.hasher.update([tag]);
    }

    fn write_len(&mut self, len: usize) {
        self.hasher.update((len as u64).to_le_bytes());
    }

    pub fn write_str(&mut self, s: &str) {
        self.tag(b's');
        self.write_len(s.len());
        self.hasher.update(s.as_bytes());
    }

    pub fn write_bool(&mut self, b: bool) {
        self.tag(b'b');
        self.hasher.update([u8::from(b)]);
    }

    pub fn write_i64(&mut self, n: i64) {
        self.tag(b'i');
        self.hasher.update(n.to_le_bytes());
    }

    pub fn write_u64(&mut self, n: u64) {
        self.tag(b'u');
        self.hasher.update(n.to_le_bytes());
    }

    pub fn write_f64(&mut self, n: f64) {
        self.tag(b'f');
        self.hasher.update(n.to_bits().to_le_bytes());
    }

    pub fn write_null(&mut self) {
        self.tag(b'n');
    }

    pub fn write_opt_usize(&mut self, n: Option<usize>) {
        match n {
            Some(n) => self.write_u64(n as u64),
            None => self.write_null(),
        }
    }

    /// Write any JSON value, recursing into arrays and objects.
    pub fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.write_null(),
            Value::Bool(b) => self.write_bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.write_i64(i);
                } else if let Some(u) = n.as_u64() {
                    self.write_u64(u);
                } else if let Some(f) = n.as_f64() {
                    self.write_f64(f);
                }
            }
            Value::String(s) => self.write_str(s),
            Value::Array(items) => {
                self.tag(b'a');
                self.write_len(items.len());
                for item in items {
                    self.write_value(item);
                }
            }
            Value::Object(map) => {
                self.tag(b'o');
                self.write_len(map.len());
                for (key, value) in map {
                    self.write_str(key);
                    self.write_value(value);
                }
            }
        }
    }

    pub fn write_parameters(&mut self, parameters: &Map<String, Value>) {
        self.tag(b'p');
        self.write_len(parameters.len());
        for (name, value) in parameters {
            self.write_str(name);
            self.write_value(value);
        }
    }

    /// Finish and return the lower-case hex digest.
    pub fn finish(self) -> String {
        let digest = self.hasher.finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        hex
    }
}
