//! Per-session request budget.
//!
//! Every round trip a session makes is counted. Crossing the configured
//! maximum is a fatal programmer-visible error meant to catch chatty usage
//! (e.g. loading documents one at a time inside a loop), not a transient
//! fault: the request that would exceed the budget is never sent.
//!
//! # Example
//!
//! ```
//! use docdb_session::budget::RequestBudget;
//!
//! let mut budget = RequestBudget::new(2);
//! budget.record("load").unwrap();
//! budget.record("save_changes").unwrap();
//! assert!(budget.record("load").is_err());
//! assert_eq!(budget.count(), 2);
//! ```

use docdb_core::error::RequestBudgetError;
use docdb_core::{Error, Result};
use std::collections::HashMap;

/// Fraction of the budget after which a warning is logged.
const WARN_RATIO: f64 = 0.8;

/// Counts requests issued by one session.
#[derive(Debug, Clone)]
pub struct RequestBudget {
    count: usize,
    max: usize,
    /// operation name -> request count
    by_operation: HashMap<&'static str, usize>,
    warned: bool,
}

/// Statistics about a session's requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Total number of requests sent
    pub total_requests: usize,
    /// Number of distinct operations that sent requests
    pub operations: usize,
    /// The operation that sent the most requests
    pub busiest_operation: Option<&'static str>,
}

impl RequestBudget {
    /// Create a budget allowing `max` requests.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            count: 0,
            max,
            by_operation: HashMap::new(),
            warned: false,
        }
    }

    /// Maximum number of requests allowed.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Number of requests issued so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Raise or lower the maximum for the rest of the session.
    pub fn set_max(&mut self, max: usize) {
        self.max = max;
        self.warned = false;
    }

    /// Record a request about to be sent by `operation`.
    ///
    /// Fails without counting when the request would exceed the budget.
    pub fn record(&mut self, operation: &'static str) -> Result<()> {
        if self.count >= self.max {
            tracing::error!(
                target: "docdb::budget",
                operation,
                max = self.max,
                "Request budget exhausted"
            );
            return Err(Error::RequestBudgetExceeded(RequestBudgetError {
                max_requests: self.max,
            }));
        }

        self.count += 1;
        *self.by_operation.entry(operation).or_insert(0) += 1;

        if !self.warned && (self.count as f64) >= (self.max as f64) * WARN_RATIO {
            self.warned = true;
            tracing::warn!(
                target: "docdb::budget",
                requests = self.count,
                max = self.max,
                operation,
                "Session is close to its request budget. Consider batching loads or using lazy operations."
            );
        }
        Ok(())
    }

    /// Requests issued by a given operation.
    pub fn count_for(&self, operation: &str) -> usize {
        self.by_operation.get(operation).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> RequestStats {
        RequestStats {
            total_requests: self.count,
            operations: self.by_operation.len(),
            busiest_operation: self
                .by_operation
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(op, _)| *op),
        }
    }

    /// Start counting from zero again.
    pub fn reset(&mut self) {
        self.count = 0;
        self.by_operation.clear();
        self.warned = false;
    }
}
