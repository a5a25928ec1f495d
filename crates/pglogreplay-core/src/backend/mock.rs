//! Scripted backend for tests and dry runs.

use std::collections::HashMap;

use super::Backend;
use crate::error::BackendError;
use crate::stats::PlanMetrics;

/// Backend answering from a script keyed by exact statement text.
///
/// Statements without a scripted answer return the default metrics. Every
/// call is recorded.
#[derive(Debug, Default)]
pub struct MockBackend {
    default_metrics: PlanMetrics,
    responses: HashMap<String, Result<PlanMetrics, BackendError>>,
    calls: Vec<String>,
    closed: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(metrics: PlanMetrics) -> Self {
        Self {
            default_metrics: metrics,
            ..Self::default()
        }
    }

    /// Answer `query` with `metrics`.
    pub fn respond(mut self, query: impl Into<String>, metrics: PlanMetrics) -> Self {
        self.responses.insert(query.into(), Ok(metrics));
        self
    }

    /// Fail every call of `query` with `error`.
    pub fn fail(mut self, query: impl Into<String>, error: BackendError) -> Self {
        self.responses.insert(query.into(), Err(error));
        self
    }

    /// Statements received, in call order.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn call_count(&self) -> usize {
        self.calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Backend for MockBackend {
    fn execute_with_plan(&mut self, query: &str) -> Result<PlanMetrics, BackendError> {
        if self.closed {
            return Err(BackendError::Connection("backend already closed".to_string()));
        }
        self.calls.push(query.to_string());
        match self.responses.get(query) {
            Some(response) => response.clone(),
            None => Ok(self.default_metrics),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
