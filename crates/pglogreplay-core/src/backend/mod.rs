//! Execute-with-plan backends.
//!
//! The replay engine hands each eligible statement to a [`Backend`], which
//! runs it and reports the plan-derived metrics. How the plan is produced is
//! up to the backend.

pub mod mock;
#[cfg(feature = "postgres")]
pub mod postgres;

use serde::Deserialize;

use crate::error::BackendError;
use crate::stats::PlanMetrics;

/// Runs a statement and returns its plan metrics.
pub trait Backend {
    fn execute_with_plan(&mut self, query: &str) -> Result<PlanMetrics, BackendError>;

    /// Release any held resources. Called once at the end of a run.
    fn close(&mut self) {}
}

impl<B: Backend + ?Sized> Backend for &mut B {
    fn execute_with_plan(&mut self, query: &str) -> Result<PlanMetrics, BackendError> {
        (**self).execute_with_plan(query)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn execute_with_plan(&mut self, query: &str) -> Result<PlanMetrics, BackendError> {
        (**self).execute_with_plan(query)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Backend for runs that only tally occurrences. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineBackend;

impl Backend for OfflineBackend {
    fn execute_with_plan(&mut self, _query: &str) -> Result<PlanMetrics, BackendError> {
        Err(BackendError::Connection("no database configured".to_string()))
    }
}

/// One element of `EXPLAIN (FORMAT JSON)` output.
#[derive(Debug, Deserialize)]
struct ExplainEntry {
    #[serde(rename = "Plan")]
    plan: PlanNode,
}

/// Top-level plan node; fields missing from the output read as 0.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PlanNode {
    #[serde(rename = "Total Cost")]
    total_cost: f64,
    #[serde(rename = "Actual Total Time")]
    actual_total_time: f64,
    #[serde(rename = "Shared Hit Blocks")]
    shared_hit_blocks: f64,
    #[serde(rename = "Shared Read Blocks")]
    shared_read_blocks: f64,
}

/// Extract metrics from the text of `EXPLAIN (FORMAT JSON, ANALYZE, BUFFERS)`.
///
/// The output is a one-element array holding an object with a `Plan` key.
pub fn parse_explain_json(text: &str) -> Result<PlanMetrics, BackendError> {
    let entries: Vec<ExplainEntry> = serde_json::from_str(text).map_err(invalid_output)?;
    plan_metrics(entries)
}

/// Same as [`parse_explain_json`], for output already decoded from a `json`
/// column.
pub fn parse_explain_value(value: serde_json::Value) -> Result<PlanMetrics, BackendError> {
    let entries: Vec<ExplainEntry> = serde_json::from_value(value).map_err(invalid_output)?;
    plan_metrics(entries)
}

fn invalid_output(e: serde_json::Error) -> BackendError {
    BackendError::InvalidPlan(format!("unexpected EXPLAIN output: {}", e))
}

fn plan_metrics(entries: Vec<ExplainEntry>) -> Result<PlanMetrics, BackendError> {
    let entry = entries
        .into_iter()
        .next()
        .ok_or_else(|| BackendError::InvalidPlan("EXPLAIN returned no plan".to_string()))?;

    Ok(PlanMetrics {
        cost: entry.plan.total_cost,
        time: entry.plan.actual_total_time,
        shared_hit_blocks: entry.plan.shared_hit_blocks,
        shared_read_blocks: entry.plan.shared_read_blocks,
    })
}
