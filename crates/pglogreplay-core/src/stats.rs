//! Per-fingerprint running statistics.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::fingerprint::Fingerprint;

/// Maximum stored length of the first-seen statement, in characters.
pub const MAX_STORED_STATEMENT_LEN: usize = 1024;

/// A plan-derived metric tracked per fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Cost,
    Time,
    SharedHitBlocks,
    SharedReadBlocks,
}

impl Metric {
    /// Column order of the progress stream and the ranking report.
    pub const ALL: [Metric; 4] = [
        Metric::Cost,
        Metric::Time,
        Metric::SharedHitBlocks,
        Metric::SharedReadBlocks,
    ];

    /// CSV column name.
    pub fn column(&self) -> &'static str {
        match self {
            Metric::Cost => "cost",
            Metric::Time => "time",
            Metric::SharedHitBlocks => "shared_hit_blocks",
            Metric::SharedReadBlocks => "shared_read_blocks",
        }
    }
}

/// Metric values of one execution, or running totals of many.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlanMetrics {
    /// Planner total cost.
    pub cost: f64,
    /// Actual total time in milliseconds.
    pub time: f64,
    pub shared_hit_blocks: f64,
    pub shared_read_blocks: f64,
}

impl PlanMetrics {
    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Cost => self.cost,
            Metric::Time => self.time,
            Metric::SharedHitBlocks => self.shared_hit_blocks,
            Metric::SharedReadBlocks => self.shared_read_blocks,
        }
    }

    fn add(&mut self, other: &PlanMetrics) {
        self.cost += other.cost;
        self.time += other.time;
        self.shared_hit_blocks += other.shared_hit_blocks;
        self.shared_read_blocks += other.shared_read_blocks;
    }

    fn divided_by(&self, n: u64) -> PlanMetrics {
        let n = n as f64;
        PlanMetrics {
            cost: self.cost / n,
            time: self.time / n,
            shared_hit_blocks: self.shared_hit_blocks / n,
            shared_read_blocks: self.shared_read_blocks / n,
        }
    }
}

/// What happened to one occurrence of a fingerprint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Occurrence {
    /// Executed; the metrics are folded into the totals.
    Executed(PlanMetrics),
    /// The backend rejected the statement.
    Failed,
    /// Not executed (budget exhausted or count-only run).
    Skipped,
}

/// Which backend calls consume the execution budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BudgetPolicy {
    /// Every call, failed or not.
    #[default]
    Attempts,
    /// Only calls that returned metrics.
    Successes,
}

impl FromStr for BudgetPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "attempts" => Ok(BudgetPolicy::Attempts),
            "successes" => Ok(BudgetPolicy::Successes),
            other => Err(format!(
                "unknown budget policy '{}' (expected attempts or successes)",
                other
            )),
        }
    }
}

impl fmt::Display for BudgetPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetPolicy::Attempts => f.write_str("attempts"),
            BudgetPolicy::Successes => f.write_str("successes"),
        }
    }
}

/// Aggregate for one fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStats {
    pub fingerprint: Fingerprint,
    /// First statement seen with this fingerprint.
    pub statement: String,
    /// Occurrences, whatever their outcome.
    pub count: u64,
    /// Occurrences whose metrics were folded into `totals`.
    pub executions: u64,
    pub failures: u64,
    pub totals: PlanMetrics,
}

impl QueryStats {
    fn new(fingerprint: Fingerprint, statement: &str) -> Self {
        Self {
            fingerprint,
            statement: statement.chars().take(MAX_STORED_STATEMENT_LEN).collect(),
            count: 0,
            executions: 0,
            failures: 0,
            totals: PlanMetrics::default(),
        }
    }

    /// Mean of every folded metric value, `None` before the first execution.
    pub fn averages(&self) -> Option<PlanMetrics> {
        (self.executions > 0).then(|| self.totals.divided_by(self.executions))
    }

    pub fn average(&self, metric: Metric) -> Option<f64> {
        self.averages().map(|a| a.get(metric))
    }

    /// Backend calls charged against the execution budget.
    pub fn budget_used(&self, policy: BudgetPolicy) -> u64 {
        match policy {
            BudgetPolicy::Attempts => self.executions + self.failures,
            BudgetPolicy::Successes => self.executions,
        }
    }

    fn fold(&mut self, occurrence: &Occurrence) {
        self.count += 1;
        match occurrence {
            Occurrence::Executed(metrics) => {
                self.executions += 1;
                self.totals.add(metrics);
            }
            Occurrence::Failed => self.failures += 1,
            Occurrence::Skipped => {}
        }
    }
}

/// Mapping from fingerprint to statistics, iterated in first-seen order.
///
/// Entries are created on first occurrence and never removed.
#[derive(Debug, Clone, Default)]
pub struct AggregationTable {
    entries: Vec<QueryStats>,
    index: HashMap<Fingerprint, usize>,
}

impl AggregationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&QueryStats> {
        self.index.get(fingerprint).map(|&i| &self.entries[i])
    }

    /// Fold one occurrence into the fingerprint's aggregate.
    pub fn record(
        &mut self,
        fingerprint: &Fingerprint,
        statement: &str,
        occurrence: Occurrence,
    ) -> &QueryStats {
        let i = match self.index.get(fingerprint) {
            Some(&i) => i,
            None => {
                self.entries
                    .push(QueryStats::new(fingerprint.clone(), statement));
                self.index.insert(fingerprint.clone(), self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        let stats = &mut self.entries[i];
        stats.fold(&occurrence);
        stats
    }

    /// Entries in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = &QueryStats> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(cost: f64, time: f64, hit: f64, read: f64) -> PlanMetrics {
        PlanMetrics {
            cost,
            time,
            shared_hit_blocks: hit,
            shared_read_blocks: read,
        }
    }

    #[test]
    fn test_first_occurrence_creates_entry() {
        let mut table = AggregationTable::new();
        let fp = Fingerprint::new("a");
        assert!(table.get(&fp).is_none());

        let stats = table.record(&fp, "SELECT 1", Occurrence::Executed(metrics(1.0, 2.0, 3.0, 4.0)));
        assert_eq!(stats.count, 1);
        assert_eq!(stats.statement, "SELECT 1");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_statement_keeps_first_seen() {
        let mut table = AggregationTable::new();
        let fp = Fingerprint::new("a");
        table.record(&fp, "SELECT 1", Occurrence::Skipped);
        table.record(&fp, "SELECT 2", Occurrence::Skipped);
        assert_eq!(table.get(&fp).unwrap().statement, "SELECT 1");
    }

    #[test]
    fn test_long_statement_is_truncated_on_store() {
        let mut table = AggregationTable::new();
        let fp = Fingerprint::new("a");
        let long = "x".repeat(MAX_STORED_STATEMENT_LEN * 2);
        let stats = table.record(&fp, &long, Occurrence::Skipped);
        assert_eq!(stats.statement.len(), MAX_STORED_STATEMENT_LEN);
    }

    #[test]
    fn test_count_includes_failed_and_skipped() {
        let mut table = AggregationTable::new();
        let fp = Fingerprint::new("a");
        table.record(&fp, "q", Occurrence::Executed(metrics(10.0, 1.0, 0.0, 0.0)));
        table.record(&fp, "q", Occurrence::Failed);
        table.record(&fp, "q", Occurrence::Skipped);

        let stats = table.get(&fp).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.totals.cost, 10.0);
        assert_eq!(stats.budget_used(BudgetPolicy::Attempts), 2);
        assert_eq!(stats.budget_used(BudgetPolicy::Successes), 1);
    }

    #[test]
    fn test_average_is_mean_of_folded_values() {
        let mut table = AggregationTable::new();
        let fp = Fingerprint::new("a");
        let samples = [
            metrics(1.0, 0.5, 10.0, 0.0),
            metrics(4.0, 1.5, 20.0, 3.0),
            metrics(7.0, 4.0, 30.0, 6.0),
        ];
        for m in samples {
            table.record(&fp, "q", Occurrence::Executed(m));
        }
        table.record(&fp, "q", Occurrence::Skipped);

        let stats = table.get(&fp).unwrap();
        for metric in Metric::ALL {
            let mean = samples.iter().map(|s| s.get(metric)).sum::<f64>() / samples.len() as f64;
            let avg = stats.average(metric).unwrap();
            assert!((avg - mean).abs() < 1e-9, "{:?}: {} != {}", metric, avg, mean);
        }
    }

    #[test]
    fn test_no_average_before_first_execution() {
        let mut table = AggregationTable::new();
        let fp = Fingerprint::new("a");
        table.record(&fp, "q", Occurrence::Failed);
        let stats = table.get(&fp).unwrap();
        assert!(stats.averages().is_none());
        assert!(stats.average(Metric::Cost).is_none());
    }

    #[test]
    fn test_iteration_in_first_seen_order() {
        let mut table = AggregationTable::new();
        for name in ["c", "a", "b", "a"] {
            table.record(&Fingerprint::new(name), name, Occurrence::Skipped);
        }
        let order: Vec<_> = table.iter().map(|s| s.fingerprint.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_budget_policy_from_str() {
        assert_eq!("attempts".parse::<BudgetPolicy>(), Ok(BudgetPolicy::Attempts));
        assert_eq!("Successes".parse::<BudgetPolicy>(), Ok(BudgetPolicy::Successes));
        assert!("never".parse::<BudgetPolicy>().is_err());
    }
}
