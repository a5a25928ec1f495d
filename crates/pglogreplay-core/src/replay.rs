//! Replay engine.
//!
//! Drives reconstructed records through the query filter, the execution
//! budget and the backend, folding results into the run's aggregation table
//! and writing one progress row per processed record.

use std::io::Write;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::cancel::CancelFlag;
use crate::error::ReplayError;
use crate::filter::QueryFilter;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::merge::MergedLine;
use crate::record::{RecordFormat, RecordOutcome, RecordReconstructor};
use crate::report::{ProgressRow, RowValues, progress_header};
use crate::source::{LineWindow, SourceLine};
use crate::stats::{AggregationTable, BudgetPolicy, Occurrence};

/// Replay settings.
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    pub format: RecordFormat,
    pub window: LineWindow,
    /// Per-fingerprint cap on backend calls.
    pub max_executions_per_query: Option<u64>,
    pub budget_policy: BudgetPolicy,
    /// Tally occurrences without calling the backend.
    pub count_only: bool,
    pub filter: QueryFilter,
}

impl ReplayConfig {
    pub fn new(format: RecordFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    pub fn with_window(mut self, window: LineWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_executions_per_query(mut self, max: Option<u64>) -> Self {
        self.max_executions_per_query = max;
        self
    }

    pub fn with_budget_policy(mut self, policy: BudgetPolicy) -> Self {
        self.budget_policy = policy;
        self
    }

    pub fn with_count_only(mut self, count_only: bool) -> Self {
        self.count_only = count_only;
        self
    }

    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Counters describing a finished (or interrupted) run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records: u64,
    pub executed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub unparsable: u64,
    pub ineligible: u64,
}

/// Mutable state of one run.
#[derive(Debug)]
pub struct RunContext {
    started: Instant,
    execution_number: u64,
    table: AggregationTable,
    summary: ReplaySummary,
    cancel: CancelFlag,
}

impl RunContext {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            started: Instant::now(),
            execution_number: 0,
            table: AggregationTable::new(),
            summary: ReplaySummary::default(),
            cancel,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Number of progress rows emitted so far.
    pub fn execution_number(&self) -> u64 {
        self.execution_number
    }

    pub fn table(&self) -> &AggregationTable {
        &self.table
    }

    pub fn into_table(self) -> AggregationTable {
        self.table
    }

    pub fn summary(&self) -> ReplaySummary {
        self.summary
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn next_execution_number(&mut self) -> u64 {
        self.execution_number += 1;
        self.execution_number
    }
}

/// Replays records against a backend, writing progress rows to `out`.
pub struct Replayer<B, F, W> {
    config: ReplayConfig,
    backend: B,
    fingerprinter: F,
    out: W,
    context: RunContext,
    header_written: bool,
}

impl<B, F, W> Replayer<B, F, W>
where
    B: Backend,
    F: Fingerprinter,
    W: Write,
{
    pub fn new(config: ReplayConfig, backend: B, fingerprinter: F, out: W, cancel: CancelFlag) -> Self {
        Self {
            config,
            backend,
            fingerprinter,
            out,
            context: RunContext::new(cancel),
            header_written: false,
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn into_context(self) -> RunContext {
        self.context
    }

    /// Replay a single source. Reading stops once the line window is passed.
    ///
    /// The backend is closed when the run ends, on success or failure.
    pub fn replay_lines<I>(&mut self, lines: I) -> Result<ReplaySummary, ReplayError>
    where
        I: IntoIterator<Item = SourceLine>,
    {
        let result = self.run(lines.into_iter(), true);
        self.backend.close();
        result
    }

    /// Replay a merged multi-source stream. Line numbers are those of the
    /// originating files, so the whole stream is read.
    pub fn replay_merged<I>(&mut self, lines: I) -> Result<ReplaySummary, ReplayError>
    where
        I: IntoIterator<Item = MergedLine>,
    {
        let result = self.run(lines.into_iter().map(|m| m.line), false);
        self.backend.close();
        result
    }

    fn run<I>(&mut self, lines: I, stop_past_window: bool) -> Result<ReplaySummary, ReplayError>
    where
        I: Iterator<Item = SourceLine>,
    {
        if !self.header_written {
            writeln!(self.out, "{}", progress_header())?;
            self.header_written = true;
        }

        let mut reconstructor = RecordReconstructor::new(self.config.format);
        for line in lines {
            if self.context.cancel.is_cancelled() {
                return Err(ReplayError::Cancelled);
            }
            // Records starting past the window are never reported, so a
            // single source can stop as soon as nothing inside it is pending.
            if stop_past_window
                && self.config.window.is_past_end(line.line_number)
                && reconstructor
                    .pending_line()
                    .is_none_or(|start| self.config.window.is_past_end(start))
            {
                debug!(line = line.line_number, "past max_lines, stopping");
                break;
            }
            if let Some(outcome) = reconstructor.feed(&line) {
                self.handle_outcome(outcome)?;
            }
        }
        if let Some(line) = reconstructor.finish() {
            debug!(line, "incomplete trailing record dropped");
        }
        self.out.flush()?;

        let summary = self.context.summary;
        info!(
            records = summary.records,
            executed = summary.executed,
            skipped = summary.skipped,
            failed = summary.failed,
            unparsable = summary.unparsable,
            fingerprints = self.context.table.len(),
            "replay finished"
        );
        Ok(summary)
    }

    fn handle_outcome(&mut self, outcome: RecordOutcome) -> Result<(), ReplayError> {
        if !self.config.window.contains(outcome.line_number()) {
            return Ok(());
        }
        match outcome {
            RecordOutcome::Complete(record) => match record.query() {
                Some(query) => self.handle_query(record.line_number, query),
                None => self.handle_unparsable(record.line_number, "record has no Query Text"),
            },
            RecordOutcome::Unparsable {
                line_number,
                reason,
            } => self.handle_unparsable(line_number, &reason),
        }
    }

    /// Process one statement found at `line_number`.
    pub fn handle_query(&mut self, line_number: u64, query: &str) -> Result<(), ReplayError> {
        if !self.config.filter.is_eligible(query) {
            debug!(line = line_number, "statement not eligible for replay");
            self.context.summary.ineligible += 1;
            return Ok(());
        }
        if self.context.cancel.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }

        let fingerprint = self.fingerprinter.fingerprint(query);
        let occurrence = if self.should_execute(&fingerprint) {
            match self.backend.execute_with_plan(query) {
                Ok(metrics) => Occurrence::Executed(metrics),
                Err(e) if e.is_recoverable() => {
                    warn!(line = line_number, fingerprint = %fingerprint, error = %e, "statement failed");
                    Occurrence::Failed
                }
                Err(e) => return Err(ReplayError::from_backend(e)),
            }
        } else {
            Occurrence::Skipped
        };

        let summary = &mut self.context.summary;
        summary.records += 1;
        match occurrence {
            Occurrence::Executed(_) => summary.executed += 1,
            Occurrence::Failed => summary.failed += 1,
            Occurrence::Skipped => summary.skipped += 1,
        }

        let execution_number = self.context.next_execution_number();
        let elapsed_secs = self.context.elapsed().as_secs_f64();
        let stats = self.context.table.record(&fingerprint, query, occurrence);
        let values = match occurrence {
            Occurrence::Executed(sample) => RowValues::Metrics {
                sample,
                averages: stats.averages().unwrap_or(sample),
            },
            Occurrence::Failed => RowValues::Error,
            Occurrence::Skipped => RowValues::Skipped,
        };
        let row = ProgressRow {
            elapsed_secs,
            execution_number,
            line_number,
            fingerprint: Some(&fingerprint),
            count: stats.count,
            values,
        };
        writeln!(self.out, "{}", row)?;
        Ok(())
    }

    /// Emit an ERROR row for a record that could not be interpreted.
    fn handle_unparsable(&mut self, line_number: u64, reason: &str) -> Result<(), ReplayError> {
        warn!(line = line_number, reason, "unparsable record");
        self.context.summary.records += 1;
        self.context.summary.unparsable += 1;

        let row = ProgressRow {
            elapsed_secs: self.context.elapsed().as_secs_f64(),
            execution_number: self.context.next_execution_number(),
            line_number,
            fingerprint: None,
            count: 0,
            values: RowValues::Error,
        };
        writeln!(self.out, "{}", row)?;
        Ok(())
    }

    fn should_execute(&self, fingerprint: &Fingerprint) -> bool {
        if self.config.count_only {
            return false;
        }
        match (self.config.max_executions_per_query, self.context.table.get(fingerprint)) {
            (Some(max), Some(stats)) => stats.budget_used(self.config.budget_policy) < max,
            (Some(max), None) => max > 0,
            (None, _) => true,
        }
    }
}
