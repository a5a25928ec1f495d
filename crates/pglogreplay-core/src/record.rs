//! Reconstruction of logical records from a line stream.
//!
//! A record may span many physical lines. Boundaries are detected with a
//! small state machine:
//!
//! ```text
//!            record start               record end / next record start
//!   Idle ───────────────────▶ Accumulating ─────────────────────────▶ Flushing
//!    ▲                          │      ▲                                 │
//!    │                          └──────┘ continuation                    │
//!    └───────────────────────────────────────────────────────────────────┘
//!                              emit record, re-examine the line if unconsumed
//! ```
//!
//! Two log formats are supported:
//!
//! - [`RecordFormat::Json`]: auto_explain JSON plans. A record opens on a
//!   line that is exactly `\t{` and closes on a line that is exactly `\t}`.
//!   Deeper-indented braces belong to nested objects and never match.
//! - [`RecordFormat::Stderr`]: plain-text logs. A record opens on a line with
//!   an `execute <name>:` or `statement:` marker and runs until the next line
//!   that begins with a date.
//!
//! Only one pending record is buffered at a time.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::source::SourceLine;
use crate::timestamp::{Timestamp, extract_timestamp, starts_with_date};

/// JSON field holding the statement in auto_explain output.
pub const QUERY_TEXT_FIELD: &str = "Query Text";

/// Execution marker in plain-text logs, optionally preceded by a duration:
/// `LOG:  duration: 0.5 ms  execute <unnamed>: SELECT ...`
/// `LOG:  statement: SELECT ...`
static STATEMENT_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s(?:execute\s+[^\s:]+|statement):\s(.*)$").expect("valid statement marker regex")
});

/// Log format, selecting the boundary rules and the body parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
    /// auto_explain JSON plans.
    Json,
    /// Plain-text stderr log with statement markers.
    #[default]
    Stderr,
}

impl fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordFormat::Json => f.write_str("json"),
            RecordFormat::Stderr => f.write_str("stderr"),
        }
    }
}

impl FromStr for RecordFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(RecordFormat::Json),
            "stderr" | "text" | "plain" => Ok(RecordFormat::Stderr),
            other => Err(format!("unknown log format '{}' (expected json or stderr)", other)),
        }
    }
}

/// Parsed content of a completed record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    /// Structured object from a JSON log.
    Json(Value),
    /// Raw statement text from a plain-text log.
    Statement(String),
}

/// A fully reconstructed logical record.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRecord {
    /// Line on which the record started.
    pub line_number: u64,
    /// Most recent timestamp seen when the record started.
    pub timestamp: Option<Timestamp>,
    pub body: RecordBody,
}

impl CompletedRecord {
    /// The statement carried by this record, if any.
    pub fn query(&self) -> Option<&str> {
        match &self.body {
            RecordBody::Json(value) => value.get(QUERY_TEXT_FIELD).and_then(Value::as_str),
            RecordBody::Statement(sql) => Some(sql),
        }
    }
}

/// Result of flushing a pending record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Complete(CompletedRecord),
    /// The record boundaries were found but the body could not be parsed.
    Unparsable { line_number: u64, reason: String },
}

impl RecordOutcome {
    pub fn line_number(&self) -> u64 {
        match self {
            RecordOutcome::Complete(r) => r.line_number,
            RecordOutcome::Unparsable { line_number, .. } => *line_number,
        }
    }
}

/// Text of a record not yet known to be complete.
#[derive(Debug, Clone, PartialEq)]
struct PendingRecord {
    line_number: u64,
    timestamp: Option<Timestamp>,
    text: String,
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Accumulating(PendingRecord),
    Flushing(PendingRecord),
}

/// Line-at-a-time record reconstructor.
#[derive(Debug)]
pub struct RecordReconstructor {
    format: RecordFormat,
    state: State,
    last_timestamp: Option<Timestamp>,
}

impl RecordReconstructor {
    pub fn new(format: RecordFormat) -> Self {
        Self {
            format,
            state: State::Idle,
            last_timestamp: None,
        }
    }

    pub fn format(&self) -> RecordFormat {
        self.format
    }

    /// True while a record is being accumulated.
    pub fn is_accumulating(&self) -> bool {
        matches!(self.state, State::Accumulating(_))
    }

    /// Start line of the record being accumulated.
    pub fn pending_line(&self) -> Option<u64> {
        match &self.state {
            State::Accumulating(pending) | State::Flushing(pending) => Some(pending.line_number),
            State::Idle => None,
        }
    }

    /// Consume one line; returns at most one flushed record.
    pub fn feed(&mut self, line: &SourceLine) -> Option<RecordOutcome> {
        if let Some(ts) = extract_timestamp(&line.text) {
            self.last_timestamp = Some(ts);
        }

        let mut state = std::mem::take(&mut self.state);
        let mut outcome = None;
        loop {
            let (next, consumed) = self.transition(state, line);
            state = match next {
                State::Flushing(pending) => {
                    outcome = Some(self.complete(pending));
                    State::Idle
                }
                other => other,
            };
            if consumed {
                break;
            }
        }
        self.state = state;
        outcome
    }

    /// Signal end of input. A pending record is incomplete and is dropped.
    ///
    /// Returns the start line of the dropped record, if there was one.
    pub fn finish(&mut self) -> Option<u64> {
        match std::mem::take(&mut self.state) {
            State::Accumulating(pending) | State::Flushing(pending) => {
                debug!(
                    line = pending.line_number,
                    "dropping incomplete record at end of input"
                );
                Some(pending.line_number)
            }
            State::Idle => None,
        }
    }

    /// Compute the next state. The flag tells whether `line` was consumed;
    /// an unconsumed line is re-examined from the next state.
    fn transition(&self, state: State, line: &SourceLine) -> (State, bool) {
        match state {
            State::Idle => match self.record_start(&line.text) {
                Some(body) => (
                    State::Accumulating(PendingRecord {
                        line_number: line.line_number,
                        timestamp: self.last_timestamp,
                        text: body,
                    }),
                    true,
                ),
                None => (State::Idle, true),
            },
            State::Accumulating(mut pending) => {
                if self.is_record_end(&line.text) {
                    self.append(&mut pending, &line.text);
                    (State::Flushing(pending), true)
                } else if self.is_next_record_start(&line.text) {
                    (State::Flushing(pending), false)
                } else {
                    self.append(&mut pending, &line.text);
                    (State::Accumulating(pending), true)
                }
            }
            // Flushing is resolved by `feed` before the next transition.
            State::Flushing(pending) => (State::Flushing(pending), false),
        }
    }

    /// Start-of-record predicate; returns the initial body text.
    fn record_start(&self, line: &str) -> Option<String> {
        match self.format {
            RecordFormat::Json => is_json_open(line).then(|| line.to_string()),
            RecordFormat::Stderr => statement_marker(line).map(str::to_string),
        }
    }

    /// End-of-record predicate, the closing line belongs to the record.
    fn is_record_end(&self, line: &str) -> bool {
        match self.format {
            RecordFormat::Json => is_json_close(line),
            RecordFormat::Stderr => false,
        }
    }

    /// Start of the next log entry; closes the pending record without
    /// belonging to it.
    fn is_next_record_start(&self, line: &str) -> bool {
        starts_with_date(line)
    }

    fn append(&self, pending: &mut PendingRecord, line: &str) {
        pending.text.push('\n');
        match self.format {
            RecordFormat::Json => pending.text.push_str(line),
            RecordFormat::Stderr => pending.text.push_str(line.strip_prefix('\t').unwrap_or(line)),
        }
    }

    fn complete(&self, pending: PendingRecord) -> RecordOutcome {
        let PendingRecord {
            line_number,
            timestamp,
            text,
        } = pending;

        match self.format {
            RecordFormat::Json => match serde_json::from_str::<Value>(&text) {
                Ok(value @ Value::Object(_)) => RecordOutcome::Complete(CompletedRecord {
                    line_number,
                    timestamp,
                    body: RecordBody::Json(value),
                }),
                Ok(_) => RecordOutcome::Unparsable {
                    line_number,
                    reason: "record is not a JSON object".to_string(),
                },
                Err(e) => RecordOutcome::Unparsable {
                    line_number,
                    reason: format!("malformed JSON: {}", e),
                },
            },
            RecordFormat::Stderr => RecordOutcome::Complete(CompletedRecord {
                line_number,
                timestamp,
                body: RecordBody::Statement(text.trim_end().to_string()),
            }),
        }
    }
}

/// A top-level JSON object opens with a tab-indented brace.
pub fn is_json_open(line: &str) -> bool {
    line.trim_end() == "\t{"
}

pub fn is_json_close(line: &str) -> bool {
    line.trim_end() == "\t}"
}

/// Extract the statement following an execution marker.
///
/// Continuation lines (leading whitespace) never carry a marker.
pub fn statement_marker(line: &str) -> Option<&str> {
    if line.starts_with(char::is_whitespace) {
        return None;
    }
    STATEMENT_MARKER
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Adapter turning a line iterator into a record iterator.
pub struct Records<I> {
    lines: I,
    reconstructor: RecordReconstructor,
    finished: bool,
}

impl<I: Iterator<Item = SourceLine>> Records<I> {
    pub fn new(lines: I, format: RecordFormat) -> Self {
        Self {
            lines,
            reconstructor: RecordReconstructor::new(format),
            finished: false,
        }
    }
}

impl<I: Iterator<Item = SourceLine>> Iterator for Records<I> {
    type Item = RecordOutcome;

    fn next(&mut self) -> Option<RecordOutcome> {
        if self.finished {
            return None;
        }
        for line in self.lines.by_ref() {
            if let Some(outcome) = self.reconstructor.feed(&line) {
                return Some(outcome);
            }
        }
        self.finished = true;
        self.reconstructor.finish();
        None
    }
}
