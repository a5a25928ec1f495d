//! pglogreplay-core - replay PostgreSQL query logs for statistics.
//!
//! Provides:
//! - `source`: line-oriented log readers, line windowing
//! - `timestamp`: timestamp extraction from log lines
//! - `record`: reconstruction of multi-line records (JSON plans, statements)
//! - `merge`: chronological k-way merge of several logs
//! - `filter`: rejection of statements with side effects
//! - `fingerprint`: query shape identifiers
//! - `stats`: per-fingerprint aggregation table
//! - `backend`: execute-with-plan backends (mock, PostgreSQL)
//! - `replay`: the replay engine and its run context
//! - `report`: progress rows and ranking reports
//! - `cancel`: run cancellation
//! - `error`: error types
//!
//! With `postgres` feature (default):
//! - `backend::postgres`: replay against a live server via `EXPLAIN ANALYZE`

pub mod backend;
pub mod cancel;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod merge;
pub mod record;
pub mod replay;
pub mod report;
pub mod source;
pub mod stats;
pub mod timestamp;

pub use cancel::CancelFlag;
pub use error::{BackendError, ReplayError, SourceError};
pub use replay::{ReplayConfig, ReplaySummary, Replayer, RunContext};
