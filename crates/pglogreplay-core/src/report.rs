//! Text output: the per-record progress stream and the ranking report.
//!
//! Both are CSV with `#`-prefixed comment lines, written to any `Write`.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;

use crate::fingerprint::Fingerprint;
use crate::record::RecordFormat;
use crate::stats::{AggregationTable, Metric, PlanMetrics, QueryStats};

/// Default number of entries per ranking.
pub const DEFAULT_TOP: usize = 100;

/// Maximum statement preview length in the ranking report, in characters.
pub const STATEMENT_PREVIEW_LEN: usize = 150;

/// Token closing progress rows for failed records.
pub const ERROR_TOKEN: &str = "ERROR";

/// Progress stream header.
pub fn progress_header() -> String {
    let mut header = String::from("elapsed_in_secs,execution_number,line_number,fingerprint,count");
    for metric in Metric::ALL {
        header.push_str(&format!(",{0},avg_{0}", metric.column()));
    }
    header
}

/// What a progress row reports after the count column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowValues {
    /// Executed: each metric's sample followed by its running average.
    Metrics {
        sample: PlanMetrics,
        averages: PlanMetrics,
    },
    /// Counted but not executed.
    Skipped,
    /// The record or its execution failed.
    Error,
}

/// One line of the progress stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressRow<'a> {
    pub elapsed_secs: f64,
    pub execution_number: u64,
    pub line_number: u64,
    /// `None` for records that never got a fingerprint (unparsable).
    pub fingerprint: Option<&'a Fingerprint>,
    pub count: u64,
    pub values: RowValues,
}

impl fmt::Display for ProgressRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6},{},{},{},{}",
            self.elapsed_secs,
            self.execution_number,
            self.line_number,
            self.fingerprint.map(Fingerprint::as_str).unwrap_or(""),
            self.count
        )?;
        match &self.values {
            RowValues::Metrics { sample, averages } => {
                for metric in Metric::ALL {
                    write!(f, ",{},{}", sample.get(metric), averages.get(metric))?;
                }
                Ok(())
            }
            RowValues::Skipped => Ok(()),
            RowValues::Error => write!(f, ",{}", ERROR_TOKEN),
        }
    }
}

/// Banner printed before the progress header.
pub fn write_banner<W: Write>(
    out: &mut W,
    format: RecordFormat,
    files: usize,
    skip_lines: Option<u64>,
) -> io::Result<()> {
    let kind = match format {
        RecordFormat::Json => "JSON",
        RecordFormat::Stderr => "LOG",
    };
    let plural = if files > 1 { "S" } else { "" };
    match skip_lines {
        Some(skip) if skip > 0 => writeln!(
            out,
            "# REPLAYING {} FILE{} (skipping {} lines)",
            kind, plural, skip
        ),
        _ => writeln!(out, "# REPLAYING {} FILE{}", kind, plural),
    }
}

/// Key a ranking is sorted by, descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankKey {
    TotalCost,
    Count,
    TotalTime,
}

impl RankKey {
    /// Default rankings, in print order.
    pub const DEFAULT: [RankKey; 2] = [RankKey::TotalCost, RankKey::Count];

    pub fn title(&self) -> &'static str {
        match self {
            RankKey::TotalCost => "TOTAL_COST",
            RankKey::Count => "COUNT",
            RankKey::TotalTime => "TOTAL_TIME",
        }
    }

    fn value(&self, stats: &QueryStats) -> f64 {
        match self {
            RankKey::TotalCost => stats.totals.cost,
            RankKey::Count => stats.count as f64,
            RankKey::TotalTime => stats.totals.time,
        }
    }
}

impl FromStr for RankKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cost" | "total_cost" => Ok(RankKey::TotalCost),
            "count" => Ok(RankKey::Count),
            "time" | "total_time" => Ok(RankKey::TotalTime),
            other => Err(format!(
                "unknown ranking key '{}' (expected cost, count or time)",
                other
            )),
        }
    }
}

/// Top `top` entries by `key`, descending. Ties keep first-seen order.
pub fn rank(table: &AggregationTable, key: RankKey, top: usize) -> Vec<&QueryStats> {
    let mut entries: Vec<&QueryStats> = table.iter().collect();
    entries.sort_by(|a, b| key.value(b).total_cmp(&key.value(a)));
    entries.truncate(top);
    entries
}

/// Write one ranking section: blank line, title, CSV header, rows.
///
/// Rows carry each metric's total. The `avg_` column names are kept for
/// compatibility with existing consumers of the report.
pub fn write_ranking<W: Write>(
    out: &mut W,
    table: &AggregationTable,
    key: RankKey,
    top: usize,
) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "# {} : show the top {} queries", key.title(), top)?;
    writeln!(
        out,
        "fingerprint,statement,count,avg_cost,avg_time,avg_shared_hit_blocks,avg_shared_read_blocks"
    )?;
    for stats in rank(table, key, top) {
        write!(
            out,
            "{},{},{}",
            stats.fingerprint,
            statement_preview(&stats.statement),
            stats.count
        )?;
        for metric in Metric::ALL {
            write!(out, ",{}", stats.totals.get(metric))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Single-line, length-bounded, CSV-safe rendering of a statement.
pub fn statement_preview(statement: &str) -> String {
    let collapsed = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = collapsed.chars().take(STATEMENT_PREVIEW_LEN).collect();
    csv_field(&truncated).into_owned()
}

fn csv_field(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Occurrence;

    fn metrics(cost: f64, time: f64) -> PlanMetrics {
        PlanMetrics {
            cost,
            time,
            shared_hit_blocks: 0.0,
            shared_read_blocks: 0.0,
        }
    }

    #[test]
    fn test_progress_header() {
        assert_eq!(
            progress_header(),
            "elapsed_in_secs,execution_number,line_number,fingerprint,count,cost,avg_cost,time,avg_time,shared_hit_blocks,avg_shared_hit_blocks,shared_read_blocks,avg_shared_read_blocks"
        );
    }

    #[test]
    fn test_progress_rows() {
        let fp = Fingerprint::new("abc");
        let executed = ProgressRow {
            elapsed_secs: 1.5,
            execution_number: 3,
            line_number: 42,
            fingerprint: Some(&fp),
            count: 2,
            values: RowValues::Metrics {
                sample: PlanMetrics {
                    cost: 10.0,
                    time: 0.5,
                    shared_hit_blocks: 4.0,
                    shared_read_blocks: 1.0,
                },
                averages: PlanMetrics {
                    cost: 7.5,
                    time: 0.25,
                    shared_hit_blocks: 2.0,
                    shared_read_blocks: 0.5,
                },
            },
        };
        assert_eq!(
            executed.to_string(),
            "1.500000,3,42,abc,2,10,7.5,0.5,0.25,4,2,1,0.5"
        );

        let skipped = ProgressRow {
            values: RowValues::Skipped,
            ..executed.clone()
        };
        assert_eq!(skipped.to_string(), "1.500000,3,42,abc,2");

        let unparsable = ProgressRow {
            fingerprint: None,
            count: 0,
            values: RowValues::Error,
            ..executed
        };
        assert_eq!(unparsable.to_string(), "1.500000,3,42,,0,ERROR");
    }

    #[test]
    fn test_banner() {
        let mut out = Vec::new();
        write_banner(&mut out, RecordFormat::Json, 1, Some(100)).unwrap();
        write_banner(&mut out, RecordFormat::Stderr, 2, None).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "# REPLAYING JSON FILE (skipping 100 lines)\n# REPLAYING LOG FILES\n"
        );
    }

    #[test]
    fn test_rank_is_descending_and_stable() {
        let mut table = AggregationTable::new();
        table.record(&Fingerprint::new("a"), "qa", Occurrence::Executed(metrics(5.0, 1.0)));
        table.record(&Fingerprint::new("b"), "qb", Occurrence::Executed(metrics(9.0, 1.0)));
        table.record(&Fingerprint::new("c"), "qc", Occurrence::Executed(metrics(5.0, 1.0)));
        table.record(&Fingerprint::new("c"), "qc", Occurrence::Skipped);

        let by_cost: Vec<_> = rank(&table, RankKey::TotalCost, 10)
            .iter()
            .map(|s| s.fingerprint.as_str())
            .collect();
        assert_eq!(by_cost, vec!["b", "a", "c"]);

        let by_count: Vec<_> = rank(&table, RankKey::Count, 2)
            .iter()
            .map(|s| s.fingerprint.as_str())
            .collect();
        assert_eq!(by_count, vec!["c", "a"]);

        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_write_ranking() {
        let mut table = AggregationTable::new();
        let fp = Fingerprint::new("f1");
        table.record(&fp, "SELECT a, b\n  FROM t", Occurrence::Executed(metrics(4.0, 2.0)));
        table.record(&fp, "SELECT a, b FROM t", Occurrence::Executed(metrics(2.0, 1.0)));
        table.record(&Fingerprint::new("f2"), "SELECT 1", Occurrence::Failed);

        let mut out = Vec::new();
        write_ranking(&mut out, &table, RankKey::TotalCost, DEFAULT_TOP).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "\n# TOTAL_COST : show the top 100 queries\n\
             fingerprint,statement,count,avg_cost,avg_time,avg_shared_hit_blocks,avg_shared_read_blocks\n\
             f1,\"SELECT a, b FROM t\",2,6,3,0,0\n\
             f2,SELECT 1,1,0,0,0,0\n"
        );
    }

    #[test]
    fn test_ranking_rows_carry_totals() {
        let mut table = AggregationTable::new();
        let fp = Fingerprint::new("f1");
        let sample = |v: f64| PlanMetrics {
            cost: v,
            time: v,
            shared_hit_blocks: v,
            shared_read_blocks: v,
        };
        table.record(&fp, "SELECT 1", Occurrence::Executed(sample(4.0)));
        table.record(&fp, "SELECT 1", Occurrence::Executed(sample(2.0)));
        table.record(&fp, "SELECT 1", Occurrence::Skipped);

        let mut out = Vec::new();
        write_ranking(&mut out, &table, RankKey::TotalCost, DEFAULT_TOP).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().last(), Some("f1,SELECT 1,3,6,6,6,6"));
    }

    #[test]
    fn test_statement_preview() {
        let long = format!("SELECT {} FROM t", "x".repeat(300));
        let preview = statement_preview(&long);
        assert_eq!(preview.chars().count(), STATEMENT_PREVIEW_LEN);

        assert_eq!(statement_preview("SELECT\n\t1"), "SELECT 1");
        assert_eq!(
            statement_preview(r#"SELECT "a" FROM t"#),
            r#""SELECT ""a"" FROM t""#
        );
    }

    #[test]
    fn test_rank_key_from_str() {
        assert_eq!("cost".parse::<RankKey>(), Ok(RankKey::TotalCost));
        assert_eq!("COUNT".parse::<RankKey>(), Ok(RankKey::Count));
        assert_eq!("total_time".parse::<RankKey>(), Ok(RankKey::TotalTime));
        assert!("rows".parse::<RankKey>().is_err());
    }
}
