//! Chronological merge of several log streams.
//!
//! Each source contributes entries: a timestamped head line followed by any
//! continuation lines without a timestamp (wrapped statements, JSON plan
//! bodies). The merger repeatedly emits the entry with the earliest head
//! timestamp, copying its continuation lines through verbatim until the
//! source produces its next timestamped line. Ties go to the lowest source
//! index.
//!
//! Memory use is one buffered head line per source.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::io::{self, Write};

use tracing::debug;

use crate::source::SourceLine;
use crate::timestamp::{Timestamp, extract_timestamp};

/// A line of the merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedLine {
    /// Index of the originating source.
    pub source: usize,
    pub line: SourceLine,
    /// Set on head lines, `None` on passthrough lines.
    pub timestamp: Option<Timestamp>,
}

struct Lane<S> {
    source: Option<S>,
    head: Option<SourceLine>,
}

/// k-way merge over timestamp-ordered line sources.
pub struct StreamMerger<S> {
    lanes: Vec<Lane<S>>,
    /// Buffered heads keyed by (timestamp, source index).
    heads: BinaryHeap<Reverse<(Timestamp, usize)>>,
    /// Lines preceding each source's first timestamp.
    leading: VecDeque<MergedLine>,
    /// Source whose continuation lines are being copied through.
    draining: Option<usize>,
}

impl<S: Iterator<Item = SourceLine>> StreamMerger<S> {
    /// Prime every source with its first timestamped line.
    ///
    /// Lines before a source's first timestamp are queued for output ahead
    /// of everything else, in source order.
    pub fn new(sources: impl IntoIterator<Item = S>) -> Self {
        let mut merger = Self {
            lanes: Vec::new(),
            heads: BinaryHeap::new(),
            leading: VecDeque::new(),
            draining: None,
        };

        for (index, source) in sources.into_iter().enumerate() {
            merger.lanes.push(Lane {
                source: Some(source),
                head: None,
            });
            while let Some(line) = merger.pull(index) {
                match extract_timestamp(&line.text) {
                    Some(ts) => {
                        merger.set_head(index, ts, line);
                        break;
                    }
                    None => merger.leading.push_back(MergedLine {
                        source: index,
                        line,
                        timestamp: None,
                    }),
                }
            }
        }

        merger
    }

    /// Number of sources that can still produce output.
    pub fn active_sources(&self) -> usize {
        self.lanes.iter().filter(|l| l.source.is_some()).count()
    }

    /// Read the next line of a source, retiring it at end of stream.
    fn pull(&mut self, index: usize) -> Option<SourceLine> {
        let lane = &mut self.lanes[index];
        let line = lane.source.as_mut()?.next();
        if line.is_none() {
            lane.source = None;
            debug!(source = index, "source exhausted, removed from merge");
        }
        line
    }

    fn set_head(&mut self, index: usize, ts: Timestamp, line: SourceLine) {
        self.lanes[index].head = Some(line);
        self.heads.push(Reverse((ts, index)));
    }
}

impl<S: Iterator<Item = SourceLine>> Iterator for StreamMerger<S> {
    type Item = MergedLine;

    fn next(&mut self) -> Option<MergedLine> {
        if let Some(line) = self.leading.pop_front() {
            return Some(line);
        }

        // Finish the refill of the source emitted last.
        if let Some(index) = self.draining {
            match self.pull(index) {
                Some(line) => match extract_timestamp(&line.text) {
                    Some(ts) => {
                        self.set_head(index, ts, line);
                        self.draining = None;
                    }
                    None => {
                        return Some(MergedLine {
                            source: index,
                            line,
                            timestamp: None,
                        });
                    }
                },
                None => self.draining = None,
            }
        }

        let Reverse((ts, index)) = self.heads.pop()?;
        let line = self.lanes[index].head.take()?;
        self.draining = Some(index);
        Some(MergedLine {
            source: index,
            line,
            timestamp: Some(ts),
        })
    }
}

/// Write every merged line to `out`, returning the number of lines written.
pub fn write_merged<S, W>(merger: StreamMerger<S>, out: &mut W) -> io::Result<u64>
where
    S: Iterator<Item = SourceLine>,
    W: Write,
{
    let mut written = 0;
    for merged in merger {
        writeln!(out, "{}", merged.line.text)?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LogSource;
    use std::io::{self, BufReader, Cursor, Read};

    /// Yields `data`, then fails every subsequent read.
    struct BrokenReader {
        data: Cursor<Vec<u8>>,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.data.read(buf)?;
            if n == 0 {
                return Err(io::Error::other("connection reset"));
            }
            Ok(n)
        }
    }

    fn source(text: &str) -> std::vec::IntoIter<SourceLine> {
        text.lines()
            .enumerate()
            .map(|(i, l)| SourceLine::new(i as u64 + 1, l))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn merged_text<S: Iterator<Item = SourceLine>>(merger: StreamMerger<S>) -> Vec<String> {
        merger.map(|m| m.line.text).collect()
    }

    #[test]
    fn test_two_sources_interleave() {
        let a = source(
            "2024-01-15 10:00:01 UTC [a] LOG:  T1\n\
             2024-01-15 10:00:03 UTC [a] LOG:  T3",
        );
        let b = source(
            "2024-01-15 10:00:02 UTC [b] LOG:  T2\n\
             2024-01-15 10:00:04 UTC [b] LOG:  T4",
        );
        let out = merged_text(StreamMerger::new(vec![a, b]));
        let tags: Vec<_> = out.iter().map(|l| &l[l.len() - 2..]).collect();
        assert_eq!(tags, vec!["T1", "T2", "T3", "T4"]);
    }

    #[test]
    fn test_continuation_lines_follow_their_head() {
        let a = source(
            "2024-01-15 10:00:01 UTC [a] LOG:  duration: 1 ms  plan:\n\
             \t{\n\
             \t  \"Query Text\": \"SELECT 1\"\n\
             \t}\n\
             2024-01-15 10:00:05 UTC [a] LOG:  later",
        );
        let b = source("2024-01-15 10:00:02 UTC [b] LOG:  between");
        let merger = StreamMerger::new(vec![a, b]);
        let out: Vec<_> = merger.collect();

        let texts: Vec<_> = out.iter().map(|m| m.line.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "2024-01-15 10:00:01 UTC [a] LOG:  duration: 1 ms  plan:",
                "\t{",
                "\t  \"Query Text\": \"SELECT 1\"",
                "\t}",
                "2024-01-15 10:00:02 UTC [b] LOG:  between",
                "2024-01-15 10:00:05 UTC [a] LOG:  later",
            ]
        );
        assert!(out[1].timestamp.is_none());
        assert_eq!(out[3].line.line_number, 4);
        assert_eq!(out[4].source, 1);
    }

    #[test]
    fn test_ties_go_to_lowest_source_index() {
        let a = source("2024-01-15 10:00:00 UTC LOG:  from a");
        let b = source("2024-01-15 10:00:00 UTC LOG:  from b");
        let c = source("2024-01-15 10:00:00 UTC LOG:  from c");
        let sources: Vec<_> = merged_text(StreamMerger::new(vec![c, a, b]))
            .into_iter()
            .map(|l| l[l.len() - 1..].to_string())
            .collect();
        assert_eq!(sources, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_output_is_sorted_and_exhausted_sources_drop_out() {
        let a = source(
            "2024-01-15 10:00:01 UTC a\n\
             2024-01-15 10:00:02 UTC a\n\
             2024-01-15 10:00:09 UTC a",
        );
        let b = source("2024-01-15 10:00:03 UTC b");
        let c = source("");
        let mut merger = StreamMerger::new(vec![a, b, c]);
        assert_eq!(merger.active_sources(), 2);

        let mut last = None;
        let mut count = 0;
        for m in merger.by_ref() {
            let ts = m.timestamp.unwrap();
            assert!(last.is_none_or(|prev| prev <= ts));
            last = Some(ts);
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(merger.active_sources(), 0);
    }

    #[test]
    fn test_removing_a_source_keeps_relative_order() {
        let a = "2024-01-15 10:00:01 UTC a1\n2024-01-15 10:00:04 UTC a2";
        let b = "2024-01-15 10:00:02 UTC b1\n2024-01-15 10:00:03 UTC b2";
        let c = "2024-01-15 10:00:02 UTC c1\n2024-01-15 10:00:05 UTC c2";

        let all = merged_text(StreamMerger::new(vec![source(a), source(b), source(c)]));
        let without_b = merged_text(StreamMerger::new(vec![source(a), source(c)]));

        let filtered: Vec<_> = all.into_iter().filter(|l| !l.contains(" b")).collect();
        assert_eq!(filtered, without_b);
    }

    #[test]
    fn test_leading_lines_without_timestamp_come_first() {
        let a = source("header of a\n2024-01-15 10:00:02 UTC a");
        let b = source("2024-01-15 10:00:01 UTC b");
        let out = merged_text(StreamMerger::new(vec![a, b]));
        assert_eq!(
            out,
            vec![
                "header of a",
                "2024-01-15 10:00:01 UTC b",
                "2024-01-15 10:00:02 UTC a",
            ]
        );
    }

    #[test]
    fn test_failing_source_drops_out_and_others_continue() {
        let flaky = LogSource::from_reader(
            "flaky",
            BufReader::new(BrokenReader {
                data: Cursor::new(
                    b"2024-01-15 10:00:01 UTC flaky 1\n2024-01-15 10:00:04 UTC flaky 2\n".to_vec(),
                ),
            }),
        );
        let healthy = LogSource::from_reader(
            "healthy",
            Cursor::new(
                "2024-01-15 10:00:02 UTC healthy 1\n\
                 2024-01-15 10:00:05 UTC healthy 2\n\
                 2024-01-15 10:00:06 UTC healthy 3\n",
            ),
        );

        let mut merger = StreamMerger::new(vec![flaky, healthy]);
        let out: Vec<_> = merger.by_ref().map(|m| (m.source, m.line.text)).collect();
        assert_eq!(
            out,
            vec![
                (0, "2024-01-15 10:00:01 UTC flaky 1".to_string()),
                (1, "2024-01-15 10:00:02 UTC healthy 1".to_string()),
                (0, "2024-01-15 10:00:04 UTC flaky 2".to_string()),
                (1, "2024-01-15 10:00:05 UTC healthy 2".to_string()),
                (1, "2024-01-15 10:00:06 UTC healthy 3".to_string()),
            ]
        );
        assert_eq!(merger.active_sources(), 0);
    }

    #[test]
    fn test_write_merged_over_log_sources() {
        let a = LogSource::from_reader("a", Cursor::new("2024-01-15 10:00:02 UTC a\n"));
        let b = LogSource::from_reader(
            "b",
            Cursor::new("2024-01-15 10:00:01 UTC b\n\tcontinued\n"),
        );
        let mut out = Vec::new();
        let written = write_merged(StreamMerger::new(vec![a, b]), &mut out).unwrap();
        assert_eq!(written, 3);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "2024-01-15 10:00:01 UTC b\n\tcontinued\n2024-01-15 10:00:02 UTC a\n"
        );
    }
}
