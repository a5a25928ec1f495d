//! Sequential line reader over a log file.
//!
//! Reads one line at a time and tracks the 1-based line number. A read
//! failure in the middle of a file ends the source instead of aborting the
//! run: the remaining sources keep going.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::SourceError;

/// A physical line read from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    /// 1-based line number within the originating file.
    pub line_number: u64,
    /// Line content without the trailing newline.
    pub text: String,
}

impl SourceLine {
    pub fn new(line_number: u64, text: impl Into<String>) -> Self {
        Self {
            line_number,
            text: text.into(),
        }
    }
}

/// An open, sequentially-readable log stream.
pub struct LogSource {
    name: String,
    reader: Box<dyn BufRead + Send>,
    line_number: u64,
    buf: Vec<u8>,
    exhausted: bool,
}

impl LogSource {
    /// Open a log file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "log source opened");
        Ok(Self::from_reader(
            path.display().to_string(),
            BufReader::new(file),
        ))
    }

    /// Wrap an arbitrary reader (in-memory logs, pipes).
    pub fn from_reader(name: impl Into<String>, reader: impl BufRead + Send + 'static) -> Self {
        Self {
            name: name.into(),
            reader: Box::new(reader),
            line_number: 0,
            buf: Vec::new(),
            exhausted: false,
        }
    }

    /// Display name used in diagnostics (file path for files).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of the last line returned, 0 before the first read.
    pub fn line_number(&self) -> u64 {
        self.line_number
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Read the next line.
    ///
    /// Returns `None` at end of stream, and also after an I/O error, which is
    /// reported as a warning. Invalid UTF-8 is replaced rather than rejected.
    pub fn next_line(&mut self) -> Option<SourceLine> {
        if self.exhausted {
            return None;
        }

        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.exhausted = true;
                debug!(source = %self.name, lines = self.line_number, "log source exhausted");
                None
            }
            Ok(_) => {
                self.line_number += 1;
                trim_newline(&mut self.buf);
                Some(SourceLine {
                    line_number: self.line_number,
                    text: String::from_utf8_lossy(&self.buf).into_owned(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.next_line(),
            Err(e) => {
                self.exhausted = true;
                warn!(
                    source = %self.name,
                    after_line = self.line_number,
                    error = %e,
                    "log source failed, treating as end of stream"
                );
                None
            }
        }
    }
}

impl Iterator for LogSource {
    type Item = SourceLine;

    fn next(&mut self) -> Option<SourceLine> {
        self.next_line()
    }
}

fn trim_newline(buf: &mut Vec<u8>) {
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
}

/// Range of line numbers eligible for processing.
///
/// Lines numbered `<= skip_lines` and `> max_lines` are outside the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineWindow {
    pub skip_lines: Option<u64>,
    pub max_lines: Option<u64>,
}

impl LineWindow {
    pub fn new(skip_lines: Option<u64>, max_lines: Option<u64>) -> Self {
        Self {
            skip_lines,
            max_lines,
        }
    }

    pub fn contains(&self, line_number: u64) -> bool {
        if self.skip_lines.is_some_and(|skip| line_number <= skip) {
            return false;
        }
        !self.is_past_end(line_number)
    }

    /// True once a single, ordered source can stop reading.
    pub fn is_past_end(&self, line_number: u64) -> bool {
        self.max_lines.is_some_and(|max| line_number > max)
    }
}
