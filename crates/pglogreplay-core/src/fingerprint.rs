//! Query fingerprints.
//!
//! A fingerprint identifies the shape of a statement independent of its
//! literal values. The replay engine only uses fingerprints as grouping
//! keys, so the algorithm sits behind the [`Fingerprinter`] trait.
//!
//! The shipped [`NormalizingFingerprinter`] tokenizes the statement, replaces
//! literals with `?` (so `id = 1` and `id = 42` group together), collapses
//! `IN (?, ?, ...)` lists, and hashes the normalized text with xxh3.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use xxhash_rust::xxh3::xxh3_64;

/// Matches a parenthesized list of two or more placeholders.
static PLACEHOLDER_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\( \?(?: , \?)+ \)").expect("valid placeholder list regex")
});

/// Opaque identifier of a query shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes fingerprints. Equal shapes must map to equal fingerprints.
pub trait Fingerprinter {
    fn fingerprint(&self, query: &str) -> Fingerprint;
}

impl<F> Fingerprinter for F
where
    F: Fn(&str) -> Fingerprint,
{
    fn fingerprint(&self, query: &str) -> Fingerprint {
        self(query)
    }
}

/// Fingerprints by normalized text, rendered as 16 hex digits of xxh3-64.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizingFingerprinter;

impl Fingerprinter for NormalizingFingerprinter {
    fn fingerprint(&self, query: &str) -> Fingerprint {
        Fingerprint(format!("{:016x}", xxh3_64(normalize_query(query).as_bytes())))
    }
}

/// Normalize a statement into its shape.
///
/// Tokens are joined by single spaces, comments are dropped, unquoted
/// identifiers and keywords are lowercased, quoted identifiers are kept
/// verbatim, and numeric/string literals and `$n` parameters become `?`.
pub fn normalize_query(sql: &str) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens: Vec<String> = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i += 2;
        } else if c == '\'' {
            i = skip_quoted(&chars, i, '\'');
            tokens.push("?".to_string());
        } else if c == '"' {
            let end = skip_quoted(&chars, i, '"');
            tokens.push(chars[i..end.min(chars.len())].iter().collect());
            i = end;
        } else if c == '$' && next.is_some_and(|n| n.is_ascii_digit()) {
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            tokens.push("?".to_string());
        } else if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            i = skip_number(&chars, i);
            tokens.push("?".to_string());
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect::<String>().to_lowercase());
        } else {
            tokens.push(c.to_string());
            i += 1;
        }
    }

    while tokens.last().is_some_and(|t| t == ";") {
        tokens.pop();
    }

    let joined = tokens.join(" ");
    PLACEHOLDER_LIST.replace_all(&joined, "( ? )").into_owned()
}

/// Skip a quoted section starting at `start`; doubled quotes are escapes.
/// Returns the index just past the closing quote.
fn skip_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn skip_number(chars: &[char], start: usize) -> usize {
    let mut i = start;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}
