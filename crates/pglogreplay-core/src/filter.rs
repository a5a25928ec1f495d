//! Eligibility filter for replayed statements.
//!
//! Statements with side effects must not be replayed against a live
//! database. Detection is a case-insensitive textual match, not a parse: a
//! mutating statement that evades the pattern is still replayed, so run
//! against a read-only role.
//!
//! Text holding more than one statement is rejected as well. A `COMMIT`
//! smuggled after the first statement would end the read-only transaction
//! the backend wraps each replay in.

use std::sync::LazyLock;

use regex::Regex;

/// Clauses that make a statement ineligible.
static MUTATING_CLAUSES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:INSERT\s+INTO\s|UPDATE\s|DELETE\s+FROM\s|CREATE\s+TEMP(?:ORARY)?\s+TABLE\s|REFRESH\s+MATERIALIZED\s+VIEW\s)",
    )
    .expect("valid mutating clause regex")
});

/// Decides whether a statement may be replayed.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    extra: Vec<Regex>,
}

impl QueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additionally reject statements matching `pattern`.
    pub fn with_exclusion(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.extra.push(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn is_eligible(&self, query: &str) -> bool {
        is_single_statement(query)
            && !MUTATING_CLAUSES.is_match(query)
            && !self.extra.iter().any(|re| re.is_match(query))
    }
}

/// True unless a `;` outside literals and comments is followed by more SQL.
///
/// Understands single- and double-quoted text, dollar quoting, and `--` and
/// `/* */` comments (block comments nest).
pub fn is_single_statement(query: &str) -> bool {
    let bytes = query.as_bytes();
    let mut i = 0;
    let mut terminated = false;

    while i < bytes.len() {
        let b = bytes[i];
        if terminated && !b.is_ascii_whitespace() && b != b';' && !starts_comment(&bytes[i..]) {
            return false;
        }
        match b {
            b'\'' | b'"' => i = skip_quoted(bytes, i, b),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = bytes[i..]
                    .iter()
                    .position(|&c| c == b'\n')
                    .map_or(bytes.len(), |p| i + p + 1);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'$' => match dollar_tag(&bytes[i..]) {
                Some(tag) => i = skip_dollar_quoted(bytes, i, tag),
                None => i += 1,
            },
            b';' => {
                terminated = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    true
}

fn starts_comment(rest: &[u8]) -> bool {
    rest.starts_with(b"--") || rest.starts_with(b"/*")
}

/// Index just past the closing `quote`; doubled quotes are escapes.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// The `$tag$` opening a dollar-quoted string at the start of `rest`, if any.
/// Positional parameters such as `$1` are not tags.
fn dollar_tag(rest: &[u8]) -> Option<&[u8]> {
    let end = rest[1..].iter().position(|&c| c == b'$')? + 1;
    let tag = &rest[1..end];
    let valid = tag
        .first()
        .is_none_or(|c| c.is_ascii_alphabetic() || *c == b'_')
        && tag.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'_');
    valid.then_some(&rest[..=end])
}

fn skip_dollar_quoted(bytes: &[u8], start: usize, tag: &[u8]) -> usize {
    let body = start + tag.len();
    bytes[body..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map_or(bytes.len(), |p| body + p + tag.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_is_eligible() {
        let f = QueryFilter::new();
        assert!(f.is_eligible("SELECT * FROM foo"));
        assert!(f.is_eligible("select last_update from foo where updated_at > now()"));
        assert!(f.is_eligible("WITH x AS (SELECT 1) SELECT * FROM x"));
    }

    #[test]
    fn test_mutations_are_rejected() {
        let f = QueryFilter::new();
        assert!(!f.is_eligible("INSERT INTO foo VALUES (1)"));
        assert!(!f.is_eligible("insert into foo values (1)"));
        assert!(!f.is_eligible("UPDATE foo SET a = 1"));
        assert!(!f.is_eligible("delete  from foo where id = 2"));
        assert!(!f.is_eligible("CREATE TEMP TABLE t AS SELECT 1"));
        assert!(!f.is_eligible("create temporary table t (a int)"));
        assert!(!f.is_eligible("REFRESH MATERIALIZED VIEW mv"));
        assert!(!f.is_eligible("WITH moved AS (DELETE FROM a RETURNING *) SELECT * FROM moved"));
    }

    #[test]
    fn test_multi_line_statements() {
        let f = QueryFilter::new();
        assert!(!f.is_eligible("INSERT\n  INTO foo\nSELECT 1"));
        assert!(f.is_eligible("SELECT a,\n       b\nFROM t"));
    }

    #[test]
    fn test_several_statements_are_rejected() {
        let f = QueryFilter::new();
        assert!(!f.is_eligible("SELECT 1; COMMIT; DROP TABLE t"));
        assert!(!f.is_eligible("SELECT 1;\nSET default_transaction_read_only = off"));
        assert!(f.is_eligible("SELECT 1;"));
        assert!(f.is_eligible("SELECT 1 ;  ; \n"));
        assert!(f.is_eligible("SELECT 1; -- trailing note"));
    }

    #[test]
    fn test_semicolons_inside_literals_and_comments() {
        assert!(is_single_statement("SELECT 'a;b' FROM t"));
        assert!(is_single_statement("SELECT 'it''s; fine'"));
        assert!(is_single_statement(r#"SELECT "odd;name" FROM t"#));
        assert!(is_single_statement("SELECT 1 -- a; b\nFROM t"));
        assert!(is_single_statement("SELECT /* x; /* y; */ z; */ 1"));
        assert!(is_single_statement("SELECT $$a; b$$, $fn$c; d$fn$"));
        assert!(is_single_statement("SELECT * FROM t WHERE id = $1"));
        assert!(!is_single_statement("SELECT $1; DROP TABLE t"));
        assert!(!is_single_statement("SELECT 'x'; COMMIT"));
    }

    #[test]
    fn test_extra_exclusion() {
        let f = QueryFilter::new().with_exclusion(r"(?i)pg_sleep").unwrap();
        assert!(!f.is_eligible("SELECT pg_sleep(10)"));
        assert!(f.is_eligible("SELECT 1"));
        assert!(QueryFilter::new().with_exclusion("(").is_err());
    }
}
