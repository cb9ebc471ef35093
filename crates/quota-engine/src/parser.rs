//! Extraction of per-user byte counts from proxy log lines
//!
//! The proxy embeds a `%<username>@<host>(<bytes>)` token somewhere in each
//! accounting line, surrounded by free-form metadata. Only the delimiters are
//! scanned for; nothing else about the line is interpreted.

use thiserror::Error;

/// Bytes attributed to one user by a single log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEntry {
    pub username: String,
    pub bytes: u64,
}

/// The line carried the full token but the byte count is not a number
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid byte count {raw_count:?}: {reason}")]
pub struct MalformedLine {
    pub raw_count: String,
    pub reason: String,
}

/// Parse one log line.
///
/// Returns `Ok(None)` when any of `%`, `@`, `(`, `)` is missing in that
/// order, and an error when the text between the parentheses is not a base-10
/// unsigned integer.
pub fn parse_line(line: &str) -> Result<Option<UsageEntry>, MalformedLine> {
    let Some(percent) = line.find('%') else {
        return Ok(None);
    };
    let Some(at) = find_from(line, percent + 1, '@') else {
        return Ok(None);
    };
    let Some(open) = find_from(line, at, '(') else {
        return Ok(None);
    };
    let Some(close) = find_from(line, open + 1, ')') else {
        return Ok(None);
    };

    let username = &line[percent + 1..at];
    let raw_count = &line[open + 1..close];
    // u64's FromStr accepts a leading '+', the log format never has one
    let parsed = if raw_count.starts_with('+') {
        Err("unexpected sign".to_string())
    } else {
        raw_count.parse::<u64>().map_err(|e| e.to_string())
    };
    let bytes = parsed.map_err(|reason| MalformedLine {
        raw_count: raw_count.to_string(),
        reason,
    })?;

    Ok(Some(UsageEntry {
        username: username.to_string(),
        bytes,
    }))
}

fn find_from(line: &str, start: usize, needle: char) -> Option<usize> {
    line.get(start..)?.find(needle).map(|idx| idx + start)
}
