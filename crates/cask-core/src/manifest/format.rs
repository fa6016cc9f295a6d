//! Line grammar for manifest logs.
//!
//! One record per LF-terminated line:
//!
//! ```text
//! V2 type uid:gid:mode ctime mtime - size hash 0 path     header (literal)
//! SOURCE <absolute-root-path>
//! D <uid>:<gid>:<mode> <ctime> <mtime> - 0 - 0 <json-path>
//! F <uid>:<gid>:<mode> <ctime> <mtime> - <size> <hash> 0 <json-path>
//! V2 STATUS <status-word> <json-stats-object>
//! ```
//!
//! The `-` and trailing `0` columns are obsolete placeholders; they are
//! accepted and ignored. Paths are JSON-quoted so spaces and quotes survive,
//! with `\` separators normalised to `/` before writing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CaskError, Result};

/// Header line written at the top of every log.
pub const HEADER_V2: &str = "V2 type uid:gid:mode ctime mtime - size hash 0 path";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
}

/// A parsed `D` or `F` line.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub kind: EntryKind,
    /// Empty on platforms without meaningful ownership.
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: u32,
    pub ctime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    /// `None` for directories (recorded as `-`).
    pub hash: Option<String>,
    /// `/`-separated path relative to the source root.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// V1/V2 header; the raw line is kept so logs round-trip.
    Header { version: u8, raw: String },
    Source { root: String },
    Entry(FileEntry),
    Status {
        version: u8,
        status: String,
        /// Raw JSON stats object, preserved verbatim.
        stats_json: String,
    },
    /// A line with an unrecognised leading token, preserved rather than
    /// rejected.
    Unknown { raw: String },
}

/// Per-run counters serialised into the STATUS line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
    pub backed_up: BackedUpStats,
    pub skipped: u64,
    #[serde(default)]
    pub added: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub unchanged: u64,
    #[serde(default)]
    pub checked: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackedUpStats {
    pub files: u64,
    pub bytes: u64,
}

/// ISO-8601 UTC with millisecond precision, e.g. `2024-01-15T13:45:12.345Z`.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CaskError::Parse(format!("bad timestamp '{s}': {e}")))
}

/// The `<when>` suffix of a finalised log: the ISO timestamp with `-`, `:`,
/// and `.` stripped, e.g. `20240115T134512345Z`.
pub fn compact_when(t: DateTime<Utc>) -> String {
    format_time(t)
        .chars()
        .filter(|c| !matches!(c, '-' | ':' | '.'))
        .collect()
}

/// Inverse of [`compact_when`]: separators are re-inserted at fixed offsets.
pub fn expand_when(s: &str) -> Result<DateTime<Utc>> {
    let bytes = s.as_bytes();
    if bytes.len() != 19 || bytes[8] != b'T' || bytes[18] != b'Z' {
        return Err(CaskError::Parse(format!("bad log timestamp '{s}'")));
    }
    parse_time(&format!(
        "{}-{}-{}T{}:{}:{}.{}Z",
        &s[0..4],
        &s[4..6],
        &s[6..8],
        &s[9..11],
        &s[11..13],
        &s[13..15],
        &s[15..18]
    ))
}

fn id_to_string(id: Option<u32>) -> String {
    id.map(|v| v.to_string()).unwrap_or_default()
}

/// Serialise an entry back to its manifest line (no trailing newline).
pub fn entry_to_line(e: &FileEntry) -> String {
    let path = serde_json::to_string(&e.path).expect("string serialises");
    let (tag, size, hash) = match e.kind {
        EntryKind::Dir => ("D", 0, "-".to_string()),
        EntryKind::File => (
            "F",
            e.size,
            e.hash.clone().unwrap_or_else(|| "-".to_string()),
        ),
    };
    format!(
        "{tag} {}:{}:{:o} {} {} - {size} {hash} 0 {path}",
        id_to_string(e.uid),
        id_to_string(e.gid),
        e.mode,
        format_time(e.ctime),
        format_time(e.mtime),
    )
}

/// Serialise any record back to its line form.
pub fn record_to_line(record: &Record) -> String {
    match record {
        Record::Header { raw, .. } | Record::Unknown { raw } => raw.clone(),
        Record::Source { root } => format!("SOURCE {root}"),
        Record::Entry(e) => entry_to_line(e),
        Record::Status {
            version,
            status,
            stats_json,
        } => format!("V{version} STATUS {status} {stats_json}"),
    }
}

/// Parse one manifest line. Unknown leading tokens become
/// [`Record::Unknown`]; only malformed `D`/`F` lines are errors.
pub fn parse_line(line: &str) -> Result<Record> {
    if let Some(root) = line.strip_prefix("SOURCE ") {
        return Ok(Record::Source {
            root: root.to_string(),
        });
    }
    if line.starts_with("D ") || line.starts_with("F ") {
        return parse_entry(line);
    }
    for version in [1u8, 2] {
        let prefix = format!("V{version} ");
        if let Some(rest) = line.strip_prefix(&prefix) {
            if let Some(status_rest) = rest.strip_prefix("STATUS ") {
                let (status, stats_json) = status_rest.split_once(' ').unwrap_or((status_rest, ""));
                return Ok(Record::Status {
                    version,
                    status: status.to_string(),
                    stats_json: stats_json.to_string(),
                });
            }
            return Ok(Record::Header {
                version,
                raw: line.to_string(),
            });
        }
    }
    Ok(Record::Unknown {
        raw: line.to_string(),
    })
}

fn parse_id(s: &str, line: &str) -> Result<Option<u32>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|_| CaskError::Parse(format!("bad uid/gid in '{line}'")))
}

fn parse_entry(line: &str) -> Result<Record> {
    let mut cols = line.splitn(9, ' ');
    let mut next = |what: &str| {
        cols.next()
            .ok_or_else(|| CaskError::Parse(format!("missing {what} column in '{line}'")))
    };

    let kind = match next("tag")? {
        "D" => EntryKind::Dir,
        "F" => EntryKind::File,
        other => return Err(CaskError::Parse(format!("bad entry tag '{other}'"))),
    };

    let perms = next("permissions")?;
    let ctime = parse_time(next("ctime")?)?;
    let mtime = parse_time(next("mtime")?)?;
    let _obsolete = next("placeholder")?;
    let size: u64 = next("size")?
        .parse()
        .map_err(|_| CaskError::Parse(format!("bad size in '{line}'")))?;
    let hash = match next("hash")? {
        "-" => None,
        h => Some(h.to_string()),
    };
    let _obsolete = next("placeholder")?;
    let path: String = serde_json::from_str(next("path")?)
        .map_err(|e| CaskError::Parse(format!("bad path column in '{line}': {e}")))?;

    let mut perm_cols = perms.splitn(3, ':');
    let uid = parse_id(perm_cols.next().unwrap_or(""), line)?;
    let gid = parse_id(perm_cols.next().unwrap_or(""), line)?;
    let mode = u32::from_str_radix(perm_cols.next().unwrap_or(""), 8)
        .map_err(|_| CaskError::Parse(format!("bad mode in '{line}'")))?;

    Ok(Record::Entry(FileEntry {
        kind,
        uid,
        gid,
        mode,
        ctime,
        mtime,
        size,
        hash,
        path,
    }))
}
