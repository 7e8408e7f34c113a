//! Completion records written by the analysis job (`DBUpdateFile_<jobkey>`).
//!
//! The file is append-only, one record per processed run:
//!
//! ```text
//! 69303 SUCCESS
//! 69304 FAILURE mu exited with status 3
//! ```
//!
//! A record is complete once its terminating `\n` is on disk. The job may
//! still be writing when the file is read, so parsing stops at the last
//! newline and reports how far it got; the tail is picked up next time.

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::str::FromStr;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::warn;

use crate::database::models::RunStatus;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn run_status(self) -> RunStatus {
        match self {
            Self::Success => RunStatus::Processed,
            Self::Failure => RunStatus::Error,
        }
    }
}

impl FromStr for Outcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" | "OK" => Ok(Self::Success),
            "FAILURE" | "FAIL" | "ERROR" => Ok(Self::Failure),
            other => Err(Error::malformed(format!("unknown outcome {other:?}"))),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Failure => f.write_str("FAILURE"),
        }
    }
}

/// Outcome of one run as reported by the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub run_number: i64,
    pub outcome: Outcome,
    /// Free text after the outcome, usually the failure reason.
    pub diagnostic: Option<String>,
}

impl CompletionRecord {
    pub fn success(run_number: i64) -> Self {
        Self {
            run_number,
            outcome: Outcome::Success,
            diagnostic: None,
        }
    }

    pub fn failure(run_number: i64, diagnostic: impl Into<String>) -> Self {
        Self {
            run_number,
            outcome: Outcome::Failure,
            diagnostic: Some(diagnostic.into()),
        }
    }

    /// The record as one newline-terminated line.
    pub fn to_line(&self) -> String {
        match &self.diagnostic {
            Some(diag) => format!("{} {} {}\n", self.run_number, self.outcome, diag),
            None => format!("{} {}\n", self.run_number, self.outcome),
        }
    }
}

impl FromStr for CompletionRecord {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (run, rest) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| Error::malformed(format!("expected '<run> <outcome>', got {line:?}")))?;
        let run_number = run
            .parse::<i64>()
            .map_err(|e| Error::malformed(format!("bad run number {run:?}: {e}")))?;

        let rest = rest.trim_start();
        let (outcome, diagnostic) = match rest.split_once(char::is_whitespace) {
            Some((outcome, diag)) => (outcome, Some(diag.trim()).filter(|d| !d.is_empty())),
            None => (rest, None),
        };

        Ok(Self {
            run_number,
            outcome: outcome.parse()?,
            diagnostic: diagnostic.map(str::to_string),
        })
    }
}

/// A complete line that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    /// Byte offset of the line in the file.
    pub offset: u64,
    pub line: String,
    pub reason: String,
}

/// Complete records found past some offset of an update file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionBatch {
    pub records: Vec<CompletionRecord>,
    pub malformed: Vec<MalformedLine>,
    /// Offset just past the last complete line; resume reading here.
    pub consumed_to: u64,
    /// Bytes of an unterminated trailing record, left for a later read.
    pub pending_bytes: u64,
    /// Set when the file had shrunk below this stale offset and was read
    /// from the start instead.
    pub restarted_from: Option<u64>,
}

/// Parse the complete lines of `buf`, which starts at `base_offset` in the file.
pub fn parse_records(buf: &[u8], base_offset: u64) -> CompletionBatch {
    let mut batch = CompletionBatch {
        consumed_to: base_offset,
        ..Default::default()
    };

    let mut start = 0usize;
    while let Some(pos) = buf[start..].iter().position(|&b| b == b'\n') {
        let end = start + pos;
        let offset = base_offset + start as u64;
        let raw = &buf[start..end];
        start = end + 1;

        let line = match std::str::from_utf8(raw) {
            Ok(line) => line.trim_end_matches('\r'),
            Err(e) => {
                batch.malformed.push(MalformedLine {
                    offset,
                    line: String::from_utf8_lossy(raw).into_owned(),
                    reason: format!("not UTF-8: {e}"),
                });
                continue;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match trimmed.parse::<CompletionRecord>() {
            Ok(record) => batch.records.push(record),
            Err(e) => batch.malformed.push(MalformedLine {
                offset,
                line: trimmed.to_string(),
                reason: match e {
                    Error::MalformedRecord(reason) => reason,
                    other => other.to_string(),
                },
            }),
        }
    }

    batch.consumed_to = base_offset + start as u64;
    batch.pending_bytes = (buf.len() - start) as u64;
    batch
}

/// Read complete records from `path` starting at byte `offset`.
///
/// A missing file means the job has not reported anything yet. A file shorter
/// than `offset` was replaced, so it is read again from the start and the
/// stale offset is reported in `restarted_from`; applying a record twice is
/// harmless.
pub async fn read_records(path: &Path, offset: u64) -> Result<CompletionBatch> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CompletionBatch {
                consumed_to: offset,
                ..Default::default()
            });
        }
        Err(e) => return Err(Error::io_path("opening update file", path, e)),
    };

    let len = file
        .metadata()
        .await
        .map_err(|e| Error::io_path("reading metadata of", path, e))?
        .len();
    let restarted = len < offset;
    let start = if restarted {
        warn!(
            path = %path.display(),
            len,
            offset,
            "Update file shrank below consumed offset; rereading from start"
        );
        0
    } else {
        offset
    };

    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| Error::io_path("seeking", path, e))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .await
        .map_err(|e| Error::io_path("reading", path, e))?;

    let mut batch = parse_records(&buf, start);
    if restarted {
        batch.restarted_from = Some(offset);
    }
    Ok(batch)
}
