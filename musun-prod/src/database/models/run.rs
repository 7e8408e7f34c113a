//! Production run database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One input run (a MIDAS file) known to the tracker.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProductionRunDbModel {
    pub runkey: i64,
    pub dataset: String,
    pub runnumber: i64,
    pub responsefile: String,
    /// Set exactly once, when a job claims the run.
    pub jobkey: Option<i64>,
    /// Status: UNCLAIMED, CLAIMED, PROCESSED, ERROR
    pub status: String,
}

impl ProductionRunDbModel {
    pub fn run_status(&self) -> Option<RunStatus> {
        RunStatus::parse(&self.status)
    }
}

/// An unclaimed run offered by the selector.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RunCandidate {
    pub runkey: i64,
    pub runnumber: i64,
    pub responsefile: String,
}

/// A run to register, before the store assigns its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub runnumber: i64,
    pub responsefile: String,
}

impl NewRun {
    pub fn new(runnumber: i64, responsefile: impl Into<String>) -> Self {
        Self {
            runnumber,
            responsefile: responsefile.into(),
        }
    }
}

/// Run status values: `UNCLAIMED → CLAIMED → {PROCESSED | ERROR}`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Unclaimed,
    Claimed,
    Processed,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclaimed => "UNCLAIMED",
            Self::Claimed => "CLAIMED",
            Self::Processed => "PROCESSED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNCLAIMED" => Some(Self::Unclaimed),
            "CLAIMED" => Some(Self::Claimed),
            "PROCESSED" => Some(Self::Processed),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Error)
    }
}

/// Per-status run counts, for one job or one dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusCounts {
    pub unclaimed: u64,
    pub claimed: u64,
    pub processed: u64,
    pub error: u64,
}

impl RunStatusCounts {
    pub fn total(&self) -> u64 {
        self.unclaimed + self.claimed + self.processed + self.error
    }

    pub fn finalized(&self) -> u64 {
        self.processed + self.error
    }

    pub(crate) fn add(&mut self, status: &str, count: i64) {
        let count = count.max(0) as u64;
        match RunStatus::parse(status) {
            Some(RunStatus::Unclaimed) => self.unclaimed += count,
            Some(RunStatus::Claimed) => self.claimed += count,
            Some(RunStatus::Processed) => self.processed += count,
            Some(RunStatus::Error) => self.error += count,
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Processed.is_terminal());
        assert!(RunStatus::Error.is_terminal());
        assert!(!RunStatus::Claimed.is_terminal());
        assert!(!RunStatus::Unclaimed.is_terminal());
    }

    #[test]
    fn test_counts_accumulate() {
        let mut counts = RunStatusCounts::default();
        counts.add("CLAIMED", 3);
        counts.add("PROCESSED", 8);
        counts.add("ERROR", 1);
        counts.add("BOGUS", 5);

        assert_eq!(counts.total(), 12);
        assert_eq!(counts.finalized(), 9);
    }
}
