//! Production job database model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::ms_to_datetime;

/// One batch submission to the scheduler.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ProductionJobDbModel {
    pub jobkey: i64,
    pub dataset: String,
    /// Epoch milliseconds when the job row was created.
    pub submittime: i64,
    pub outputdir: String,
    pub odb: String,
    /// Status: SUBMITTED, RUNNING, COMPLETED, FAILED
    pub status: String,
    /// Number of runs claimed when the job was submitted.
    pub claimed_runs: i64,
    /// Bytes of the update file already consumed by reconciliation.
    pub update_offset: i64,
    pub completetime: Option<i64>,
}

impl ProductionJobDbModel {
    pub fn job_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        ms_to_datetime(self.submittime)
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completetime.and_then(ms_to_datetime)
    }
}

/// Values for a job row about to be inserted; the store assigns the key.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub dataset: String,
    pub submittime: i64,
    pub outputdir: String,
    pub odb: String,
}

/// Job status values.
///
/// `SUBMITTED → RUNNING → {COMPLETED | FAILED}`, plus `SUBMITTED → FAILED`
/// when the scheduler rejects the submission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Row written, scheduler not yet invoked.
    Submitted,
    /// Scheduler accepted the job.
    Running,
    /// Every claimed run processed.
    Completed,
    /// Scheduler rejected the job, or at least one run errored.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(Self::Submitted),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}
