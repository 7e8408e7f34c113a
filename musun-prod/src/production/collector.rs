//! Completion reconciliation.
//!
//! `reconcile` may be called any number of times, including while the job is
//! still writing its update file and from several processes at once:
//!
//! - only newline-terminated records are applied; a half-written tail is left
//!   for the next call;
//! - a run changes only while it is still `CLAIMED`, so replays are no-ops;
//! - the consumed offset only moves forward, except once when the update
//!   file was replaced by a shorter one;
//! - the job's terminal status is written at most once.
//!
//! Record application, offset advance and finalization commit together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::database::models::{JobStatus, ProductionJobDbModel, RunStatus, RunStatusCounts};
use crate::database::repositories::{JobRepository, ProductionTxOps};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{Store, time};
use crate::production::completion::{CompletionBatch, read_records};
use crate::production::descriptor::update_file_path;
use crate::{Error, Result};

/// What one reconciliation pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub job_key: i64,
    /// Runs moved to `PROCESSED` by this pass.
    pub processed_count: u64,
    /// Runs moved to `ERROR` by this pass.
    pub error_count: u64,
    /// Complete records that could not be parsed or named a run the job
    /// does not own.
    pub malformed_count: u64,
    /// Job status after this pass.
    pub job_status: JobStatus,
    /// The job is in a terminal status (whether or not this pass put it there).
    pub job_finalized: bool,
    /// Run totals for the job after this pass.
    pub runs: RunStatusCounts,
}

pub struct CompletionCollector {
    store: Store,
    jobs: Arc<dyn JobRepository>,
}

impl CompletionCollector {
    pub fn new(store: Store, jobs: Arc<dyn JobRepository>) -> Self {
        Self { store, jobs }
    }

    /// Location of the update file for a job row.
    pub fn update_file(job: &ProductionJobDbModel) -> PathBuf {
        update_file_path(Path::new(&job.outputdir), job.jobkey)
    }

    pub async fn reconcile(&self, job_key: i64) -> Result<ReconciliationReport> {
        let job = self.jobs.get_job(job_key).await?;
        let status = parse_status(&job)?;

        if status.is_terminal() {
            debug!(job_key, status = %status, "Job already terminal; nothing to reconcile");
            return Ok(ReconciliationReport {
                job_key,
                processed_count: 0,
                error_count: 0,
                malformed_count: 0,
                job_status: status,
                job_finalized: true,
                runs: self.jobs.run_counts(job_key).await?,
            });
        }

        let update_file = Self::update_file(&job);
        let batch = read_records(&update_file, job.update_offset.max(0) as u64).await?;

        for bad in &batch.malformed {
            warn!(
                job_key,
                file = %update_file.display(),
                offset = bad.offset,
                line = %bad.line,
                reason = %bad.reason,
                "Skipping malformed completion record"
            );
        }
        if batch.pending_bytes > 0 {
            debug!(
                job_key,
                pending_bytes = batch.pending_bytes,
                "Trailing record incomplete; leaving it for a later pass"
            );
        }

        let report =
            retry_on_sqlite_busy("reconcile", || self.apply_batch(job_key, &batch)).await?;

        if report.processed_count + report.error_count > 0 || report.job_finalized {
            info!(
                job_key,
                processed = report.processed_count,
                errors = report.error_count,
                malformed = report.malformed_count,
                status = %report.job_status,
                "Reconciled job"
            );
        }
        Ok(report)
    }

    async fn apply_batch(
        &self,
        job_key: i64,
        batch: &CompletionBatch,
    ) -> Result<ReconciliationReport> {
        let mut tx = self.store.begin_immediate().await?;

        let job = ProductionTxOps::get_job(&mut tx, job_key)
            .await?
            .ok_or_else(|| Error::not_found("ProductionJob", job_key))?;

        let mut processed_count = 0;
        let mut error_count = 0;
        let mut malformed_count = batch.malformed.len() as u64;

        for record in &batch.records {
            let outcome = record.outcome.run_status();
            if ProductionTxOps::apply_run_outcome(&mut tx, job_key, record.run_number, outcome)
                .await?
            {
                match outcome {
                    RunStatus::Error => error_count += 1,
                    _ => processed_count += 1,
                }
                if let Some(diag) = &record.diagnostic {
                    debug!(
                        job_key,
                        run = record.run_number,
                        diagnostic = %diag,
                        "Run reported diagnostic"
                    );
                }
            } else if !ProductionTxOps::job_owns_run(&mut tx, job_key, record.run_number).await? {
                malformed_count += 1;
                warn!(
                    job_key,
                    run = record.run_number,
                    "Completion record for a run this job never claimed"
                );
            }
        }

        match batch.restarted_from {
            Some(stale) => {
                if !ProductionTxOps::rewind_update_offset(&mut tx, job_key, stale, batch.consumed_to)
                    .await?
                {
                    debug!(job_key, stale, "Update offset already rewound by another pass");
                }
            }
            None => {
                ProductionTxOps::advance_update_offset(&mut tx, job_key, batch.consumed_to).await?
            }
        }

        let runs = ProductionTxOps::run_counts(&mut tx, job_key).await?;
        let mut job_status = parse_status(&job)?;
        let claimed = job.claimed_runs.max(0) as u64;

        if !job_status.is_terminal() && claimed > 0 && runs.finalized() >= claimed {
            let terminal = if runs.error > 0 {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            if ProductionTxOps::finalize_job(&mut tx, job_key, terminal, time::now_ms()).await? {
                job_status = terminal;
            }
        }

        tx.commit().await?;

        Ok(ReconciliationReport {
            job_key,
            processed_count,
            error_count,
            malformed_count,
            job_status,
            job_finalized: job_status.is_terminal(),
            runs,
        })
    }
}

fn parse_status(job: &ProductionJobDbModel) -> Result<JobStatus> {
    job.job_status().ok_or_else(|| {
        Error::Other(format!(
            "job {} has unknown status {:?}",
            job.jobkey, job.status
        ))
    })
}
