//! Job submission.
//!
//! A submission allocates a job key, claims a batch of unclaimed runs for it
//! in one immediate transaction, writes the job descriptor, and hands the
//! descriptor to the scheduler. The scheduler's acceptance moves the job to
//! `RUNNING`; whether the job succeeds is only known after reconciliation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::TrackerConfig;
use crate::database::models::{JobStatus, NewJob, RunCandidate};
use crate::database::repositories::ProductionTxOps;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{Store, time};
use crate::production::descriptor::{JobDescriptor, descriptor_path, update_file_path};
use crate::production::registry::DatasetRegistry;
use crate::production::scheduler::{Scheduler, SubmissionRequest};
use crate::production::selector::RunSelector;
use crate::utils::fs::ensure_dir_all;
use crate::{Error, Result};

/// An accepted submission.
#[derive(Debug, Clone, Serialize)]
pub struct JobSubmission {
    pub job_key: i64,
    pub dataset: String,
    pub requested: usize,
    /// Claimed runs in ascending run number.
    pub claimed_runs: Vec<RunCandidate>,
    pub descriptor: PathBuf,
    /// Whatever the scheduler printed when it accepted the job.
    pub scheduler_output: String,
}

impl JobSubmission {
    /// Fewer runs were available than requested.
    pub fn is_partial(&self) -> bool {
        self.claimed_runs.len() < self.requested
    }
}

pub struct JobSubmitter {
    config: Arc<TrackerConfig>,
    store: Store,
    registry: Arc<DatasetRegistry>,
    selector: Arc<RunSelector>,
    scheduler: Arc<dyn Scheduler>,
}

impl JobSubmitter {
    pub fn new(
        config: Arc<TrackerConfig>,
        store: Store,
        registry: Arc<DatasetRegistry>,
        selector: Arc<RunSelector>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            selector,
            scheduler,
        }
    }

    /// Submit one job processing up to `count` unclaimed runs of `dataset`.
    ///
    /// On `SubmissionFailed` the job row is `FAILED` and its runs stay
    /// claimed by it.
    pub async fn submit_job(&self, dataset: &str, count: usize) -> Result<JobSubmission> {
        if count == 0 {
            return Err(Error::config("requested run count must be at least 1"));
        }

        let dataset_path = self
            .registry
            .resolve_dataset(dataset)
            .await
            .map_err(|e| match e {
                Error::NotFound { .. } => Error::UnknownDataset(dataset.to_string()),
                other => other,
            })?;

        let candidates = self.selector.select_runs(dataset, count).await?;
        if candidates.is_empty() {
            return Err(Error::NoUnclaimedRuns {
                dataset: dataset.to_string(),
            });
        }
        if candidates.len() < count {
            warn!(
                dataset,
                requested = count,
                available = candidates.len(),
                "Fewer unclaimed runs than requested; submitting a smaller batch"
            );
        }

        let output_dir = self.config.dataset_output_dir(dataset);
        let (job_key, claimed_runs) = retry_on_sqlite_busy("claim_runs", || {
            self.allocate_and_claim(dataset, &output_dir, &candidates, count)
        })
        .await?;

        info!(
            job_key,
            dataset,
            dataset_path = %dataset_path.display(),
            claimed = claimed_runs.len(),
            "Runs claimed for new job"
        );

        let descriptor = self.build_descriptor(job_key, dataset, &output_dir, &claimed_runs);
        let descriptor_file = descriptor_path(&output_dir, job_key);
        if let Err(e) = self.write_descriptor(&descriptor, &descriptor_file).await {
            error!(job_key, error = %e, "Failed to write job descriptor");
            self.mark_job(job_key, JobStatus::Failed).await?;
            return Err(Error::SubmissionFailed {
                job_key,
                reason: format!("descriptor not written: {e}"),
            });
        }

        let request = SubmissionRequest {
            job_key,
            descriptor: descriptor_file.clone(),
            output_dir: output_dir.clone(),
        };
        match self.scheduler.submit(&request).await {
            Ok(ack) => {
                self.mark_job(job_key, JobStatus::Running).await?;
                Ok(JobSubmission {
                    job_key,
                    dataset: dataset.to_string(),
                    requested: count,
                    claimed_runs,
                    descriptor: descriptor_file,
                    scheduler_output: ack.output,
                })
            }
            Err(e) => {
                error!(job_key, error = %e, "Scheduler rejected job; runs stay claimed");
                self.mark_job(job_key, JobStatus::Failed).await?;
                Err(Error::SubmissionFailed {
                    job_key,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Insert the job row and claim runs for it, all or nothing.
    ///
    /// Each candidate is claimed only if still unclaimed. Candidates lost to
    /// a concurrent submitter are replaced from a selection made under the
    /// write lock, so the batch is as full as the dataset allows.
    async fn allocate_and_claim(
        &self,
        dataset: &str,
        output_dir: &Path,
        candidates: &[RunCandidate],
        count: usize,
    ) -> Result<(i64, Vec<RunCandidate>)> {
        let mut tx = self.store.begin_immediate().await?;

        let job_key = ProductionTxOps::insert_job(
            &mut tx,
            &NewJob {
                dataset: dataset.to_string(),
                submittime: time::now_ms(),
                outputdir: output_dir.display().to_string(),
                odb: self.config.odb.clone(),
            },
        )
        .await?;

        let mut claimed = Vec::with_capacity(count);
        let mut conflicts = 0usize;
        for candidate in candidates.iter().take(count) {
            if ProductionTxOps::claim_run(&mut tx, candidate.runkey, job_key).await? {
                claimed.push(candidate.clone());
            } else {
                conflicts += 1;
                debug!(
                    job_key,
                    run = candidate.runnumber,
                    "Run claimed concurrently; skipping"
                );
            }
        }

        if claimed.len() < count {
            let refill =
                ProductionTxOps::select_unclaimed(&mut tx, dataset, count - claimed.len()).await?;
            for candidate in refill {
                if ProductionTxOps::claim_run(&mut tx, candidate.runkey, job_key).await? {
                    claimed.push(candidate);
                }
            }
        }

        if claimed.is_empty() {
            tx.rollback().await?;
            return Err(Error::ClaimConflict {
                dataset: dataset.to_string(),
                candidates: candidates.len(),
            });
        }

        if conflicts > 0 {
            info!(
                job_key,
                conflicts,
                claimed = claimed.len(),
                "Recovered from concurrent claims"
            );
        }

        claimed.sort_by_key(|r| r.runnumber);
        ProductionTxOps::record_claimed_count(&mut tx, job_key, claimed.len()).await?;
        tx.commit().await?;

        Ok((job_key, claimed))
    }

    fn build_descriptor(
        &self,
        job_key: i64,
        dataset: &str,
        output_dir: &Path,
        runs: &[RunCandidate],
    ) -> JobDescriptor {
        JobDescriptor {
            selected_runs: runs.iter().map(|r| r.runnumber).collect(),
            data_type: self.config.data_type,
            run_keys: runs.iter().map(|r| r.runkey).collect(),
            job_key,
            dataset: dataset.to_string(),
            output_dir: output_dir.to_path_buf(),
            response_files: runs.iter().map(|r| r.responsefile.clone()).collect(),
            db: self.store.location().to_path_buf(),
            odb: self.config.odb.clone(),
            update_file: update_file_path(output_dir, job_key),
        }
    }

    async fn write_descriptor(&self, descriptor: &JobDescriptor, path: &Path) -> Result<()> {
        ensure_dir_all(&descriptor.output_dir).await?;
        descriptor.write_to(path).await
    }

    /// Move a freshly submitted job out of `SUBMITTED`.
    async fn mark_job(&self, job_key: i64, to: JobStatus) -> Result<()> {
        let moved = retry_on_sqlite_busy("mark_job", || async {
            let mut tx = self.store.begin_immediate().await?;
            let moved =
                ProductionTxOps::transition_job(&mut tx, job_key, JobStatus::Submitted, to).await?;
            tx.commit().await?;
            Ok(moved)
        })
        .await?;

        if !moved {
            warn!(job_key, to = %to, "Job had already left SUBMITTED");
        }
        Ok(())
    }
}
