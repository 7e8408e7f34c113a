//! Service container for dependency injection.
//!
//! Every tracker command builds one container from a [`TrackerConfig`] and
//! talks to the store only through the services it holds.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::Result;
use crate::config::TrackerConfig;
use crate::database::Store;
use crate::database::models::{ProductionJobDbModel, ProductionRunDbModel, RunStatusCounts};
use crate::database::repositories::{
    DatasetRepository, JobRepository, RunRepository, SqlxDatasetRepository, SqlxJobRepository,
    SqlxRunRepository,
};
use crate::production::{
    CommandScheduler, CompletionCollector, DatasetRegistry, JobSubmitter, ReconciliationReport,
    RunSelector, Scheduler,
};

/// A job row together with the state of the runs it claimed.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job: ProductionJobDbModel,
    pub runs: RunStatusCounts,
    pub run_rows: Vec<ProductionRunDbModel>,
}

/// A job whose reconciliation pass failed.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileFailure {
    pub job_key: i64,
    pub error: String,
}

/// Result of reconciling every unfinished job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveReconciliation {
    pub reports: Vec<ReconciliationReport>,
    pub failures: Vec<ReconcileFailure>,
}

/// Service container holding all tracker services.
pub struct ServiceContainer {
    pub config: Arc<TrackerConfig>,
    pub store: Store,
    pub jobs: Arc<dyn JobRepository>,
    pub runs: Arc<dyn RunRepository>,
    pub registry: Arc<DatasetRegistry>,
    pub selector: Arc<RunSelector>,
    pub submitter: Arc<JobSubmitter>,
    pub collector: Arc<CompletionCollector>,
}

impl ServiceContainer {
    /// Open the store and wire services, submitting through the configured
    /// scheduler command.
    pub async fn new(config: TrackerConfig) -> Result<Self> {
        let scheduler = Arc::new(CommandScheduler::new(
            config.scheduler_binary.clone(),
            config.runner.clone(),
        ));
        Self::with_scheduler(config, scheduler).await
    }

    /// Open the store and wire services around a caller-supplied scheduler.
    pub async fn with_scheduler(
        config: TrackerConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Store::open(&config.store_location).await?;
        let config = Arc::new(config);

        let datasets: Arc<dyn DatasetRepository> = Arc::new(SqlxDatasetRepository::new(
            store.read_pool().clone(),
            store.write_pool().clone(),
        ));
        let runs: Arc<dyn RunRepository> = Arc::new(SqlxRunRepository::new(
            store.read_pool().clone(),
            store.write_pool().clone(),
        ));
        let jobs: Arc<dyn JobRepository> =
            Arc::new(SqlxJobRepository::new(store.read_pool().clone()));

        let registry = Arc::new(DatasetRegistry::new(datasets, runs.clone()));
        let selector = Arc::new(RunSelector::new(runs.clone()));
        let submitter = Arc::new(JobSubmitter::new(
            config.clone(),
            store.clone(),
            registry.clone(),
            selector.clone(),
            scheduler,
        ));
        let collector = Arc::new(CompletionCollector::new(store.clone(), jobs.clone()));

        info!(store = %store.location().display(), "Service container initialized");

        Ok(Self {
            config,
            store,
            jobs,
            runs,
            registry,
            selector,
            submitter,
            collector,
        })
    }

    pub async fn job_summary(&self, job_key: i64) -> Result<JobSummary> {
        let job = self.jobs.get_job(job_key).await?;
        let runs = self.jobs.run_counts(job_key).await?;
        let run_rows = self.runs.list_runs_for_job(job_key).await?;
        Ok(JobSummary {
            job,
            runs,
            run_rows,
        })
    }

    /// Most recent jobs first, optionally for one dataset.
    pub async fn list_jobs(
        &self,
        dataset: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ProductionJobDbModel>> {
        self.jobs.list_jobs(dataset, limit).await
    }

    /// Reconcile every job not yet in a terminal status. A job that fails is
    /// logged and recorded; the remaining jobs are still reconciled.
    pub async fn reconcile_active(&self) -> Result<ActiveReconciliation> {
        let keys: Vec<i64> = self
            .jobs
            .list_jobs(None, i64::MAX)
            .await?
            .into_iter()
            .filter(|j| j.job_status().is_none_or(|s| !s.is_terminal()))
            .map(|j| j.jobkey)
            .collect();

        let mut outcome = ActiveReconciliation::default();
        for job_key in keys {
            match self.collector.reconcile(job_key).await {
                Ok(report) => outcome.reports.push(report),
                Err(e) => {
                    error!(job_key, error = %e, "Reconciliation failed; continuing with other jobs");
                    outcome.failures.push(ReconcileFailure {
                        job_key,
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    pub async fn shutdown(&self) {
        self.store.close().await;
    }
}
