//! Production job repository.

use async_trait::async_trait;
use sqlx::Row;

use crate::database::DbPool;
use crate::database::models::{ProductionJobDbModel, RunStatusCounts};
use crate::{Error, Result};

const JOB_COLUMNS: &str =
    "jobkey, dataset, submittime, outputdir, odb, status, claimed_runs, update_offset, completetime";

/// Job repository trait (read side).
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, job_key: i64) -> Result<ProductionJobDbModel>;
    /// Newest first, optionally restricted to one dataset.
    async fn list_jobs(
        &self,
        dataset: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ProductionJobDbModel>>;
    async fn run_counts(&self, job_key: i64) -> Result<RunStatusCounts>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: DbPool,
}

impl SqlxJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, job_key: i64) -> Result<ProductionJobDbModel> {
        sqlx::query_as::<_, ProductionJobDbModel>(&format!(
            "SELECT {JOB_COLUMNS} FROM ProductionJobs WHERE jobkey = ?"
        ))
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("ProductionJob", job_key))
    }

    async fn list_jobs(
        &self,
        dataset: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ProductionJobDbModel>> {
        let jobs = match dataset {
            Some(dataset) => {
                sqlx::query_as::<_, ProductionJobDbModel>(&format!(
                    "SELECT {JOB_COLUMNS} FROM ProductionJobs WHERE dataset = ? ORDER BY jobkey DESC LIMIT ?"
                ))
                .bind(dataset)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ProductionJobDbModel>(&format!(
                    "SELECT {JOB_COLUMNS} FROM ProductionJobs ORDER BY jobkey DESC LIMIT ?"
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(jobs)
    }

    async fn run_counts(&self, job_key: i64) -> Result<RunStatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM ProductionRuns WHERE jobkey = ? GROUP BY status",
        )
        .bind(job_key)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = RunStatusCounts::default();
        for row in rows {
            counts.add(row.get::<&str, _>("status"), row.get::<i64, _>("n"));
        }
        Ok(counts)
    }
}
