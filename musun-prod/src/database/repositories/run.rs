//! Production run repository.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use sqlx::Row;

use crate::database::models::{NewRun, ProductionRunDbModel, RunCandidate, RunStatusCounts};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::{Error, Result};

/// Run repository trait.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Register runs as `UNCLAIMED`. Runs already known for the dataset are
    /// left untouched. Returns how many rows were inserted.
    async fn register_runs(&self, dataset: &str, runs: &[NewRun]) -> Result<u64>;

    /// Lazily stream the dataset's unclaimed runs in ascending run number.
    fn stream_unclaimed<'a>(&'a self, dataset: &'a str) -> BoxStream<'a, Result<RunCandidate>>;

    async fn list_runs(&self, dataset: &str) -> Result<Vec<ProductionRunDbModel>>;
    async fn list_runs_for_job(&self, job_key: i64) -> Result<Vec<ProductionRunDbModel>>;
    async fn count_by_status(&self, dataset: &str) -> Result<RunStatusCounts>;
}

/// SQLx implementation of RunRepository.
pub struct SqlxRunRepository {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqlxRunRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl RunRepository for SqlxRunRepository {
    async fn register_runs(&self, dataset: &str, runs: &[NewRun]) -> Result<u64> {
        retry_on_sqlite_busy("register_runs", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM datasets WHERE name = ?")
                .bind(dataset)
                .fetch_optional(&mut *tx)
                .await?;
            if known.is_none() {
                tx.rollback().await?;
                return Err(Error::UnknownDataset(dataset.to_string()));
            }

            let mut inserted = 0;
            for run in runs {
                let result = sqlx::query(
                    r#"
                    INSERT INTO ProductionRuns (dataset, runnumber, responsefile, jobkey, status)
                    VALUES (?, ?, ?, NULL, 'UNCLAIMED')
                    ON CONFLICT (dataset, runnumber) DO NOTHING
                    "#,
                )
                .bind(dataset)
                .bind(run.runnumber)
                .bind(&run.responsefile)
                .execute(&mut *tx)
                .await?;
                inserted += result.rows_affected();
            }

            tx.commit().await?;
            Ok(inserted)
        })
        .await
    }

    fn stream_unclaimed<'a>(&'a self, dataset: &'a str) -> BoxStream<'a, Result<RunCandidate>> {
        sqlx::query_as::<_, RunCandidate>(
            r#"
            SELECT runkey, runnumber, responsefile FROM ProductionRuns
            WHERE dataset = ? AND status = 'UNCLAIMED' AND jobkey IS NULL
            ORDER BY runnumber ASC
            "#,
        )
        .bind(dataset)
        .fetch(&self.pool)
        .map_err(Error::from)
        .boxed()
    }

    async fn list_runs(&self, dataset: &str) -> Result<Vec<ProductionRunDbModel>> {
        let runs = sqlx::query_as::<_, ProductionRunDbModel>(
            "SELECT * FROM ProductionRuns WHERE dataset = ? ORDER BY runnumber",
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    async fn list_runs_for_job(&self, job_key: i64) -> Result<Vec<ProductionRunDbModel>> {
        let runs = sqlx::query_as::<_, ProductionRunDbModel>(
            "SELECT * FROM ProductionRuns WHERE jobkey = ? ORDER BY runnumber",
        )
        .bind(job_key)
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }

    async fn count_by_status(&self, dataset: &str) -> Result<RunStatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM ProductionRuns WHERE dataset = ? GROUP BY status",
        )
        .bind(dataset)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = RunStatusCounts::default();
        for row in rows {
            counts.add(row.get::<&str, _>("status"), row.get::<i64, _>("n"));
        }
        Ok(counts)
    }
}
