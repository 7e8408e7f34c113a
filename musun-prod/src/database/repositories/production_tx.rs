//! Transactional primitives for job submission and reconciliation.
//!
//! These methods run inside a transaction owned by the caller (normally an
//! [`ImmediateTransaction`](crate::database::ImmediateTransaction)) and never
//! commit. Every state change is a conditional update on the row's prior
//! state, so a lost race or a replayed record affects zero rows instead of
//! overwriting someone else's write.

use sqlx::{Row, SqliteConnection};

use crate::Result;
use crate::database::models::{
    JobStatus, NewJob, ProductionJobDbModel, RunCandidate, RunStatus, RunStatusCounts,
};

pub struct ProductionTxOps;

impl ProductionTxOps {
    /// Insert a `SUBMITTED` job row and return its store-assigned key.
    pub async fn insert_job(tx: &mut SqliteConnection, job: &NewJob) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO ProductionJobs (dataset, submittime, outputdir, odb, status, claimed_runs, update_offset)
            VALUES (?, ?, ?, ?, 'SUBMITTED', 0, 0)
            "#,
        )
        .bind(&job.dataset)
        .bind(job.submittime)
        .bind(&job.outputdir)
        .bind(&job.odb)
        .execute(tx)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_job(
        tx: &mut SqliteConnection,
        job_key: i64,
    ) -> Result<Option<ProductionJobDbModel>> {
        let job = sqlx::query_as::<_, ProductionJobDbModel>(
            "SELECT * FROM ProductionJobs WHERE jobkey = ?",
        )
        .bind(job_key)
        .fetch_optional(tx)
        .await?;
        Ok(job)
    }

    /// Unclaimed runs as seen from inside the transaction.
    pub async fn select_unclaimed(
        tx: &mut SqliteConnection,
        dataset: &str,
        limit: usize,
    ) -> Result<Vec<RunCandidate>> {
        let runs = sqlx::query_as::<_, RunCandidate>(
            r#"
            SELECT runkey, runnumber, responsefile FROM ProductionRuns
            WHERE dataset = ? AND status = 'UNCLAIMED' AND jobkey IS NULL
            ORDER BY runnumber ASC
            LIMIT ?
            "#,
        )
        .bind(dataset)
        .bind(limit as i64)
        .fetch_all(tx)
        .await?;
        Ok(runs)
    }

    /// Claim one run for a job. Returns `false` if the run is no longer
    /// unclaimed.
    pub async fn claim_run(tx: &mut SqliteConnection, run_key: i64, job_key: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ProductionRuns SET jobkey = ?, status = 'CLAIMED'
            WHERE runkey = ? AND status = 'UNCLAIMED' AND jobkey IS NULL
            "#,
        )
        .bind(job_key)
        .bind(run_key)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn record_claimed_count(
        tx: &mut SqliteConnection,
        job_key: i64,
        claimed: usize,
    ) -> Result<()> {
        sqlx::query("UPDATE ProductionJobs SET claimed_runs = ? WHERE jobkey = ?")
            .bind(claimed as i64)
            .bind(job_key)
            .execute(tx)
            .await?;
        Ok(())
    }

    /// Move a job from `from` to `to`. Returns `false` when the job is not in
    /// `from` (already moved on, or never there).
    pub async fn transition_job(
        tx: &mut SqliteConnection,
        job_key: i64,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE ProductionJobs SET status = ? WHERE jobkey = ? AND status = ?")
                .bind(to.as_str())
                .bind(job_key)
                .bind(from.as_str())
                .execute(tx)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the outcome of one run. Only a run still `CLAIMED` by this job
    /// changes; anything else (already final, other job, unknown run) is a
    /// no-op and returns `false`.
    pub async fn apply_run_outcome(
        tx: &mut SqliteConnection,
        job_key: i64,
        run_number: i64,
        outcome: RunStatus,
    ) -> Result<bool> {
        debug_assert!(outcome.is_terminal());
        let result = sqlx::query(
            r#"
            UPDATE ProductionRuns SET status = ?
            WHERE jobkey = ? AND runnumber = ? AND status = 'CLAIMED'
            "#,
        )
        .bind(outcome.as_str())
        .bind(job_key)
        .bind(run_number)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Whether `run_number` belongs to `job_key` at all.
    pub async fn job_owns_run(
        tx: &mut SqliteConnection,
        job_key: i64,
        run_number: i64,
    ) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM ProductionRuns WHERE jobkey = ? AND runnumber = ?")
                .bind(job_key)
                .bind(run_number)
                .fetch_optional(tx)
                .await?;
        Ok(found.is_some())
    }

    /// Advance the consumed byte offset of the job's update file. Never moves
    /// backwards, so a slower concurrent reconciler cannot rewind it.
    pub async fn advance_update_offset(
        tx: &mut SqliteConnection,
        job_key: i64,
        offset: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE ProductionJobs SET update_offset = MAX(update_offset, ?) WHERE jobkey = ?",
        )
        .bind(offset as i64)
        .bind(job_key)
        .execute(tx)
        .await?;
        Ok(())
    }

    /// Move the consumed offset back after the update file was replaced.
    /// Only applies while the stored offset is still `expected`, so of several
    /// reconcilers that saw the same replacement only one rewinds it.
    pub async fn rewind_update_offset(
        tx: &mut SqliteConnection,
        job_key: i64,
        expected: u64,
        offset: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE ProductionJobs SET update_offset = ? WHERE jobkey = ? AND update_offset = ?",
        )
        .bind(offset as i64)
        .bind(job_key)
        .bind(expected as i64)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn run_counts(tx: &mut SqliteConnection, job_key: i64) -> Result<RunStatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM ProductionRuns WHERE jobkey = ? GROUP BY status",
        )
        .bind(job_key)
        .fetch_all(tx)
        .await?;

        let mut counts = RunStatusCounts::default();
        for row in rows {
            counts.add(row.get::<&str, _>("status"), row.get::<i64, _>("n"));
        }
        Ok(counts)
    }

    /// Write the job's terminal status. Returns `false` if the job was already
    /// terminal, so the write happens at most once.
    pub async fn finalize_job(
        tx: &mut SqliteConnection,
        job_key: i64,
        status: JobStatus,
        completed_at_ms: i64,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            r#"
            UPDATE ProductionJobs SET status = ?, completetime = ?
            WHERE jobkey = ? AND status NOT IN ('COMPLETED', 'FAILED')
            "#,
        )
        .bind(status.as_str())
        .bind(completed_at_ms)
        .bind(job_key)
        .execute(tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
