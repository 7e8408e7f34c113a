//! Store access layer.
//!
//! SQLite through sqlx: a WAL read pool for queries plus a single-connection
//! write pool for `BEGIN IMMEDIATE` transactions, migrations, and the
//! repositories and transactional primitives built on top of them.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

const DEFAULT_READ_POOL_SIZE: u32 = 4;

/// Lock wait before SQLite reports busy. Other tracker processes may hold the
/// write lock while they claim runs.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

fn connect_options(path: &Path, busy_timeout: Duration) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(busy_timeout)
        .foreign_keys(true)
        .create_if_missing(true)
}

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        DEFAULT_WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn build_pool(
    path: &Path,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(
            path,
            Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        ))
        .await?;

    let mut conn = pool.acquire().await?;
    let mode: String = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?
        .get(0);
    if mode != "wal" {
        tracing::warn!(journal_mode = %mode, "journal mode is not WAL; re-setting");
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }

    Ok(pool)
}

/// Open the read pool for the database file at `path`.
pub async fn init_pool(path: &Path) -> Result<DbPool, sqlx::Error> {
    build_pool(path, DEFAULT_READ_POOL_SIZE, Duration::from_secs(30)).await
}

/// Open a write pool with a single connection.
///
/// Every multi-row mutation goes through this pool inside `BEGIN IMMEDIATE`,
/// so within one process only one connection ever competes for the SQLite
/// write lock. Other processes are handled by the busy timeout and
/// [`retry::retry_on_sqlite_busy`].
pub async fn init_write_pool(path: &Path) -> Result<WritePool, sqlx::Error> {
    build_pool(path, 1, Duration::from_secs(60)).await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    tracing::debug!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Handle on the production database: both pools and the file they point at.
#[derive(Debug, Clone)]
pub struct Store {
    location: PathBuf,
    read: DbPool,
    write: WritePool,
}

impl Store {
    /// Open (creating if needed) the database at `location` and migrate it.
    pub async fn open(location: impl AsRef<Path>) -> crate::Result<Self> {
        let location = location.as_ref().to_path_buf();
        let write = init_write_pool(&location).await?;
        run_migrations(&write).await?;
        let read = init_pool(&location).await?;

        tracing::info!(store = %location.display(), "Production store opened");

        Ok(Self {
            location,
            read,
            write,
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn read_pool(&self) -> &DbPool {
        &self.read
    }

    pub fn write_pool(&self) -> &WritePool {
        &self.write
    }

    pub async fn begin_immediate(&self) -> Result<ImmediateTransaction, sqlx::Error> {
        begin_immediate(&self.write).await
    }

    pub async fn close(&self) {
        self.read.close().await;
        self.write.close().await;
    }
}

pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction {
        conn,
        finished: false,
    })
}

/// A transaction opened with `BEGIN IMMEDIATE`.
///
/// The write lock is taken at `BEGIN`, so two claimers never both read a run
/// as unclaimed and then race to upgrade. Dropping without commit closes the
/// connection, which makes SQLite roll back.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_store_creates_tables() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("prod.db")).await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(store.read_pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        assert!(names.contains(&"datasets"));
        assert!(names.contains(&"ProductionJobs"));
        assert!(names.contains(&"ProductionRuns"));

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(store.read_pool())
            .await
            .unwrap();
        assert_eq!(mode.0, "wal");
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("prod.db")).await.unwrap();

        {
            let mut tx = store.begin_immediate().await.unwrap();
            sqlx::query("INSERT INTO datasets (name, path) VALUES ('ds', '/data/ds')")
                .execute(&mut *tx)
                .await
                .unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM datasets")
            .fetch_one(store.read_pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prod.db");
        let store = Store::open(&path).await.unwrap();
        store.close().await;

        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.location(), path.as_path());
    }
}
