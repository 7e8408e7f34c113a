//! Dataset repository.

use async_trait::async_trait;

use crate::database::models::{DatasetDbModel, Registration};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::{Error, Result};

/// Dataset repository trait.
#[async_trait]
pub trait DatasetRepository: Send + Sync {
    async fn get_dataset(&self, name: &str) -> Result<Option<DatasetDbModel>>;
    async fn list_datasets(&self) -> Result<Vec<DatasetDbModel>>;
    /// Insert the dataset unless it exists. An existing row with a different
    /// path is a configuration error and is left untouched.
    async fn register_dataset(&self, dataset: &DatasetDbModel) -> Result<Registration>;
}

/// SQLx implementation of DatasetRepository.
pub struct SqlxDatasetRepository {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqlxDatasetRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl DatasetRepository for SqlxDatasetRepository {
    async fn get_dataset(&self, name: &str) -> Result<Option<DatasetDbModel>> {
        let dataset =
            sqlx::query_as::<_, DatasetDbModel>("SELECT name, path FROM datasets WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(dataset)
    }

    async fn list_datasets(&self) -> Result<Vec<DatasetDbModel>> {
        let datasets =
            sqlx::query_as::<_, DatasetDbModel>("SELECT name, path FROM datasets ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        Ok(datasets)
    }

    async fn register_dataset(&self, dataset: &DatasetDbModel) -> Result<Registration> {
        retry_on_sqlite_busy("register_dataset", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;

            let existing: Option<String> =
                sqlx::query_scalar("SELECT path FROM datasets WHERE name = ?")
                    .bind(&dataset.name)
                    .fetch_optional(&mut *tx)
                    .await?;

            match existing {
                Some(path) if path == dataset.path => {
                    tx.commit().await?;
                    Ok(Registration::Unchanged)
                }
                Some(path) => {
                    tx.rollback().await?;
                    Err(Error::config(format!(
                        "dataset {} is already registered at {}, refusing to re-register at {}",
                        dataset.name, path, dataset.path
                    )))
                }
                None => {
                    sqlx::query("INSERT INTO datasets (name, path) VALUES (?, ?)")
                        .bind(&dataset.name)
                        .bind(&dataset.path)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(Registration::Created)
                }
            }
        })
        .await
    }
}
