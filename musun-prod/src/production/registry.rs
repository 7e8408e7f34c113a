//! Dataset registry and run catalogue.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info};

use crate::database::models::{DatasetDbModel, NewRun, Registration};
use crate::database::repositories::{DatasetRepository, RunRepository};
use crate::{Error, Result};

/// MIDAS response files are named `run<number>.mid`.
static RESPONSE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^run(\d+)\.mid$").expect("static regex is valid"));

/// Outcome of scanning a dataset directory for response files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub found: usize,
    pub registered: u64,
}

pub struct DatasetRegistry {
    datasets: Arc<dyn DatasetRepository>,
    runs: Arc<dyn RunRepository>,
}

impl DatasetRegistry {
    pub fn new(datasets: Arc<dyn DatasetRepository>, runs: Arc<dyn RunRepository>) -> Self {
        Self { datasets, runs }
    }

    /// Register `name` at `path`. Registering the same pair again is a no-op;
    /// the same name at a different path is a configuration error.
    pub async fn register_dataset(&self, name: &str, path: &Path) -> Result<Registration> {
        validate_name(name)?;
        let path = path
            .to_str()
            .ok_or_else(|| Error::config(format!("dataset path {} is not UTF-8", path.display())))?;
        validate_list_path("dataset path", path)?;

        let outcome = self
            .datasets
            .register_dataset(&DatasetDbModel::new(name, path))
            .await?;

        match outcome {
            Registration::Created => info!(dataset = name, path, "Dataset registered"),
            Registration::Unchanged => debug!(dataset = name, "Dataset already registered"),
        }
        Ok(outcome)
    }

    pub async fn resolve_dataset(&self, name: &str) -> Result<PathBuf> {
        self.datasets
            .get_dataset(name)
            .await?
            .map(|d| PathBuf::from(d.path))
            .ok_or_else(|| Error::not_found("Dataset", name))
    }

    pub async fn list_datasets(&self) -> Result<Vec<DatasetDbModel>> {
        self.datasets.list_datasets().await
    }

    /// Make runs known to the tracker as unclaimed. Existing runs are kept.
    ///
    /// Response files are handed to the job as a space-separated list, so a
    /// path containing whitespace is rejected before anything is written.
    pub async fn register_runs(&self, dataset: &str, runs: &[NewRun]) -> Result<u64> {
        for run in runs {
            validate_list_path("response file", &run.responsefile)?;
        }
        let inserted = self.runs.register_runs(dataset, runs).await?;
        info!(dataset, offered = runs.len(), inserted, "Runs registered");
        Ok(inserted)
    }

    /// Scan the dataset directory for `run<number>.mid` files and register
    /// every one not yet known.
    pub async fn discover_runs(&self, dataset: &str) -> Result<DiscoveryReport> {
        let root = self.resolve_dataset(dataset).await?;
        let mut found = scan_response_files(&root).await?;
        found.sort_by_key(|r| r.runnumber);

        let registered = if found.is_empty() {
            0
        } else {
            self.register_runs(dataset, &found).await?
        };

        Ok(DiscoveryReport {
            found: found.len(),
            registered,
        })
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("dataset name must not be empty"));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') {
        return Err(Error::config(format!(
            "dataset name {name:?} must not contain whitespace or path separators"
        )));
    }
    Ok(())
}

fn validate_list_path(kind: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::config(format!("{kind} must not be empty")));
    }
    if path.chars().any(char::is_whitespace) {
        return Err(Error::config(format!(
            "{kind} {path:?} contains whitespace and cannot be passed to the job"
        )));
    }
    Ok(())
}

async fn scan_response_files(root: &Path) -> Result<Vec<NewRun>> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| Error::io_path("listing dataset directory", root, e))?;

    let mut runs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::io_path("listing dataset directory", root, e))?
    {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(caps) = RESPONSE_FILE_RE.captures(name) else {
            continue;
        };
        let Ok(runnumber) = caps[1].parse::<i64>() else {
            continue;
        };
        runs.push(NewRun::new(
            runnumber,
            entry.path().to_string_lossy().into_owned(),
        ));
    }
    Ok(runs)
}
