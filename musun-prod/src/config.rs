//! Tracker configuration.
//!
//! A [`TrackerConfig`] is built once by the entry point (TOML file, then
//! command-line / environment overrides) and handed to every component at
//! construction. Nothing in the crate reads process environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kind of data a dataset holds, forwarded to the analysis job as `DATATYPE`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Detector data.
    #[default]
    Run,
    /// Monte Carlo simulation.
    Mc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// SQLite database file shared by all tracker invocations.
    pub store_location: PathBuf,
    /// Root under which each dataset gets its output directory.
    pub output_area: PathBuf,
    /// Batch scheduler submission command (e.g. `qsub`).
    pub scheduler_binary: PathBuf,
    /// Script the scheduler runs; it receives the descriptor path.
    pub runner: PathBuf,
    /// ODB configuration name passed to the analysis.
    pub odb: String,
    pub data_type: DataType,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            store_location: PathBuf::from("MusunProductionDataBase.db"),
            output_area: PathBuf::from("."),
            scheduler_binary: PathBuf::from("qsub"),
            runner: PathBuf::from("runMuJob.sh"),
            odb: "masterRun6.odb".to_string(),
            data_type: DataType::Run,
        }
    }
}

impl TrackerConfig {
    /// Load configuration from a TOML file, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config file", path, e))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_location.as_os_str().is_empty() {
            return Err(Error::config("store_location must not be empty"));
        }
        if self.scheduler_binary.as_os_str().is_empty() {
            return Err(Error::config("scheduler_binary must not be empty"));
        }
        if self.runner.as_os_str().is_empty() {
            return Err(Error::config("runner must not be empty"));
        }
        if self.odb.trim().is_empty() {
            return Err(Error::config("odb must not be empty"));
        }
        Ok(())
    }

    /// Directory holding descriptors, update files and outputs for a dataset.
    pub fn dataset_output_dir(&self, dataset: &str) -> PathBuf {
        self.output_area.join(dataset)
    }
}
