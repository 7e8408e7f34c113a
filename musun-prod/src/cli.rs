//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use musun_prod::{DataType, TrackerConfig};

#[derive(Parser, Debug)]
#[command(name = "musun-prod")]
#[command(author, version, about = "MuSun production job tracker", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "MUSUN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Production database file
    #[arg(long = "db", global = true, env = "MUSUN_DATABASE")]
    pub store_location: Option<PathBuf>,

    /// Root of the per-dataset output directories
    #[arg(long, global = true, env = "MUSUN_OUTPUTAREA")]
    pub output_area: Option<PathBuf>,

    /// Batch scheduler submission command
    #[arg(long, global = true, env = "MUSUN_SCHEDULER")]
    pub scheduler: Option<PathBuf>,

    /// Job script handed to the scheduler
    #[arg(long, global = true, env = "MUSUN_RUNNER")]
    pub runner: Option<PathBuf>,

    /// ODB configuration passed to the analysis
    #[arg(long, global = true, env = "MUSUN_ODB")]
    pub odb: Option<String>,

    /// Data type of the dataset (run or mc)
    #[arg(long, global = true, env = "MUSUN_DATATYPE")]
    pub data_type: Option<DataType>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, global = true, env = "MUSUN_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage datasets
    Dataset {
        #[command(subcommand)]
        action: DatasetCommand,
    },

    /// Manage the run catalogue of a dataset
    Runs {
        #[command(subcommand)]
        action: RunsCommand,
    },

    /// Claim unclaimed runs and submit one job for them
    Submit {
        /// Dataset to draw runs from
        #[arg(short, long)]
        dataset: String,

        /// Number of runs to process in the job
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Apply a job's reported run outcomes
    Reconcile {
        /// Job key
        #[arg(long = "job", required_unless_present = "active", conflicts_with = "active")]
        job_key: Option<i64>,

        /// Reconcile every job that is not yet finished
        #[arg(long)]
        active: bool,
    },

    /// Show a job, or list recent jobs
    Status {
        /// Job key
        #[arg(long = "job")]
        job_key: Option<i64>,

        /// Restrict the listing to one dataset
        #[arg(short, long, conflicts_with = "job_key")]
        dataset: Option<String>,

        /// Maximum number of jobs to list
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum DatasetCommand {
    /// Register a dataset name and its directory
    Register { name: String, path: PathBuf },

    /// Show a dataset and its run counts
    Show { name: String },

    /// List registered datasets
    List,
}

#[derive(Subcommand, Debug)]
pub enum RunsCommand {
    /// Register every run<number>.mid file in the dataset directory
    Discover { dataset: String },

    /// Register runs given as <run>:<response file>
    Add {
        dataset: String,
        #[arg(required = true, value_parser = parse_run_entry)]
        runs: Vec<(i64, String)>,
    },

    /// List the runs of a dataset
    List { dataset: String },
}

fn parse_run_entry(raw: &str) -> Result<(i64, String), String> {
    let (run, file) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected <run>:<response file>, got {raw:?}"))?;
    let run = run
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("bad run number {run:?}: {e}"))?;
    if file.is_empty() {
        return Err(format!("missing response file in {raw:?}"));
    }
    Ok((run, file.to_string()))
}

impl Cli {
    /// Configuration file values with command-line and environment overrides
    /// applied on top.
    pub fn tracker_config(&self) -> musun_prod::Result<TrackerConfig> {
        let mut config = TrackerConfig::load(self.config.as_deref())?;

        if let Some(path) = &self.store_location {
            config.store_location = path.clone();
        }
        if let Some(path) = &self.output_area {
            config.output_area = path.clone();
        }
        if let Some(binary) = &self.scheduler {
            config.scheduler_binary = binary.clone();
        }
        if let Some(runner) = &self.runner {
            config.runner = runner.clone();
        }
        if let Some(odb) = &self.odb {
            config.odb = odb.clone();
        }
        if let Some(data_type) = self.data_type {
            config.data_type = data_type;
        }

        config.validate()?;
        Ok(config)
    }
}
