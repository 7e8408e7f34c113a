//! Job environment descriptor (`ENVVARS_<jobkey>`).
//!
//! The scheduled runner sources this file, so it is written as shell
//! assignments: one `KEY="value"` per line, list values space separated.
//! Inside the quotes `\`, `"`, `$` and `` ` `` are backslash-escaped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::DataType;
use crate::utils::fs::atomic_write;
use crate::{Error, Result};

const SELECTED_RUNS: &str = "SELECTEDRUNS";
const DATA_TYPE: &str = "DATATYPE";
const RUN_KEY_LIST: &str = "RUNKEYLIST";
const JOB_KEY: &str = "JOBKEY";
const DATASET: &str = "DATASET";
const OUTPUT_DIR: &str = "OUTPUTDIR";
const RESPONSE_FILES: &str = "RESPONSEFILES";
const DB: &str = "DB";
const ODB: &str = "ODB";
const DB_UPDATE_FILE: &str = "DBUPDATEFILE";

/// Descriptor file for a job inside its output directory.
pub fn descriptor_path(output_dir: &Path, job_key: i64) -> PathBuf {
    output_dir.join(format!("ENVVARS_{job_key}"))
}

/// Completion file the runner appends to.
pub fn update_file_path(output_dir: &Path, job_key: i64) -> PathBuf {
    output_dir.join(format!("DBUpdateFile_{job_key}"))
}

/// Everything the analysis job needs to know about its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub selected_runs: Vec<i64>,
    pub data_type: DataType,
    pub run_keys: Vec<i64>,
    pub job_key: i64,
    pub dataset: String,
    pub output_dir: PathBuf,
    pub response_files: Vec<String>,
    pub db: PathBuf,
    pub odb: String,
    pub update_file: PathBuf,
}

impl JobDescriptor {
    pub fn render(&self) -> String {
        let fields = [
            (SELECTED_RUNS, join(&self.selected_runs)),
            (DATA_TYPE, self.data_type.to_string()),
            (RUN_KEY_LIST, join(&self.run_keys)),
            (JOB_KEY, self.job_key.to_string()),
            (DATASET, self.dataset.clone()),
            (OUTPUT_DIR, self.output_dir.display().to_string()),
            (RESPONSE_FILES, self.response_files.join(" ")),
            (DB, self.db.display().to_string()),
            (ODB, self.odb.clone()),
            (DB_UPDATE_FILE, self.update_file.display().to_string()),
        ];

        let mut out = String::new();
        for (key, value) in fields {
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(&value));
            out.push_str("\"\n");
        }
        out
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut values: HashMap<&str, String> = HashMap::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::malformed(format!("descriptor line {}: missing '='", idx + 1))
            })?;
            let value = match value.strip_prefix('"') {
                Some(rest) => {
                    let inner = rest.strip_suffix('"').ok_or_else(|| {
                        Error::malformed(format!("descriptor line {}: unterminated quote", idx + 1))
                    })?;
                    unescape(inner)
                }
                None => value.to_string(),
            };
            values.insert(key.trim(), value);
        }

        let mut take = |key: &str| {
            values
                .remove(key)
                .ok_or_else(|| Error::malformed(format!("descriptor is missing {key}")))
        };

        let selected_runs = parse_list(SELECTED_RUNS, &take(SELECTED_RUNS)?)?;
        let data_type = take(DATA_TYPE)?
            .parse::<DataType>()
            .map_err(|e| Error::malformed(format!("{DATA_TYPE}: {e}")))?;
        let run_keys = parse_list(RUN_KEY_LIST, &take(RUN_KEY_LIST)?)?;
        let job_key = take(JOB_KEY)?
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::malformed(format!("{JOB_KEY}: {e}")))?;
        let dataset = take(DATASET)?;
        let output_dir = PathBuf::from(take(OUTPUT_DIR)?);
        let response_files = take(RESPONSE_FILES)?
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let db = PathBuf::from(take(DB)?);
        let odb = take(ODB)?;
        let update_file = PathBuf::from(take(DB_UPDATE_FILE)?);

        Ok(Self {
            selected_runs,
            data_type,
            run_keys,
            job_key,
            dataset,
            output_dir,
            response_files,
            db,
            odb,
            update_file,
        })
    }

    /// Persist the descriptor at `path`.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        atomic_write(path, self.render().as_bytes()).await
    }
}

fn join(values: &[i64]) -> String {
    values
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_list(key: &str, raw: &str) -> Result<Vec<i64>> {
    raw.split_whitespace()
        .map(|v| {
            v.parse::<i64>()
                .map_err(|e| Error::malformed(format!("{key}: {v:?}: {e}")))
        })
        .collect()
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
