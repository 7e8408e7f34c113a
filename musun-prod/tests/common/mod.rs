//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use musun_prod::production::{
    Scheduler, SchedulerAck, SchedulerError, SubmissionRequest, update_file_path,
};
use musun_prod::{ServiceContainer, TrackerConfig};

pub const PROXY_DATASET: &str = "ds_test_proxy";
pub const FIRST_PROXY_RUN: i64 = 69301;

/// Scheduler stand-in that records every request and accepts or rejects on
/// demand.
#[derive(Default)]
pub struct RecordingScheduler {
    requests: Mutex<Vec<SubmissionRequest>>,
    reject: AtomicBool,
    next_id: AtomicU64,
}

impl RecordingScheduler {
    pub fn rejecting() -> Self {
        let scheduler = Self::default();
        scheduler.reject.store(true, Ordering::SeqCst);
        scheduler
    }

    pub fn requests(&self) -> Vec<SubmissionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn submit(&self, request: &SubmissionRequest) -> Result<SchedulerAck, SchedulerError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.reject.load(Ordering::SeqCst) {
            return Err(SchedulerError::Rejected {
                binary: "qsub".to_string(),
                code: Some(1),
                stderr: "qsub: queue is disabled".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1000;
        Ok(SchedulerAck {
            output: format!("{id}.batch\n"),
        })
    }
}

pub fn test_config(root: &Path) -> TrackerConfig {
    TrackerConfig {
        store_location: root.join("MusunProductionDataBase.db"),
        output_area: root.join("output"),
        ..TrackerConfig::default()
    }
}

/// A tracker rooted in a temporary directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub scheduler: Arc<RecordingScheduler>,
    pub services: ServiceContainer,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_scheduler(RecordingScheduler::default()).await
    }

    pub async fn with_scheduler(scheduler: RecordingScheduler) -> Self {
        let dir = TempDir::new().unwrap();
        let scheduler = Arc::new(scheduler);
        let services = ServiceContainer::with_scheduler(test_config(dir.path()), scheduler.clone())
            .await
            .unwrap();
        Self {
            dir,
            scheduler,
            services,
        }
    }

    /// Another container on the same store, like a second tracker process.
    pub async fn second_process(&self) -> ServiceContainer {
        ServiceContainer::with_scheduler(test_config(self.dir.path()), self.scheduler.clone())
            .await
            .unwrap()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data").join(PROXY_DATASET)
    }

    /// Register `ds_test_proxy` with `runs` response files on disk and
    /// return the run numbers, lowest first.
    pub async fn seed_proxy_dataset(&self, runs: usize) -> Vec<i64> {
        let data_dir = self.data_dir();
        tokio::fs::create_dir_all(&data_dir).await.unwrap();

        let numbers: Vec<i64> = (0..runs as i64).map(|i| FIRST_PROXY_RUN + i).collect();
        for n in &numbers {
            tokio::fs::write(data_dir.join(format!("run{n}.mid")), b"MIDAS")
                .await
                .unwrap();
        }

        self.services
            .registry
            .register_dataset(PROXY_DATASET, &data_dir)
            .await
            .unwrap();
        let report = self
            .services
            .registry
            .discover_runs(PROXY_DATASET)
            .await
            .unwrap();
        assert_eq!(report.registered, runs as u64);
        numbers
    }

    pub fn update_file(&self, job_key: i64) -> PathBuf {
        let output_dir = self.services.config.dataset_output_dir(PROXY_DATASET);
        update_file_path(&output_dir, job_key)
    }

    /// Append raw bytes to a job's update file, as the running job would.
    pub async fn append_update(&self, job_key: i64, content: &str) {
        let path = self.update_file(job_key);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(content.as_bytes()).await.unwrap();
        file.flush().await.unwrap();
    }
}

impl TestEnv {
    /// Replace a job's update file wholesale, as a restarted job would.
    pub async fn replace_update(&self, job_key: i64, content: &str) {
        tokio::fs::write(self.update_file(job_key), content)
            .await
            .unwrap();
    }
}

pub fn success_lines(runs: &[i64]) -> String {
    runs.iter().map(|r| format!("{r} SUCCESS\n")).collect()
}
