//! Submission against a file-backed store and a recording scheduler.

mod common;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use common::{PROXY_DATASET, RecordingScheduler, TestEnv};
use musun_prod::database::models::{
    JobStatus, NewRun, ProductionRunDbModel, Registration, RunCandidate, RunStatus,
    RunStatusCounts,
};
use musun_prod::database::repositories::RunRepository;
use musun_prod::production::{JobDescriptor, JobSubmitter, RunSelector};
use musun_prod::{Error, Result};
use musun_prod::{DataType, production::descriptor_path};

#[tokio::test]
async fn test_proxy_dataset_submission() {
    let env = TestEnv::new().await;
    let runs = env.seed_proxy_dataset(12).await;

    let submission = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 12)
        .await
        .unwrap();

    assert!(!submission.is_partial());
    let claimed: Vec<i64> = submission.claimed_runs.iter().map(|r| r.runnumber).collect();
    assert_eq!(claimed, runs);

    let job = env.services.jobs.get_job(submission.job_key).await.unwrap();
    assert_eq!(job.job_status(), Some(JobStatus::Running));
    assert_eq!(job.claimed_runs, 12);
    assert_eq!(job.dataset, PROXY_DATASET);
    assert!(job.completetime.is_none());

    let counts = env.services.jobs.run_counts(submission.job_key).await.unwrap();
    assert_eq!(counts.claimed, 12);
    assert_eq!(counts.total(), 12);

    let requests = env.scheduler.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].job_key, submission.job_key);
    assert_eq!(requests[0].descriptor, submission.descriptor);
    assert!(submission.scheduler_output.contains(".batch"));
}

#[tokio::test]
async fn test_descriptor_describes_the_claimed_batch() {
    let env = TestEnv::new().await;
    let runs = env.seed_proxy_dataset(12).await;

    let submission = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 4)
        .await
        .unwrap();

    let output_dir = env.services.config.dataset_output_dir(PROXY_DATASET);
    assert_eq!(
        submission.descriptor,
        descriptor_path(&output_dir, submission.job_key)
    );

    let raw = tokio::fs::read_to_string(&submission.descriptor).await.unwrap();
    let descriptor = JobDescriptor::parse(&raw).unwrap();

    assert_eq!(descriptor.job_key, submission.job_key);
    assert_eq!(descriptor.dataset, PROXY_DATASET);
    assert_eq!(descriptor.selected_runs, runs[..4].to_vec());
    assert_eq!(
        descriptor.run_keys,
        submission
            .claimed_runs
            .iter()
            .map(|r| r.runkey)
            .collect::<Vec<_>>()
    );
    assert_eq!(descriptor.response_files.len(), 4);
    assert!(descriptor.response_files[0].ends_with(&format!("run{}.mid", runs[0])));
    assert_eq!(descriptor.data_type, DataType::Run);
    assert_eq!(descriptor.odb, "masterRun6.odb");
    assert_eq!(descriptor.output_dir, output_dir);
    assert_eq!(descriptor.update_file, env.update_file(submission.job_key));
    assert_eq!(descriptor.db, env.services.store.location());
}

#[tokio::test]
async fn test_selection_takes_lowest_run_numbers_first() {
    let env = TestEnv::new().await;
    let runs = env.seed_proxy_dataset(12).await;

    let first = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 5)
        .await
        .unwrap();
    let second = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 5)
        .await
        .unwrap();

    let numbers = |s: &musun_prod::production::JobSubmission| -> Vec<i64> {
        s.claimed_runs.iter().map(|r| r.runnumber).collect()
    };
    assert_eq!(numbers(&first), runs[..5].to_vec());
    assert_eq!(numbers(&second), runs[5..10].to_vec());
    assert!(second.job_key > first.job_key);

    let remaining = env
        .services
        .selector
        .select_runs(PROXY_DATASET, 100)
        .await
        .unwrap();
    assert_eq!(
        remaining.iter().map(|r| r.runnumber).collect::<Vec<_>>(),
        runs[10..].to_vec()
    );
}

#[tokio::test]
async fn test_partial_submission_when_dataset_runs_short() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(3).await;

    let submission = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 10)
        .await
        .unwrap();

    assert!(submission.is_partial());
    assert_eq!(submission.requested, 10);
    assert_eq!(submission.claimed_runs.len(), 3);

    let job = env.services.jobs.get_job(submission.job_key).await.unwrap();
    assert_eq!(job.claimed_runs, 3);
}

#[tokio::test]
async fn test_exhausted_dataset_creates_no_job() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(2).await;

    env.services
        .submitter
        .submit_job(PROXY_DATASET, 2)
        .await
        .unwrap();
    let err = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 1)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NoUnclaimedRuns { ref dataset } if dataset == PROXY_DATASET));
    let jobs = env.services.list_jobs(None, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(env.scheduler.requests().len(), 1);
}

#[tokio::test]
async fn test_unknown_dataset_is_rejected() {
    let env = TestEnv::new().await;

    let err = env
        .services
        .submitter
        .submit_job("ds_missing", 1)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::UnknownDataset(ref name) if name == "ds_missing"));
    assert!(env.scheduler.requests().is_empty());
}

#[tokio::test]
async fn test_zero_count_is_a_configuration_error() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(1).await;

    let err = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn test_scheduler_rejection_fails_job_and_keeps_claims() {
    let env = TestEnv::with_scheduler(RecordingScheduler::rejecting()).await;
    env.seed_proxy_dataset(4).await;

    let err = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 4)
        .await
        .unwrap_err();

    let (job_key, reason) = match err {
        Error::SubmissionFailed { job_key, reason } => (job_key, reason),
        other => panic!("expected SubmissionFailed, got {other:?}"),
    };
    assert!(reason.contains("queue is disabled"));

    let job = env.services.jobs.get_job(job_key).await.unwrap();
    assert_eq!(job.job_status(), Some(JobStatus::Failed));

    let runs = env.services.runs.list_runs_for_job(job_key).await.unwrap();
    assert_eq!(runs.len(), 4);
    assert!(
        runs.iter()
            .all(|r| r.run_status() == Some(RunStatus::Claimed) && r.jobkey == Some(job_key))
    );

    let unclaimed = env
        .services
        .selector
        .select_runs(PROXY_DATASET, 10)
        .await
        .unwrap();
    assert!(unclaimed.is_empty());
}

#[tokio::test]
async fn test_dataset_reregistration() {
    let env = TestEnv::new().await;
    let data_dir = env.data_dir();
    tokio::fs::create_dir_all(&data_dir).await.unwrap();

    let registry = &env.services.registry;
    assert_eq!(
        registry
            .register_dataset(PROXY_DATASET, &data_dir)
            .await
            .unwrap(),
        Registration::Created
    );
    assert_eq!(
        registry
            .register_dataset(PROXY_DATASET, &data_dir)
            .await
            .unwrap(),
        Registration::Unchanged
    );

    let err = registry
        .register_dataset(PROXY_DATASET, Path::new("/elsewhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert_eq!(
        registry.resolve_dataset(PROXY_DATASET).await.unwrap(),
        data_dir
    );
}

#[tokio::test]
async fn test_rediscovery_keeps_existing_runs() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(3).await;

    let submission = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 1)
        .await
        .unwrap();

    tokio::fs::write(env.data_dir().join("run69999.mid"), b"MIDAS")
        .await
        .unwrap();
    let report = env
        .services
        .registry
        .discover_runs(PROXY_DATASET)
        .await
        .unwrap();
    assert_eq!(report.found, 4);
    assert_eq!(report.registered, 1);

    let counts = env
        .services
        .runs
        .count_by_status(PROXY_DATASET)
        .await
        .unwrap();
    assert_eq!(counts.claimed, 1);
    assert_eq!(counts.unclaimed, 3);

    let runs = env
        .services
        .runs
        .list_runs_for_job(submission.job_key)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_scheduler_receives_runner_and_descriptor() {
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    use musun_prod::ServiceContainer;
    use musun_prod::production::CommandScheduler;

    let env = TestEnv::new().await;
    env.seed_proxy_dataset(2).await;

    let script = env.dir.path().join("fake-qsub.sh");
    let log = env.dir.path().join("qsub.log");
    tokio::fs::write(
        &script,
        format!(
            "#!/bin/sh\necho \"$1 $2\" >> \"{}\"\necho 4242.fake\n",
            log.display()
        ),
    )
    .await
    .unwrap();
    tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .await
        .unwrap();

    let mut config = common::test_config(env.dir.path());
    config.scheduler_binary = script.clone();
    let services = ServiceContainer::with_scheduler(
        config.clone(),
        Arc::new(CommandScheduler::new(&config.scheduler_binary, &config.runner)),
    )
    .await
    .unwrap();

    let submission = services
        .submitter
        .submit_job(PROXY_DATASET, 2)
        .await
        .unwrap();

    assert_eq!(submission.scheduler_output.trim(), "4242.fake");
    let logged = tokio::fs::read_to_string(&log).await.unwrap();
    assert_eq!(
        logged.trim(),
        format!("runMuJob.sh {}", submission.descriptor.display())
    );
}

/// Run repository whose unclaimed-run stream always yields the same snapshot,
/// as a selection made just before another submitter committed would.
struct StaleRunRepository {
    inner: Arc<dyn RunRepository>,
    snapshot: Vec<RunCandidate>,
}

#[async_trait]
impl RunRepository for StaleRunRepository {
    async fn register_runs(&self, dataset: &str, runs: &[NewRun]) -> Result<u64> {
        self.inner.register_runs(dataset, runs).await
    }

    fn stream_unclaimed<'a>(&'a self, _dataset: &'a str) -> BoxStream<'a, Result<RunCandidate>> {
        stream::iter(self.snapshot.clone().into_iter().map(Ok)).boxed()
    }

    async fn list_runs(&self, dataset: &str) -> Result<Vec<ProductionRunDbModel>> {
        self.inner.list_runs(dataset).await
    }

    async fn list_runs_for_job(&self, job_key: i64) -> Result<Vec<ProductionRunDbModel>> {
        self.inner.list_runs_for_job(job_key).await
    }

    async fn count_by_status(&self, dataset: &str) -> Result<RunStatusCounts> {
        self.inner.count_by_status(dataset).await
    }
}

fn stale_submitter(env: &TestEnv, snapshot: Vec<RunCandidate>) -> JobSubmitter {
    let runs = Arc::new(StaleRunRepository {
        inner: env.services.runs.clone(),
        snapshot,
    });
    JobSubmitter::new(
        env.services.config.clone(),
        env.services.store.clone(),
        env.services.registry.clone(),
        Arc::new(RunSelector::new(runs)),
        env.scheduler.clone(),
    )
}

#[tokio::test]
async fn test_stale_candidates_are_skipped_and_refilled() {
    let env = TestEnv::new().await;
    let runs = env.seed_proxy_dataset(6).await;
    let snapshot = env
        .services
        .selector
        .select_runs(PROXY_DATASET, 4)
        .await
        .unwrap();
    let stale = stale_submitter(&env, snapshot);

    let first = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 2)
        .await
        .unwrap();
    let first_runs: Vec<i64> = first.claimed_runs.iter().map(|r| r.runnumber).collect();
    assert_eq!(first_runs, &runs[..2]);

    // Two of the four snapshot runs are gone; the batch is refilled.
    let second = stale.submit_job(PROXY_DATASET, 4).await.unwrap();
    assert!(!second.is_partial());
    let second_runs: Vec<i64> = second.claimed_runs.iter().map(|r| r.runnumber).collect();
    assert_eq!(second_runs, &runs[2..]);

    let job = env.services.jobs.get_job(second.job_key).await.unwrap();
    assert_eq!(job.claimed_runs, 4);
    let counts = env.services.jobs.run_counts(second.job_key).await.unwrap();
    assert_eq!(counts.claimed, 4);

    let raw = tokio::fs::read_to_string(&second.descriptor).await.unwrap();
    let descriptor = JobDescriptor::parse(&raw).unwrap();
    assert_eq!(descriptor.selected_runs, &runs[2..]);
}

#[tokio::test]
async fn test_fully_stale_selection_is_a_claim_conflict() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(2).await;
    let snapshot = env
        .services
        .selector
        .select_runs(PROXY_DATASET, 2)
        .await
        .unwrap();
    let stale = stale_submitter(&env, snapshot);

    env.services
        .submitter
        .submit_job(PROXY_DATASET, 2)
        .await
        .unwrap();

    let err = stale.submit_job(PROXY_DATASET, 2).await.unwrap_err();
    match err {
        Error::ClaimConflict {
            dataset,
            candidates,
        } => {
            assert_eq!(dataset, PROXY_DATASET);
            assert_eq!(candidates, 2);
        }
        other => panic!("expected ClaimConflict, got {other:?}"),
    }

    // The conflicting attempt left no job row and reached no scheduler.
    let jobs = env.services.list_jobs(Some(PROXY_DATASET), 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(env.scheduler.requests().len(), 1);
}

#[tokio::test]
async fn test_descriptor_write_failure_fails_job_and_keeps_claims() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(3).await;

    // A plain file where the dataset output directory belongs.
    let output_dir = env.services.config.dataset_output_dir(PROXY_DATASET);
    tokio::fs::create_dir_all(output_dir.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&output_dir, b"not a directory").await.unwrap();

    let err = env
        .services
        .submitter
        .submit_job(PROXY_DATASET, 3)
        .await
        .unwrap_err();

    let (job_key, reason) = match err {
        Error::SubmissionFailed { job_key, reason } => (job_key, reason),
        other => panic!("expected SubmissionFailed, got {other:?}"),
    };
    assert!(reason.contains("descriptor"));

    let job = env.services.jobs.get_job(job_key).await.unwrap();
    assert_eq!(job.job_status(), Some(JobStatus::Failed));

    let runs = env.services.runs.list_runs_for_job(job_key).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert!(
        runs.iter()
            .all(|r| r.run_status() == Some(RunStatus::Claimed) && r.jobkey == Some(job_key))
    );
    assert!(env.scheduler.requests().is_empty());
}

#[tokio::test]
async fn test_paths_with_whitespace_are_rejected_at_registration() {
    let env = TestEnv::new().await;
    let spaced = env.dir.path().join("data").join("proxy set");
    tokio::fs::create_dir_all(&spaced).await.unwrap();

    let err = env
        .services
        .registry
        .register_dataset("ds_spaced", &spaced)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(env.services.registry.list_datasets().await.unwrap().is_empty());

    let data_dir = env.data_dir();
    tokio::fs::create_dir_all(&data_dir).await.unwrap();
    env.services
        .registry
        .register_dataset(PROXY_DATASET, &data_dir)
        .await
        .unwrap();

    let runs = vec![
        NewRun::new(69301, data_dir.join("run69301.mid").display().to_string()),
        NewRun::new(69302, data_dir.join("run 69302.mid").display().to_string()),
    ];
    let err = env
        .services
        .registry
        .register_runs(PROXY_DATASET, &runs)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(env.services.runs.list_runs(PROXY_DATASET).await.unwrap().is_empty());
}
