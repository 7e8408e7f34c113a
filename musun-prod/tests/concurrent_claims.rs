//! Several tracker processes submitting against one dataset at once.

mod common;

use std::sync::Arc;

use dashmap::DashSet;
use tokio::task::JoinSet;

use common::{PROXY_DATASET, TestEnv};
use musun_prod::Error;
use musun_prod::database::models::RunStatus;

async fn run_submitters(
    env: &TestEnv,
    submitters: usize,
    per_job: usize,
) -> (Arc<DashSet<i64>>, usize, usize) {
    let claimed = Arc::new(DashSet::new());
    let mut set = JoinSet::new();

    for _ in 0..submitters {
        let services = env.second_process().await;
        let claimed = claimed.clone();
        set.spawn(async move {
            let result = services
                .submitter
                .submit_job(PROXY_DATASET, per_job)
                .await;
            services.shutdown().await;
            match result {
                Ok(submission) => {
                    for run in &submission.claimed_runs {
                        assert!(
                            claimed.insert(run.runkey),
                            "run {} claimed by two jobs",
                            run.runnumber
                        );
                    }
                    true
                }
                Err(Error::NoUnclaimedRuns { .. }) | Err(Error::ClaimConflict { .. }) => false,
                Err(e) => panic!("unexpected submission error: {e}"),
            }
        });
    }

    let mut accepted = 0;
    let mut turned_away = 0;
    while let Some(joined) = set.join_next().await {
        if joined.unwrap() {
            accepted += 1;
        } else {
            turned_away += 1;
        }
    }
    (claimed, accepted, turned_away)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_submitters_never_share_runs() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(30).await;

    let (claimed, accepted, _) = run_submitters(&env, 8, 3).await;

    assert_eq!(accepted, 8);
    assert_eq!(claimed.len(), 24);

    let counts = env
        .services
        .runs
        .count_by_status(PROXY_DATASET)
        .await
        .unwrap();
    assert_eq!(counts.claimed, 24);
    assert_eq!(counts.unclaimed, 6);

    let jobs = env.services.list_jobs(Some(PROXY_DATASET), 100).await.unwrap();
    assert_eq!(jobs.len(), 8);
    let mut keys: Vec<i64> = jobs.iter().map(|j| j.jobkey).collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_oversubscribed_dataset_is_fully_claimed_once() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(30).await;

    let (claimed, accepted, turned_away) = run_submitters(&env, 12, 3).await;

    assert_eq!(claimed.len(), 30);
    assert_eq!(accepted + turned_away, 12);
    assert!(accepted >= 10);

    let runs = env.services.runs.list_runs(PROXY_DATASET).await.unwrap();
    assert!(runs.iter().all(|r| r.run_status() == Some(RunStatus::Claimed)));

    let jobs = env.services.list_jobs(Some(PROXY_DATASET), 100).await.unwrap();
    assert_eq!(jobs.len(), accepted);
    let recorded: i64 = jobs.iter().map(|j| j.claimed_runs).sum();
    assert_eq!(recorded, 30);
}

/// Many more submitters with SQLite lock contention; run with `--ignored`.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn stress_many_submitters() {
    let env = TestEnv::new().await;
    env.seed_proxy_dataset(400).await;

    let (claimed, _, _) = run_submitters(&env, 64, 7).await;
    assert_eq!(claimed.len(), 400);
}
