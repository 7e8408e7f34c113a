mod cli;

use std::process;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{error, warn};

use musun_prod::ServiceContainer;
use musun_prod::database::models::{NewRun, Registration};
use musun_prod::logging::{LOG_RETENTION_DAYS, cleanup_old_logs, init_logging};
use musun_prod::services::ActiveReconciliation;

use crate::cli::{Cli, Commands, DatasetCommand, RunsCommand};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _guard = match init_logging(cli.verbose, cli.quiet, cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    if let Some(dir) = &cli.log_dir
        && let Err(e) = cleanup_old_logs(dir, LOG_RETENTION_DAYS).await
    {
        warn!(error = %e, "Failed to clean up old logs");
    }

    if let Err(e) = run(&cli).await {
        error!("{e:#}");
        if cli.json {
            let error_json = serde_json::json!({
                "status": "error",
                "message": format!("{e:#}"),
            });
            println!("{error_json}");
        } else {
            eprintln!("Error: {e:#}");
        }
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = cli.tracker_config().context("invalid configuration")?;
    let services = ServiceContainer::new(config)
        .await
        .context("failed to open production database")?;

    let result = execute(cli, &services).await;
    services.shutdown().await;
    result
}

async fn execute(cli: &Cli, services: &ServiceContainer) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Dataset { action } => match action {
            DatasetCommand::Register { name, path } => {
                let outcome = services.registry.register_dataset(name, path).await?;
                let created = outcome == Registration::Created;
                emit(cli.json, &serde_json::json!({ "dataset": name, "created": created }), || {
                    if created {
                        format!("Registered dataset {name} at {}", path.display())
                    } else {
                        format!("Dataset {name} already registered at {}", path.display())
                    }
                })
            }
            DatasetCommand::Show { name } => {
                let path = services.registry.resolve_dataset(name).await?;
                let counts = services.runs.count_by_status(name).await?;
                emit(
                    cli.json,
                    &serde_json::json!({ "dataset": name, "path": path, "runs": counts }),
                    || {
                        format!(
                            "{name}\t{}\n  runs: {} total, {} unclaimed, {} claimed, {} processed, {} error",
                            path.display(),
                            counts.total(),
                            counts.unclaimed,
                            counts.claimed,
                            counts.processed,
                            counts.error
                        )
                    },
                )
            }
            DatasetCommand::List => {
                let datasets = services.registry.list_datasets().await?;
                emit(cli.json, &datasets, || {
                    datasets
                        .iter()
                        .map(|d| format!("{}\t{}", d.name, d.path))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
        },

        Commands::Runs { action } => match action {
            RunsCommand::Discover { dataset } => {
                let report = services.registry.discover_runs(dataset).await?;
                emit(
                    cli.json,
                    &serde_json::json!({
                        "dataset": dataset,
                        "found": report.found,
                        "registered": report.registered,
                    }),
                    || {
                        format!(
                            "Found {} response files, registered {} new runs",
                            report.found, report.registered
                        )
                    },
                )
            }
            RunsCommand::Add { dataset, runs } => {
                let runs: Vec<NewRun> = runs
                    .iter()
                    .map(|(run, file)| NewRun::new(*run, file.clone()))
                    .collect();
                let inserted = services.registry.register_runs(dataset, &runs).await?;
                emit(
                    cli.json,
                    &serde_json::json!({ "dataset": dataset, "registered": inserted }),
                    || format!("Registered {inserted} of {} runs", runs.len()),
                )
            }
            RunsCommand::List { dataset } => {
                let runs = services.runs.list_runs(dataset).await?;
                emit(cli.json, &runs, || {
                    runs.iter()
                        .map(|r| {
                            let job = r.jobkey.map(|k| k.to_string()).unwrap_or_else(|| "-".into());
                            format!("{}\t{}\t{}\t{}", r.runnumber, r.status, job, r.responsefile)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
            }
        },

        Commands::Submit { dataset, count } => {
            let submission = services.submitter.submit_job(dataset, *count).await?;
            emit(cli.json, &submission, || {
                let runs: Vec<String> = submission
                    .claimed_runs
                    .iter()
                    .map(|r| r.runnumber.to_string())
                    .collect();
                let mut text = format!(
                    "Submitted job {} with {} runs: {}",
                    submission.job_key,
                    runs.len(),
                    runs.join(" ")
                );
                if submission.is_partial() {
                    text.push_str(&format!(" (requested {})", submission.requested));
                }
                let ack = submission.scheduler_output.trim();
                if !ack.is_empty() {
                    text.push_str(&format!("\nScheduler: {ack}"));
                }
                text
            })
        }

        Commands::Reconcile { job_key, active } => {
            let outcome = if *active {
                services.reconcile_active().await?
            } else {
                let mut outcome = ActiveReconciliation::default();
                for key in job_key.iter() {
                    outcome.reports.push(services.collector.reconcile(*key).await?);
                }
                outcome
            };

            emit(cli.json, &outcome, || {
                let reports = outcome.reports.iter().map(|r| {
                    format!(
                        "Job {}: {} processed, {} errors, {} malformed; {} ({}/{} runs finished)",
                        r.job_key,
                        r.processed_count,
                        r.error_count,
                        r.malformed_count,
                        r.job_status,
                        r.runs.finalized(),
                        r.runs.total()
                    )
                });
                let failures = outcome
                    .failures
                    .iter()
                    .map(|f| format!("Job {}: reconciliation failed: {}", f.job_key, f.error));
                reports.chain(failures).collect::<Vec<_>>().join("\n")
            })?;

            if !outcome.failures.is_empty() {
                let keys: Vec<String> = outcome
                    .failures
                    .iter()
                    .map(|f| f.job_key.to_string())
                    .collect();
                anyhow::bail!("reconciliation failed for jobs {}", keys.join(", "));
            }
            Ok(())
        }

        Commands::Status {
            job_key: Some(job_key),
            ..
        } => {
            let summary = services.job_summary(*job_key).await?;
            emit(cli.json, &summary, || {
                let job = &summary.job;
                let submitted = job
                    .submitted_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default();
                let completed = job
                    .completed_at()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                let mut text = format!(
                    "Job {} [{}] dataset {}\n  submitted {submitted}, completed {completed}\n  output {}\n  runs: {} claimed, {} processed, {} error",
                    job.jobkey,
                    job.status,
                    job.dataset,
                    job.outputdir,
                    summary.runs.claimed,
                    summary.runs.processed,
                    summary.runs.error
                );
                for run in &summary.run_rows {
                    text.push_str(&format!("\n  {}\t{}", run.runnumber, run.status));
                }
                text
            })
        }

        Commands::Status {
            job_key: None,
            dataset,
            limit,
        } => {
            let jobs = services.list_jobs(dataset.as_deref(), *limit).await?;
            emit(cli.json, &jobs, || {
                jobs.iter()
                    .map(|j| {
                        format!(
                            "{}\t{}\t{}\t{} runs",
                            j.jobkey, j.status, j.dataset, j.claimed_runs
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

/// Print `value` as JSON, or the text rendering otherwise.
fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        let text = text();
        if !text.is_empty() {
            println!("{text}");
        }
    }
    Ok(())
}
