//! Transfer worker: claim, attempt, verify, repeat until the deadline.
//!
//! N instances run per job. Each worker daisy-chains a follow-on copy of
//! itself (dependent on its own termination), computes a deadline from its
//! queue's runtime limit, and then drains the ready set, asking only for
//! tasks predicted to fit in its remaining time. When nothing remains the
//! last worker out stops the transfer phase and cancels its follow-on.

use chrono::{Duration, Utc};

use anyhow::{Context, Result};

use super::{CLIENT, open_state};
use crate::config::Config;
use crate::errors::{NotReady, StateError};
use crate::execution::{ExecJob, Executor, Lsf, SubmissionOptions, WorkerContext};
use crate::filesystem::DataOrigin;
use crate::state::{Job, JobPhase};

/// Safety margin against the queue runtime limit, and the poll interval
/// while waiting for the preparation phase.
fn fudge() -> Duration {
    Duration::minutes(5)
}

pub fn run(config: &Config, job_id: i64) -> Result<()> {
    let (state, _filesystems) = open_state(config)?;
    let job = Job::new(state, CLIENT, Some(job_id), false)?;

    let executor = Lsf::new(&config.lsf_config)?;
    let worker = executor.worker()?;
    log::info!("Transfer worker {} started for job {job_id}", worker.id);

    let deadline = worker.runtime_limit.map(|limit| Utc::now() + limit - fudge());

    // Daisy-chain a follow-on of this worker, unless the client disabled it
    let daisychain = job.metadata()?.get("daisychain").map(String::as_str) == Some("Yes");
    let follow_on = if daisychain {
        Some(submit_follow_on(config, &executor, &worker, job_id)?)
    } else {
        None
    };

    // The ready set is empty until preparation has started planning
    loop {
        if job.status()?.phase(JobPhase::Preparation)?.start.is_some() {
            break;
        }

        if deadline.is_some_and(|d| Utc::now() >= d) {
            log::warn!("Deadline reached before the preparation phase started");
            return Ok(());
        }

        log::info!("Waiting for the preparation phase to start...");
        std::thread::sleep(fudge().to_std().unwrap_or_default());
    }

    job.status()?.phase(JobPhase::Transfer)?.init()?;

    loop {
        let remaining = deadline.map(|d| d - Utc::now());
        if remaining.is_some_and(|r| r <= Duration::zero()) {
            log::info!("Runtime limit approaching; terminating gracefully");
            return Ok(());
        }

        match job.attempt(remaining) {
            Ok(mut attempt) => {
                if attempt.run()? {
                    let bytes = attempt.size(DataOrigin::Source)?;
                    log::info!("Transferred {bytes} bytes of {}", attempt.task().source);
                }
            }

            Err(StateError::NotReady(NotReady::NoTasksAvailable)) => {
                let status = job.status()?;

                if status.phase(JobPhase::Preparation)?.in_progress() || status.pending > 0 {
                    // Work remains, but nothing this worker can fit before
                    // its deadline; the daisy chain picks it up
                    log::info!("No tasks currently available to this worker; exiting");
                    return Ok(());
                }

                if let Some(follow_on) = &follow_on {
                    log::info!("Job complete; cancelling follow-on worker {follow_on}");
                    if let Err(error) = executor.signal(follow_on, libc::SIGTERM) {
                        log::warn!("Could not cancel follow-on worker: {error}");
                    }
                }

                if status.running == 0 {
                    job.status()?.phase(JobPhase::Transfer)?.stop()?;
                    log::info!("Transfer phase complete");
                }

                return Ok(());
            }

            Err(error) => return Err(error.into()),
        }
    }
}

fn submit_follow_on(
    config: &Config,
    executor: &Lsf,
    worker: &WorkerContext,
    job_id: i64,
) -> Result<crate::execution::WorkerIdentifier> {
    let binary = std::env::current_exe().context("cannot resolve own binary path")?;

    let mut follow_on = ExecJob::new(format!("\"{}\" __transfer {job_id}", binary.display()));
    follow_on.specific_worker = worker.id.worker;
    follow_on.dependencies = vec![worker.id.clone()];
    let log_path = config.log_dir.join("transfer.%I.log");
    follow_on.stdout = Some(log_path.clone());
    follow_on.stderr = Some(log_path);

    let options = SubmissionOptions {
        cores: 4,
        memory: 1000,
        queue: Some(config.transfer_queue.clone()),
        group: Some(config.lsf_group.clone()),
        cwd: None,
    };

    let submitted = executor.submit(&follow_on, &options)?;
    let id = submitted
        .into_iter()
        .next()
        .context("no follow-on worker id")?;
    log::info!("Daisy-chained follow-on worker {id}");
    Ok(id)
}
