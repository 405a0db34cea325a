//! Submit a FoFN transfer job to the cluster.
//!
//! Creates the job row, persists the client metadata the workers will need,
//! then submits one preparation worker followed by a transfer-worker array
//! sized to the route's concurrency bound.

use std::path::Path;

use anyhow::{Context, Result};

use super::{CLIENT, open_state};
use crate::config::Config;
use crate::execution::{ExecJob, Executor, Lsf, SubmissionOptions};
use crate::planning::posix_to_irods_factory;
use crate::state::Job;

pub fn run(config: &Config, fofn: &Path, subcollection: &str, vault: bool) -> Result<()> {
    let fofn = fofn
        .canonicalize()
        .with_context(|| format!("cannot resolve FoFN {}", fofn.display()))?;

    let log_dir = config.log_dir.clone();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

    log::info!("Shepherd: {CLIENT}");
    log::info!("Logging to {}", log_dir.display());
    log::info!("Will transfer contents of {}", fofn.display());

    let (state, filesystems) = open_state(config)?;
    let job = Job::new(state, CLIENT, None, false)?;
    job.set_max_attempts(config.max_attempts)?;

    let fofn_value = fofn.to_string_lossy();
    let logdir_value = log_dir.to_string_lossy();
    job.set_metadata(&[
        ("fofn", fofn_value.as_ref()),
        ("subcollection", subcollection),
        ("logdir", logdir_value.as_ref()),
        ("daisychain", "Yes"),
        ("vault", if vault { "Yes" } else { "No" }),
    ])?;

    log::info!(
        "Created new job with ID {}, with up to {} attempts per task",
        job.id(),
        config.max_attempts
    );

    let executor = Lsf::new(&config.lsf_config)?;
    let binary = std::env::current_exe().context("cannot resolve own binary path")?;

    let mut prep = ExecJob::new(format!("\"{}\" __prepare {}", binary.display(), job.id()));
    let prep_log = log_dir.join("prep.log");
    prep.stdout = Some(prep_log.clone());
    prep.stderr = Some(prep_log);

    let prep_options = SubmissionOptions {
        cores: 1,
        memory: 1000,
        queue: Some(config.prep_queue.clone()),
        group: Some(config.lsf_group.clone()),
        cwd: None,
    };

    let prep_workers = executor.submit(&prep, &prep_options)?;
    let prep_worker = prep_workers.first().context("no preparation worker id")?;
    log::info!("Preparation phase submitted with LSF ID {}", prep_worker.job);

    // The worker count must not exceed the concurrency of any filesystem on
    // the route
    let route = posix_to_irods_factory(filesystems.lustre, filesystems.irods);
    let workers = route.max_concurrency();

    let mut transfer = ExecJob::new(format!("\"{}\" __transfer {}", binary.display(), job.id()));
    transfer.workers = Some(workers);
    let transfer_log = log_dir.join("transfer.%I.log");
    transfer.stdout = Some(transfer_log.clone());
    transfer.stderr = Some(transfer_log);

    let transfer_options = SubmissionOptions {
        cores: 4,
        memory: 1000,
        queue: Some(config.transfer_queue.clone()),
        group: Some(config.lsf_group.clone()),
        cwd: None,
    };

    let transfer_workers = executor.submit(&transfer, &transfer_options)?;
    let transfer_worker = transfer_workers.first().context("no transfer worker id")?;
    log::info!(
        "Transfer phase submitted with LSF ID {} and {} workers",
        transfer_worker.job,
        transfer_workers.len()
    );

    Ok(())
}
