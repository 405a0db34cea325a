//! Preparation worker: plan the job's tasks from its FoFN.
//!
//! One instance runs per job. It enters the preparation phase (scoped, so
//! the finish timestamp is set on every exit path), streams the FoFN through
//! the transfer route, and inserts one task per file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use super::{CLIENT, open_state};
use crate::config::Config;
use crate::planning::transformers::{debugging, prefix, strip_common_prefix, telemetry};
use crate::planning::vault::{load_team_mapping, vault_transformer};
use crate::planning::posix_to_irods_factory;
use crate::state::{DependentTask, Job, JobPhase, PhaseGuard};

pub fn run(config: &Config, job_id: i64) -> Result<()> {
    let (state, filesystems) = open_state(config)?;
    let job = Job::new(state, CLIENT, Some(job_id), false)?;

    // The FoFN and target subcollection were persisted by the submitter
    let metadata = job.metadata()?;
    let fofn = metadata
        .get("fofn")
        .map(PathBuf::from)
        .context("job has no fofn metadata")?;
    let subcollection = metadata
        .get("subcollection")
        .context("job has no subcollection metadata")?;

    if job.status()?.phase(JobPhase::Preparation)?.start.is_some() {
        bail!("preparation phase has already started for job {job_id}");
    }

    let guard = PhaseGuard::enter(job.status()?.phase(JobPhase::Preparation)?)?;
    log::info!("Preparation phase started");

    let mut route = posix_to_irods_factory(
        Arc::clone(&filesystems.lustre),
        Arc::clone(&filesystems.irods),
    );

    if metadata.get("vault").map(String::as_str) == Some("Yes") {
        // Vault sources carry their canonical targets in their addresses
        let teams = match &config.teams {
            Some(path) => load_team_mapping(path)
                .with_context(|| format!("cannot load team mapping {}", path.display()))?,
            None => Default::default(),
        };
        route += vault_transformer(teams);
    } else {
        route += strip_common_prefix();
        route += prefix(config.irods_base.join(subcollection));
    }

    route += debugging();
    route += telemetry();

    let mut tasks = 0usize;
    for task in route.plan_fofn(&fofn, b'\n', None)? {
        log::info!("{} to {}", task.source, task.target);

        // A single-hop route has no inter-task dependencies
        job.insert(DependentTask::new(task))?;
        tasks += 1;
    }

    log::info!("Added {tasks} tasks to the job");

    drop(guard);
    log::info!("Preparation phase complete");
    Ok(())
}
