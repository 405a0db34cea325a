//! Report a job's task counters and observed rates.
//!
//! Never fails on missing throughput: rates are reported as "No data" until
//! enough attempts have completed to compute them.

use anyhow::Result;

use super::{CLIENT, open_state};
use crate::config::Config;
use crate::errors::{NotReady, StateError};
use crate::state::{Job, JobPhase};

pub fn run(config: &Config, job_id: i64) -> Result<()> {
    let (state, filesystems) = open_state(config)?;
    let job = Job::new(state, CLIENT, Some(job_id), false)?;
    let status = job.status()?;

    println!("Job {job_id}");
    println!("  Pending:   {}", status.pending);
    println!("  Running:   {}", status.running);
    println!("  Failed:    {}", status.failed);
    println!("  Succeeded: {}", status.succeeded);

    match status.throughput(filesystems.lustre.name(), filesystems.irods.name()) {
        Ok(throughput) => {
            println!(
                "  Transfer rate: {:.2} MiB/s",
                throughput.transfer_rate / (1024.0 * 1024.0)
            );
            println!("  Failure rate:  {:.1}%", throughput.failure_rate * 100.0);
        }
        Err(StateError::NotReady(NotReady::NoThroughputData(_))) => {
            println!("  Transfer rate: No data");
            println!("  Failure rate:  No data");
        }
        Err(error) => return Err(error.into()),
    }

    let transfer = status.phase(JobPhase::Transfer)?;
    let phase = match (transfer.start, transfer.finish) {
        (None, _) => "not started".to_string(),
        (Some(start), None) => format!("in progress since {start}"),
        (Some(_), Some(finish)) => format!("complete at {finish}"),
    };
    println!("  Transfer phase: {phase}");

    Ok(())
}
