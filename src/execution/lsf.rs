//! Platform LSF backend.
//!
//! Submission goes through `bsub`, signalling through `bkill -s`, and worker
//! introspection through `bjobs` plus the `LSB_JOBID`/`LSB_JOBINDEX`
//! environment. Queue definitions are parsed from `lsb.queues` so workers
//! can learn their queue's runtime limit and compute their deadline.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::OnceLock;

use anyhow::Context;
use chrono::Duration;
use regex::Regex;

use super::{
    ExecJob, Executor, SubmissionOptions, WorkerContext, WorkerIdentifier, WorkerStatus,
    log_failure,
};
use crate::errors::ExecutionError;

const WORKER_NAME: &str = "shepherd_worker";

/// An LSF queue, as far as the engine cares.
#[derive(Debug, Clone, PartialEq)]
pub struct LsfQueue {
    pub name: String,
    pub runlimit: Option<Duration>,
}

fn hhmm_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?P<hours>\d+):(?P<minutes>\d{2})").expect("valid pattern"))
}

/// RUNLIMIT values are minutes, or HH:MM.
fn parse_runlimit(value: &str) -> Option<Duration> {
    let value = value.trim();

    if let Ok(minutes) = value.parse::<i64>() {
        return Some(Duration::minutes(minutes));
    }

    let hhmm = hhmm_pattern().captures(value)?;
    let hours: i64 = hhmm["hours"].parse().ok()?;
    let minutes: i64 = hhmm["minutes"].parse().ok()?;
    Some(Duration::hours(hours) + Duration::minutes(minutes))
}

/// Parse queue definitions from an `lsb.queues` file.
pub fn parse_queues(config: &Path) -> anyhow::Result<HashMap<String, LsfQueue>> {
    let raw = std::fs::read_to_string(config)
        .with_context(|| format!("could not read LSF queue configuration {}", config.display()))?;

    let setting = Regex::new(r"(?P<key>\w+)\s*=\s*(?P<value>.+?)\s*$").expect("valid pattern");

    let mut queues = HashMap::new();
    let mut in_queue = false;
    let mut name: Option<String> = None;
    let mut runlimit: Option<Duration> = None;

    for line in raw.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }

        if line.contains("Begin Queue") {
            in_queue = true;
            continue;
        }

        if line.contains("End Queue") {
            in_queue = false;
            if let Some(name) = name.take() {
                queues.insert(
                    name.clone(),
                    LsfQueue {
                        name,
                        runlimit: runlimit.take(),
                    },
                );
            }
            runlimit = None;
            continue;
        }

        if !in_queue {
            continue;
        }

        if let Some(captures) = setting.captures(line) {
            match &captures["key"] {
                "QUEUE_NAME" => name = Some(captures["value"].to_string()),
                "RUNLIMIT" => runlimit = parse_runlimit(&captures["value"]),
                _ => {}
            }
        }
    }

    Ok(queues)
}

/// Platform LSF executor.
pub struct Lsf {
    queues: HashMap<String, LsfQueue>,
}

impl Lsf {
    /// `config_dir` is the LSF cluster configuration directory containing
    /// `lsb.queues`.
    pub fn new(config_dir: &Path) -> anyhow::Result<Self> {
        Ok(Lsf {
            queues: parse_queues(&config_dir.join("lsb.queues"))?,
        })
    }

    pub fn queue(&self, name: &str) -> Option<&LsfQueue> {
        self.queues.get(name)
    }

    /// Status and queue of a worker, from `bjobs`.
    fn bjobs(&self, id: &WorkerIdentifier) -> Result<(WorkerStatus, Option<&LsfQueue>), ExecutionError> {
        let output = run(
            Command::new("bjobs")
                .args(["-noheader", "-o", "stat queue delimiter=':'"])
                .arg(id.to_string()),
        )
        .map_err(|e| ExecutionError::CouldNotAddressWorker(format!("{id}: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !stderr.trim().is_empty() {
            if stderr.contains("not found") {
                return Err(ExecutionError::NoSuchWorker(id.to_string()));
            }
            log_failure(&format!("Could not address LSF job {id}"), &output);
            return Err(ExecutionError::CouldNotAddressWorker(id.to_string()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut fields = stdout.trim().splitn(2, ':');
        let status = worker_status(fields.next().unwrap_or(""));
        let queue = fields.next().and_then(|name| self.queues.get(name));

        Ok((status, queue))
    }
}

fn worker_status(stat: &str) -> WorkerStatus {
    match stat {
        "RUN" => WorkerStatus::Running,
        "PEND" | "WAIT" => WorkerStatus::Pending,
        "DONE" => WorkerStatus::Succeeded,
        "EXIT" => WorkerStatus::Failed,
        "USUSP" | "SSUSP" | "PSUSP" => WorkerStatus::Suspended,
        other => {
            log::warn!("Unrecognised LSF status \"{other}\"; converting to UNKNOWN");
            WorkerStatus::Unknown
        }
    }
}

fn job_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Job <(?P<id>\d+)>").expect("valid pattern"))
}

/// Extract the job id from bsub's "Job <id> is submitted ..." output.
fn parse_job_id(stdout: &str) -> Option<String> {
    job_id_pattern()
        .captures(stdout)
        .map(|captures| captures["id"].to_string())
}

/// Build the bsub argument vector for a submission.
fn submission_args(job: &ExecJob, options: &SubmissionOptions) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-n".into(),
        options.cores.to_string(),
        "-M".into(),
        options.memory.to_string(),
        "-R".into(),
        format!(
            "span[hosts=1] select[mem>{m}] rusage[mem={m}]",
            m = options.memory
        ),
    ];

    if let Some(queue) = &options.queue {
        args.extend(["-q".into(), queue.clone()]);
    }

    if let Some(group) = &options.group {
        args.extend(["-G".into(), group.clone()]);
    }

    if let Some(cwd) = &options.cwd {
        args.extend(["-cwd".into(), cwd.display().to_string()]);
    }

    if let Some(stdout) = &job.stdout {
        args.extend(["-o".into(), stdout.display().to_string()]);
    }

    if let Some(stderr) = &job.stderr {
        args.extend(["-e".into(), stderr.display().to_string()]);
    }

    // Workers in LSF are elements of an array job, if we have more than one
    if let Some(workers) = job.workers {
        if workers > 1 {
            args.extend(["-J".into(), format!("{WORKER_NAME}[1-{workers}]")]);
        }
    }

    if let Some(index) = job.specific_worker {
        args.extend(["-J".into(), format!("{WORKER_NAME}[{index}]")]);
    }

    let dependencies = job
        .dependencies
        .iter()
        .map(|id| format!("ended({id})"))
        .collect::<Vec<_>>()
        .join(" && ");

    if !dependencies.is_empty() {
        args.extend(["-w".into(), dependencies]);
    }

    args.push(job.command.clone());
    args
}

fn run(command: &mut Command) -> std::io::Result<Output> {
    log::debug!("Running: {command:?}");
    command.output()
}

impl Executor for Lsf {
    fn submit(
        &self,
        job: &ExecJob,
        options: &SubmissionOptions,
    ) -> Result<Vec<WorkerIdentifier>, ExecutionError> {
        if let Some(queue) = &options.queue {
            if !self.queues.contains_key(queue) {
                return Err(ExecutionError::CouldNotSubmit(format!(
                    "no such LSF queue \"{queue}\""
                )));
            }
        }

        let mut bsub = Command::new("bsub");
        bsub.args(submission_args(job, options));
        if let Some(env) = &job.env {
            bsub.envs(env);
        }

        let output =
            run(&mut bsub).map_err(|e| ExecutionError::CouldNotSubmit(e.to_string()))?;

        if !output.status.success() {
            log_failure("Could not submit job to LSF", &output);
            return Err(ExecutionError::CouldNotSubmit(
                "bsub exited non-zero".to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = match parse_job_id(&stdout) {
            Some(id) => id,
            None => {
                log_failure("Could not submit job to LSF", &output);
                return Err(ExecutionError::CouldNotSubmit(
                    "no job id in bsub output".to_string(),
                ));
            }
        };

        let workers: Vec<WorkerIdentifier> = match job.workers {
            Some(n) => (1..=n)
                .map(|index| WorkerIdentifier::new(job_id.clone(), Some(index)))
                .collect(),
            None => vec![WorkerIdentifier::new(job_id, job.specific_worker)],
        };

        Ok(workers)
    }

    fn signal(&self, worker: &WorkerIdentifier, signum: i32) -> Result<(), ExecutionError> {
        // A specific signal, rather than bkill's default kill sequence
        let output = run(Command::new("bkill")
            .args(["-s", &signum.to_string()])
            .arg(worker.to_string()))
        .map_err(|e| ExecutionError::CouldNotAddressWorker(format!("{worker}: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || !stderr.trim().is_empty() {
            if stderr.contains("No matching job found") {
                return Err(ExecutionError::NoSuchWorker(worker.to_string()));
            }
            log_failure(&format!("Could not address LSF job {worker}"), &output);
            return Err(ExecutionError::CouldNotAddressWorker(worker.to_string()));
        }

        Ok(())
    }

    fn worker(&self) -> Result<WorkerContext, ExecutionError> {
        let job = std::env::var("LSB_JOBID").map_err(|_| ExecutionError::NotAWorker)?;
        let index = std::env::var("LSB_JOBINDEX")
            .ok()
            .and_then(|raw| raw.parse::<u32>().ok())
            .filter(|&index| index > 0);

        let id = WorkerIdentifier::new(job, index);
        let (status, queue) = self.bjobs(&id)?;

        Ok(WorkerContext {
            id,
            status,
            runtime_limit: queue.and_then(|q| q.runlimit),
        })
    }
}
