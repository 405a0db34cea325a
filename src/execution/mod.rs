//! Batch-scheduler abstraction.
//!
//! The engine only needs three things from a cluster: submit a command as one
//! or more workers, signal a worker, and describe the worker it is currently
//! running as (identity, status, runtime limit). The LSF backend implements
//! this; tests substitute their own.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::ExecutionError;

pub mod lsf;

pub use lsf::Lsf;

/// A worker is one element of a cluster job, indexed from 1 within its
/// worker array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentifier {
    pub job: String,
    pub worker: Option<u32>,
}

impl WorkerIdentifier {
    pub fn new(job: impl Into<String>, worker: Option<u32>) -> Self {
        WorkerIdentifier {
            job: job.into(),
            worker,
        }
    }
}

impl std::fmt::Display for WorkerIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.worker {
            Some(index) => write!(f, "{}[{}]", self.job, index),
            None => write!(f, "{}", self.job),
        }
    }
}

/// A command to run on the cluster.
#[derive(Debug, Clone, Default)]
pub struct ExecJob {
    pub command: String,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    /// Submit a worker array of this many elements.
    pub workers: Option<u32>,
    /// Submit a single worker with this explicit index.
    pub specific_worker: Option<u32>,
    /// Only start once each of these workers has ended.
    pub dependencies: Vec<WorkerIdentifier>,
}

impl ExecJob {
    pub fn new(command: impl Into<String>) -> Self {
        ExecJob {
            command: command.into(),
            ..ExecJob::default()
        }
    }
}

/// Submission resources and placement.
#[derive(Debug, Clone)]
pub struct SubmissionOptions {
    pub cores: u32,
    /// Memory in megabytes.
    pub memory: u32,
    pub queue: Option<String>,
    pub group: Option<String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Pending,
    Succeeded,
    Failed,
    Suspended,
    Unknown,
}

impl WorkerStatus {
    pub fn is_done(self) -> bool {
        matches!(self, WorkerStatus::Succeeded | WorkerStatus::Failed)
    }
}

/// What a worker knows about itself.
pub struct WorkerContext {
    pub id: WorkerIdentifier,
    pub status: WorkerStatus,
    /// The queue's runtime limit, where the scheduler imposes one.
    pub runtime_limit: Option<chrono::Duration>,
}

/// Submit/signal/worker-context contract a scheduler backend must implement.
pub trait Executor {
    /// Submit a job, returning one identifier per worker.
    fn submit(
        &self,
        job: &ExecJob,
        options: &SubmissionOptions,
    ) -> Result<Vec<WorkerIdentifier>, ExecutionError>;

    /// Send a signal to a worker.
    fn signal(&self, worker: &WorkerIdentifier, signum: i32) -> Result<(), ExecutionError>;

    /// Describe the worker this process is running as.
    fn worker(&self) -> Result<WorkerContext, ExecutionError>;
}

/// Log a failed subprocess in a canonical form: message, exit code, then
/// every output line tagged by stream.
pub(crate) fn log_failure(message: &str, output: &std::process::Output) {
    let streams = [
        ("STDOUT", &output.stdout),
        ("STDERR", &output.stderr),
    ];

    let lines: Vec<String> = streams
        .iter()
        .flat_map(|(name, bytes)| {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(|line| format!("<{name}> {line}"))
                .collect::<Vec<_>>()
        })
        .collect();

    log::error!(
        "{message}; exit code {}\n{}",
        output.status.code().unwrap_or(-1),
        lines.join("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_identifiers_render_with_their_index() {
        assert_eq!(WorkerIdentifier::new("123", Some(4)).to_string(), "123[4]");
        assert_eq!(WorkerIdentifier::new("123", None).to_string(), "123");
    }

    #[test]
    fn terminal_statuses_are_done() {
        assert!(WorkerStatus::Succeeded.is_done());
        assert!(WorkerStatus::Failed.is_done());
        assert!(!WorkerStatus::Running.is_done());
        assert!(!WorkerStatus::Pending.is_done());
    }
}
