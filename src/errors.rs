//! Error taxonomy for the orchestration engine.
//!
//! Two families: `StateError` for anything raised by the persistence layer and
//! the job state machine, and `ExecutionError` for the batch-scheduler
//! adapter. The transient `NotReady` kinds are handled locally by the worker
//! loops (sleep, retry, or graceful exit); everything else propagates to the
//! process boundary where it is logged and the process exits non-zero.

use std::path::PathBuf;

use thiserror::Error;

/// Transient conditions: the data the caller asked for does not exist *yet*.
#[derive(Debug, Error)]
pub enum NotReady {
    #[error("{0} phase has yet to start")]
    PeriodNotStarted(&'static str),

    #[error("not enough data to calculate throughput rates for job {0}")]
    NoThroughputData(i64),

    #[error("no tasks are currently available to attempt")]
    NoTasksAvailable,

    #[error("attempt is still in progress")]
    AttemptInProgress,

    #[error("cannot restart job {0}; still in progress")]
    JobStillRunning(i64),
}

/// Errors raised by the persistence layer and the job state machine.
#[derive(Debug, Error)]
pub enum StateError {
    /// Persistence or logic errors: schema bootstrap, invalid job-client
    /// pairing, unresolvable filesystem names, driver failures.
    #[error("{0}")]
    Backend(String),

    #[error(transparent)]
    NotReady(#[from] NotReady),

    #[error("worker {0} has nothing to do")]
    WorkerRedundant(String),

    #[error("{source_fs} and {target} share no checksum algorithm")]
    NoCommonChecksumAlgorithm { source_fs: String, target: String },

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

impl From<postgres::Error> for StateError {
    fn from(error: postgres::Error) -> Self {
        StateError::Backend(error.to_string())
    }
}

impl From<r2d2::Error> for StateError {
    fn from(error: r2d2::Error) -> Self {
        StateError::Backend(error.to_string())
    }
}

/// Errors raised by filesystem drivers.
#[derive(Debug, Error)]
pub enum FilesystemError {
    #[error("cannot access {address} on {filesystem}")]
    DataInaccessible { filesystem: String, address: PathBuf },

    #[error("filesystem {filesystem} does not support the {algorithm} checksum algorithm")]
    UnsupportedChecksum {
        filesystem: String,
        algorithm: String,
    },

    #[error("{filesystem} does not support {operation}")]
    Unsupported {
        filesystem: String,
        operation: &'static str,
    },

    #[error("I/O error on {filesystem}: {source}")]
    Io {
        filesystem: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the batch-scheduler adapter.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("could not submit job: {0}")]
    CouldNotSubmit(String),

    #[error("no such worker: {0}")]
    NoSuchWorker(String),

    #[error("could not address worker {0}")]
    CouldNotAddressWorker(String),

    #[error("not running as a cluster worker")]
    NotAWorker,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_is_a_state_error() {
        let err: StateError = NotReady::NoTasksAvailable.into();
        assert!(matches!(
            err,
            StateError::NotReady(NotReady::NoTasksAvailable)
        ));
    }

    #[test]
    fn messages_name_the_offender() {
        let err = FilesystemError::UnsupportedChecksum {
            filesystem: "iRODS".into(),
            algorithm: "sha256".into(),
        };
        assert_eq!(
            err.to_string(),
            "filesystem iRODS does not support the sha256 checksum algorithm"
        );
    }
}
