//! Executor contract tests: queue configuration parsing and a trait-level
//! mock exercising the protocol the transfer worker depends on.

use std::path::Path;
use std::sync::Mutex;

use chrono::Duration;

use shepherd::errors::ExecutionError;
use shepherd::execution::lsf::{Lsf, parse_queues};
use shepherd::execution::{
    ExecJob, Executor, SubmissionOptions, WorkerContext, WorkerIdentifier, WorkerStatus,
};

fn write_cluster_config(dir: &Path) {
    std::fs::write(
        dir.join("lsb.queues"),
        r#"
# Cluster queues
Begin Queue
QUEUE_NAME   = normal
RUNLIMIT     = 720
End Queue

Begin Queue
QUEUE_NAME   = transfer
RUNLIMIT     = 12:00
End Queue
"#,
    )
    .unwrap();
}

#[test]
fn lsf_reads_queue_runlimits_from_cluster_config() {
    let dir = tempfile::tempdir().unwrap();
    write_cluster_config(dir.path());

    let lsf = Lsf::new(dir.path()).unwrap();
    assert_eq!(
        lsf.queue("normal").unwrap().runlimit,
        Some(Duration::minutes(720))
    );
    assert_eq!(
        lsf.queue("transfer").unwrap().runlimit,
        Some(Duration::hours(12))
    );
    assert!(lsf.queue("imaginary").is_none());
}

#[test]
fn lsf_construction_fails_without_cluster_config() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Lsf::new(dir.path()).is_err());
}

#[test]
fn queue_parsing_ignores_non_queue_settings() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("lsb.queues"),
        "PRIORITY = 10\nBegin Queue\nQUEUE_NAME = q\nNICE = 20\nEnd Queue\n",
    )
    .unwrap();

    let queues = parse_queues(&dir.path().join("lsb.queues")).unwrap();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues["q"].runlimit, None);
}

/// Records submissions and signals; pretends every worker is running.
#[derive(Default)]
struct MockExecutor {
    submitted: Mutex<Vec<ExecJob>>,
    signalled: Mutex<Vec<(WorkerIdentifier, i32)>>,
}

impl Executor for MockExecutor {
    fn submit(
        &self,
        job: &ExecJob,
        _options: &SubmissionOptions,
    ) -> Result<Vec<WorkerIdentifier>, ExecutionError> {
        self.submitted.lock().unwrap().push(job.clone());

        let workers = match (job.workers, job.specific_worker) {
            (Some(n), _) => (1..=n).map(Some).collect(),
            (None, index) => vec![index],
        };

        Ok(workers
            .into_iter()
            .map(|worker| WorkerIdentifier::new("99", worker))
            .collect())
    }

    fn signal(&self, worker: &WorkerIdentifier, signum: i32) -> Result<(), ExecutionError> {
        self.signalled.lock().unwrap().push((worker.clone(), signum));
        Ok(())
    }

    fn worker(&self) -> Result<WorkerContext, ExecutionError> {
        Ok(WorkerContext {
            id: WorkerIdentifier::new("99", Some(1)),
            status: WorkerStatus::Running,
            runtime_limit: Some(Duration::hours(12)),
        })
    }
}

#[test]
fn worker_arrays_yield_one_identifier_per_worker() {
    let executor = MockExecutor::default();

    let mut job = ExecJob::new("shepherd __transfer 1");
    job.workers = Some(3);

    let options = SubmissionOptions {
        cores: 4,
        memory: 1000,
        queue: Some("transfer".into()),
        group: None,
        cwd: None,
    };

    let workers = executor.submit(&job, &options).unwrap();
    assert_eq!(workers.len(), 3);
    assert_eq!(workers[0], WorkerIdentifier::new("99", Some(1)));
    assert_eq!(workers[2], WorkerIdentifier::new("99", Some(3)));
}

#[test]
fn follow_on_submissions_carry_their_dependency() {
    let executor = MockExecutor::default();
    let own_id = executor.worker().unwrap().id;

    // The daisy-chain shape: same worker index, dependent on ourselves
    let mut follow_on = ExecJob::new("shepherd __transfer 1");
    follow_on.specific_worker = own_id.worker;
    follow_on.dependencies = vec![own_id.clone()];

    let options = SubmissionOptions {
        cores: 4,
        memory: 1000,
        queue: None,
        group: None,
        cwd: None,
    };

    let submitted = executor.submit(&follow_on, &options).unwrap();
    assert_eq!(submitted, vec![WorkerIdentifier::new("99", Some(1))]);

    let recorded = executor.submitted.lock().unwrap();
    assert_eq!(recorded[0].dependencies, vec![own_id]);
    assert_eq!(recorded[0].specific_worker, Some(1));
}

#[test]
fn cancellation_signals_the_follow_on() {
    let executor = MockExecutor::default();
    let follow_on = WorkerIdentifier::new("99", Some(1));

    executor.signal(&follow_on, libc::SIGTERM).unwrap();

    let signalled = executor.signalled.lock().unwrap();
    assert_eq!(signalled.as_slice(), &[(follow_on, libc::SIGTERM)]);
}
