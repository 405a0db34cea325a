//! The job state machine.
//!
//! A job owns its filesystems, tasks, metadata and timestamps; a task owns
//! its attempts. Rows are never deleted. Task insertion walks a dependency
//! chain root-first, aliasing each step's target data row as the next step's
//! source so verification state is computed once per intermediate.

use std::collections::HashMap;
use std::sync::Arc;

use postgres::Transaction;

use crate::errors::{NotReady, StateError};
use crate::filesystem::Data;
use crate::state::attempt::Attempt;
use crate::state::db::{self, SCHEMA, StateBackend};
use crate::state::status::{JOB_PHASES, JobStatus};
use crate::task::{FORCIBLY_TERMINATED, Task};

/// A task with an optional chain of upstream dependencies.
///
/// The source address of each link must equal its dependency's target
/// address; insertion enforces this by construction, aliasing the dependency
/// target's data row as the new task's source.
pub struct DependentTask {
    pub task: Task,
    pub dependency: Option<Box<DependentTask>>,
}

impl DependentTask {
    pub fn new(task: Task) -> Self {
        DependentTask {
            task,
            dependency: None,
        }
    }

    pub fn after(task: Task, dependency: DependentTask) -> Self {
        DependentTask {
            task,
            dependency: Some(Box::new(dependency)),
        }
    }
}

/// A persisted job: the handle every worker operates through.
pub struct Job {
    state: Arc<StateBackend>,
    id: i64,
}

impl Job {
    /// Open a job for a client.
    ///
    /// With no `job_id` a fresh job row is created (`max_attempts` = 1 until
    /// the client raises it). With a `job_id` the job must have been created
    /// by the same client. With `force_restart`, both phases must be
    /// terminal; every in-flight attempt is then rewritten as forcibly
    /// terminated so the retry machinery can pick its task up again.
    pub fn new(
        state: Arc<StateBackend>,
        client_id: &str,
        job_id: Option<i64>,
        force_restart: bool,
    ) -> Result<Self, StateError> {
        state
            .execute_script(SCHEMA)
            .map_err(|e| StateError::Backend(format!("could not create schema\n{e}")))?;

        if let Some(id) = job_id {
            let known = state.transaction(|tx| {
                let row = tx.query_opt(
                    "select id from jobs where id = $1 and client = $2",
                    &[&id, &client_id],
                )?;
                Ok(row.is_some())
            })?;

            if !known {
                return Err(StateError::Backend(format!(
                    "job {id} does not exist or was started with a different client"
                )));
            }
        }

        let id = match job_id {
            Some(id) => {
                if force_restart {
                    let job = Job {
                        state: Arc::clone(&state),
                        id,
                    };

                    for phase in JOB_PHASES {
                        if job.status()?.phase(phase)?.in_progress() {
                            return Err(NotReady::JobStillRunning(id).into());
                        }
                    }

                    state.transaction(|tx| {
                        tx.execute(
                            "update attempts
                             set    start     = coalesce(start, now()),
                                    finish    = now(),
                                    exit_code = $1
                             where  exit_code is null
                             and    task in (select id from tasks where job = $2)",
                            &[&FORCIBLY_TERMINATED.0, &id],
                        )?;
                        Ok(())
                    })?;
                }

                id
            }

            None => state.transaction(|tx| {
                let row = tx.query_one(
                    "insert into jobs (client, max_attempts)
                               values ($1, 1)
                            returning id",
                    &[&client_id],
                )?;
                Ok(row.try_get("id")?)
            })?,
        };

        Ok(Job { state, id })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Add a dependent-task chain to the job.
    pub fn insert(&self, task: DependentTask) -> Result<(), StateError> {
        self.state.transaction(|tx| {
            self.insert_chain(tx, &task)?;
            Ok(())
        })
    }

    fn insert_chain(
        &self,
        tx: &mut Transaction<'_>,
        link: &DependentTask,
    ) -> Result<i64, StateError> {
        // Recurse to the root of the chain first
        let dependency = link
            .dependency
            .as_ref()
            .map(|dep| self.insert_chain(tx, dep))
            .transpose()?;

        // The source of a dependent task is the same data row as its
        // dependency's target; only the chain root persists a fresh source,
        // along with its size (the root source is the only place the
        // throughput estimator can learn original file sizes from)
        let source_id = match dependency {
            None => self.add_data(tx, &link.task.source, true)?,
            Some(dependency_id) => {
                let row = tx.query_one(
                    "select target from tasks where id = $1",
                    &[&dependency_id],
                )?;
                row.try_get("target")?
            }
        };

        let target_id = self.add_data(tx, &link.task.target, false)?;

        let row = tx.query_one(
            "insert into tasks (job, source, target, script, dependency)
                        values ($1, $2, $3, $4, $5)
                     returning id",
            &[
                &self.id,
                &source_id,
                &target_id,
                &link.task.script,
                &dependency,
            ],
        )?;
        Ok(row.try_get("id")?)
    }

    /// Persist a data record, implicitly creating its filesystem row.
    fn add_data(
        &self,
        tx: &mut Transaction<'_>,
        data: &Data,
        persist_size: bool,
    ) -> Result<i64, StateError> {
        // The redundant update makes the returning clause fire on conflict
        let row = tx.query_one(
            "insert into filesystems (job, name, max_concurrency)
                              values ($1, $2, $3)
                         on conflict (job, name)
                       do update set name = excluded.name
                           returning id",
            &[
                &self.id,
                &data.filesystem.name(),
                &(data.filesystem.max_concurrency() as i32),
            ],
        )?;
        let filesystem_id: i64 = row.try_get("id")?;

        let row = tx.query_one(
            "insert into data (filesystem, address) values ($1, $2) returning id",
            &[&filesystem_id, &data.address.to_string_lossy().as_ref()],
        )?;
        let data_id: i64 = row.try_get("id")?;

        if persist_size {
            let size = data.filesystem.size(&data.address)? as i64;
            tx.execute(
                "insert into size (data, size) values ($1, $2)",
                &[&data_id, &size],
            )?;
        }

        Ok(data_id)
    }

    /// Claim the next ready task and create its attempt sentinel.
    ///
    /// With a time limit, only tasks predicted to finish within it are
    /// considered; tasks with no prediction (no throughput data yet) always
    /// qualify. The exclusive lock on attempts serialises claims, so no two
    /// workers observe the same task as ready.
    pub fn attempt(&self, time_limit: Option<chrono::Duration>) -> Result<Attempt, StateError> {
        let job = self.id;
        let attempt_id = self.state.transaction(|tx| {
            db::lock(tx, "attempts")?;

            let task: Option<i64> = match time_limit {
                None => tx
                    .query_opt("select task from todo where job = $1 limit 1", &[&job])?
                    .map(|row| row.try_get("task"))
                    .transpose()?,

                Some(limit) => {
                    let seconds = limit.num_milliseconds() as f64 / 1000.0;
                    tx.query_opt(
                        "select task
                         from   todo
                         where  job = $1
                         and   (eta is null or eta <= $2)
                         limit  1",
                        &[&job, &seconds],
                    )?
                    .map(|row| row.try_get("task"))
                    .transpose()?
                }
            };

            let task = match task {
                Some(task) => task,
                None => return Err(NotReady::NoTasksAvailable.into()),
            };

            let row = tx.query_one(
                "insert into attempts (task) values ($1) returning id",
                &[&task],
            )?;
            Ok(row.try_get::<_, i64>("id")?)
        })?;

        Attempt::load(Arc::clone(&self.state), attempt_id)
    }

    /// The next pending attempt, regardless of time limit; `None` once the
    /// job is complete and no work remains.
    pub fn next_attempt(&self) -> Result<Option<Attempt>, StateError> {
        match self.attempt(None) {
            Ok(attempt) => Ok(Some(attempt)),
            Err(StateError::NotReady(NotReady::NoTasksAvailable)) => {
                if self.status()?.complete()? {
                    Ok(None)
                } else {
                    Err(NotReady::NoTasksAvailable.into())
                }
            }
            Err(error) => Err(error),
        }
    }

    pub fn max_attempts(&self) -> Result<i32, StateError> {
        let id = self.id;
        self.state.transaction(|tx| {
            let row = tx.query_one("select max_attempts from jobs where id = $1", &[&id])?;
            Ok(row.try_get("max_attempts")?)
        })
    }

    pub fn set_max_attempts(&self, value: i32) -> Result<(), StateError> {
        if value < 1 {
            return Err(StateError::Backend(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let id = self.id;
        self.state.transaction(|tx| {
            tx.execute(
                "update jobs set max_attempts = $1 where id = $2",
                &[&value, &id],
            )?;
            Ok(())
        })
    }

    pub fn status(&self) -> Result<JobStatus, StateError> {
        JobStatus::load(Arc::clone(&self.state), self.id)
    }

    pub fn metadata(&self) -> Result<HashMap<String, String>, StateError> {
        let id = self.id;
        self.state.transaction(|tx| {
            let rows = tx.query("select key, value from job_metadata where job = $1", &[&id])?;
            let mut metadata = HashMap::new();
            for row in rows {
                metadata.insert(row.try_get("key")?, row.try_get("value")?);
            }
            Ok(metadata)
        })
    }

    /// Insert or update key-value client metadata.
    pub fn set_metadata(&self, metadata: &[(&str, &str)]) -> Result<(), StateError> {
        let id = self.id;
        self.state.transaction(|tx| {
            for (key, value) in metadata {
                tx.execute(
                    "insert into job_metadata (job, key, value)
                                       values ($1, $2, $3)
                                  on conflict (job, key)
                                do update set value = excluded.value",
                    &[&id, key, value],
                )?;
            }
            Ok(())
        })
    }
}
