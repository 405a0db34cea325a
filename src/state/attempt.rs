//! One execution of a task's script, with two-phase verification.
//!
//! An attempt reconstructs its task from persisted rows, runs the script in
//! the foreground while a helper thread computes the source-side size and
//! checksum, and then verifies the target against both. Size and checksum
//! values are write-once per data id: when an intermediate data row is the
//! target of one task and the aliased source of the next, its verification
//! state is computed exactly once.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::{NotReady, StateError};
use crate::filesystem::{Data, DataOrigin, common_checksum_algorithm};
use crate::state::db::StateBackend;
use crate::task::{ExitCode, MISMATCHED_CHECKSUM, MISMATCHED_SIZE, Task};

pub struct Attempt {
    state: Arc<StateBackend>,
    id: i64,
    task: Task,
    source_id: i64,
    target_id: i64,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
}

impl Attempt {
    /// Reconstruct an attempt, and its task, from the persisted state.
    pub(crate) fn load(state: Arc<StateBackend>, id: i64) -> Result<Self, StateError> {
        let row = state.transaction(|tx| {
            Ok(tx.query_one(
                "select tasks.script,
                        source.id      as source_id,
                        source_fs.name as source_fs,
                        source.address as source,
                        target.id      as target_id,
                        target_fs.name as target_fs,
                        target.address as target,
                        attempts.start,
                        attempts.finish

                 from   attempts
                 join   tasks
                 on     tasks.id = attempts.task

                 join   data as source
                 on     source.id = tasks.source
                 join   filesystems as source_fs
                 on     source_fs.id = source.filesystem

                 join   data as target
                 on     target.id = tasks.target
                 join   filesystems as target_fs
                 on     target_fs.id = target.filesystem

                 where  attempts.id = $1",
                &[&id],
            )?)
        })?;

        let source_fs: String = row.try_get("source_fs")?;
        let target_fs: String = row.try_get("target_fs")?;

        let source = Data::new(
            state.filesystem_convertor(&source_fs)?,
            row.try_get::<_, String>("source")?,
        );
        let target = Data::new(
            state.filesystem_convertor(&target_fs)?,
            row.try_get::<_, String>("target")?,
        );

        Ok(Attempt {
            source_id: row.try_get("source_id")?,
            target_id: row.try_get("target_id")?,
            start: row.try_get("start")?,
            finish: row.try_get("finish")?,
            task: Task::new(row.try_get::<_, String>("script")?, source, target),
            state,
            id,
        })
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    fn origin(&self, origin: DataOrigin) -> (i64, &Data) {
        match origin {
            DataOrigin::Source => (self.source_id, &self.task.source),
            DataOrigin::Target => (self.target_id, &self.task.target),
        }
    }

    /// Persist the attempt start timestamp, if not already set.
    pub fn init(&mut self) -> Result<DateTime<Utc>, StateError> {
        let id = self.id;
        let start = self.state.transaction(|tx| {
            let row = tx.query_one(
                "update attempts set start = coalesce(start, now()) where id = $1 returning start",
                &[&id],
            )?;
            Ok(row.try_get::<_, Option<DateTime<Utc>>>("start")?)
        })?;

        self.start = start;
        start.ok_or_else(|| StateError::Backend("attempt start was not recorded".to_string()))
    }

    /// Persist the attempt finish timestamp, if not already set.
    pub fn stop(&mut self) -> Result<DateTime<Utc>, StateError> {
        let id = self.id;
        let finish = self.state.transaction(|tx| {
            let row = tx.query_one(
                "update attempts set finish = coalesce(finish, now()) where id = $1 returning finish",
                &[&id],
            )?;
            Ok(row.try_get::<_, Option<DateTime<Utc>>>("finish")?)
        })?;

        self.finish = finish;
        finish.ok_or_else(|| StateError::Backend("attempt finish was not recorded".to_string()))
    }

    /// The origin's persisted size, computed through its filesystem on first
    /// use. Thread-safe; write-once per data id.
    pub fn size(&self, origin: DataOrigin) -> Result<i64, StateError> {
        let (data_id, data) = self.origin(origin);

        if let Some(cached) = self.state.transaction(|tx| {
            let row = tx.query_opt("select size from size where data = $1", &[&data_id])?;
            Ok(match row {
                Some(row) => Some(row.try_get::<_, i64>("size")?),
                None => None,
            })
        })? {
            return Ok(cached);
        }

        let size = data.filesystem.size(&data.address)? as i64;

        self.state.transaction(|tx| {
            // A concurrent writer may have won; the stored value is
            // authoritative either way
            let row = tx.query_one(
                "insert into size (data, size)
                           values ($1, $2)
                      on conflict (data) do update set size = size.size
                        returning size",
                &[&data_id, &size],
            )?;
            Ok(row.try_get("size")?)
        })
    }

    /// The origin's persisted checksum under the given algorithm, computed
    /// through its filesystem on first use. Thread-safe; write-once per
    /// (data, algorithm).
    pub fn checksum(&self, origin: DataOrigin, algorithm: &str) -> Result<String, StateError> {
        let (data_id, data) = self.origin(origin);

        if let Some(cached) = self.state.transaction(|tx| {
            let row = tx.query_opt(
                "select checksum from checksums where data = $1 and algorithm = $2",
                &[&data_id, &algorithm],
            )?;
            Ok(match row {
                Some(row) => Some(row.try_get::<_, String>("checksum")?),
                None => None,
            })
        })? {
            return Ok(cached);
        }

        let checksum = data.filesystem.checksum(algorithm, &data.address)?;

        self.state.transaction(|tx| {
            let row = tx.query_one(
                "insert into checksums (data, algorithm, checksum)
                                values ($1, $2, $3)
                           on conflict (data, algorithm)
                         do update set checksum = checksums.checksum
                             returning checksum",
                &[&data_id, &algorithm, &checksum],
            )?;
            Ok(row.try_get("checksum")?)
        })
    }

    /// The recorded exit code; not ready while the attempt is in flight.
    pub fn exit_code(&self) -> Result<ExitCode, StateError> {
        let id = self.id;
        let code = self.state.transaction(|tx| {
            let row = tx.query_one("select exit_code from attempts where id = $1", &[&id])?;
            Ok(row.try_get::<_, Option<i32>>("exit_code")?)
        })?;

        code.map(ExitCode).ok_or_else(|| NotReady::AttemptInProgress.into())
    }

    pub fn set_exit_code(&self, code: ExitCode) -> Result<(), StateError> {
        let id = self.id;
        self.state.transaction(|tx| {
            tx.execute(
                "update attempts set exit_code = $1 where id = $2",
                &[&code.0, &id],
            )?;
            Ok(())
        })
    }

    /// Attempt the transfer task: execute the script and verify the copy.
    ///
    /// Returns whether the attempt succeeded; verification failures are not
    /// errors: they record a sentinel exit code and return false. On an
    /// engine error no exit code is recorded and the finish timestamp is
    /// left unset, so the attempt remains in flight for forcible-restart
    /// recovery (finish and exit code are always set together).
    pub fn run(&mut self) -> Result<bool, StateError> {
        self.init()?;
        let success = self.execute_and_verify()?;
        self.stop()?;
        Ok(success)
    }

    fn execute_and_verify(&self) -> Result<bool, StateError> {
        let task = &self.task;
        log::info!(
            "Attempting transfer of {} to {}",
            task.source,
            task.target
        );

        let algorithm = common_checksum_algorithm(
            task.source.filesystem.as_ref(),
            task.target.filesystem.as_ref(),
        )
        .ok_or_else(|| StateError::NoCommonChecksumAlgorithm {
            source_fs: task.source.filesystem.name().to_string(),
            target: task.target.filesystem.name().to_string(),
        })?;

        // Source-side metrics are computed concurrently with the script
        let (exit, source_metrics) = std::thread::scope(|scope| {
            let this = &*self;
            let algorithm = algorithm.as_str();
            let metrics = scope.spawn(move || -> Result<(i64, String), StateError> {
                Ok((
                    this.size(DataOrigin::Source)?,
                    this.checksum(DataOrigin::Source, algorithm)?,
                ))
            });

            let exit = task.execute();
            (exit, metrics.join().expect("source metrics thread panicked"))
        });

        let exit = exit.map_err(|e| StateError::Backend(format!("could not execute task: {e}")))?;
        let (source_size, source_checksum) = source_metrics?;

        if !exit.success() {
            log::warn!("Attempt failed with exit code {exit}");
            self.set_exit_code(exit)?;
            return Ok(false);
        }

        log::info!("Data copied; verifying...");

        let target_size = self.size(DataOrigin::Target)?;
        if source_size != target_size {
            log::warn!(
                "Attempt failed: source is {source_size} bytes; target is {target_size} bytes"
            );
            self.set_exit_code(MISMATCHED_SIZE)?;
            return Ok(false);
        }

        let target_checksum = self.checksum(DataOrigin::Target, &algorithm)?;
        if source_checksum != target_checksum {
            log::warn!(
                "Attempt failed: source has checksum {source_checksum}; \
                 target has checksum {target_checksum}"
            );
            self.set_exit_code(MISMATCHED_CHECKSUM)?;
            return Ok(false);
        }

        self.set_exit_code(ExitCode::SUCCESS)?;
        Ok(true)
    }
}
