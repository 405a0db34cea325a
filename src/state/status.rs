//! Job and phase status.
//!
//! A job has two disjoint temporal phases, preparation and transfer, each
//! with a start and finish timestamp persisted in `job_timestamps`. Phase
//! transitions are forward-only: `init` writes the start only if absent and
//! `stop` coalesces the finish, so re-entry never moves either backwards.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::errors::{NotReady, StateError};
use crate::state::db::StateBackend;

/// The two temporal regions of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Preparation,
    Transfer,
}

pub const JOB_PHASES: [JobPhase; 2] = [JobPhase::Preparation, JobPhase::Transfer];

impl JobPhase {
    /// The persisted phase name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Preparation => "prepare",
            JobPhase::Transfer => "transfer",
        }
    }
}

/// Throughput rates between two filesystems for one job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobThroughput {
    /// Bytes per second.
    pub transfer_rate: f64,
    /// Probability of a terminal attempt failing.
    pub failure_rate: f64,
}

/// Persisted start/finish timestamps of one phase.
pub struct PhaseStatus {
    state: Arc<StateBackend>,
    job: i64,
    phase: JobPhase,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
}

impl PhaseStatus {
    pub(crate) fn load(
        state: Arc<StateBackend>,
        job: i64,
        phase: JobPhase,
    ) -> Result<Self, StateError> {
        let timestamps: (Option<DateTime<Utc>>, Option<DateTime<Utc>>) = state.transaction(|tx| {
            let row = tx.query_opt(
                "select start, finish from job_timestamps where job = $1 and phase = $2",
                &[&job, &phase.as_str()],
            )?;
            Ok(match row {
                Some(row) => (row.try_get("start")?, row.try_get("finish")?),
                None => (None, None),
            })
        })?;

        Ok(PhaseStatus {
            state,
            job,
            phase,
            start: timestamps.0,
            finish: timestamps.1,
        })
    }

    /// Persist the start timestamp if it has not been set, and return it.
    /// Idempotent: repeated calls return the original start.
    pub fn init(&mut self) -> Result<DateTime<Utc>, StateError> {
        if let Some(start) = self.start {
            return Ok(start);
        }

        let start = self.state.transaction(|tx| {
            // The redundant update makes the returning clause fire on
            // conflict, so a concurrent init still reads the winner's start
            let row = tx.query_one(
                "insert into job_timestamps (job, phase)
                                     values ($1, $2)
                                on conflict (job, phase)
                              do update set job = excluded.job
                                  returning start",
                &[&self.job, &self.phase.as_str()],
            )?;
            Ok(row.try_get("start")?)
        })?;

        self.start = Some(start);
        Ok(start)
    }

    /// Persist the finish timestamp if it has not been set, and return it.
    pub fn stop(&mut self) -> Result<DateTime<Utc>, StateError> {
        if self.start.is_none() {
            return Err(NotReady::PeriodNotStarted(self.phase.as_str()).into());
        }

        let finish = self.state.transaction(|tx| {
            let row = tx.query_one(
                "update    job_timestamps
                 set       finish = coalesce(finish, now())
                 where     job    = $1
                 and       phase  = $2
                 returning finish",
                &[&self.job, &self.phase.as_str()],
            )?;
            Ok(row.try_get("finish")?)
        })?;

        self.finish = finish;
        finish.ok_or_else(|| StateError::Backend("phase finish was not recorded".to_string()))
    }

    /// A phase is in progress until its finish timestamp is set; a phase
    /// that has not started counts as in progress (its work is still owed).
    pub fn in_progress(&self) -> bool {
        self.finish.is_none()
    }

    pub fn runtime(&self) -> Result<Duration, StateError> {
        let start = self
            .start
            .ok_or(NotReady::PeriodNotStarted(self.phase.as_str()))?;
        Ok(self.finish.unwrap_or_else(Utc::now) - start)
    }
}

/// Scoped phase acquisition: `init` on entry, `stop` on every exit path.
pub struct PhaseGuard {
    phase: Option<PhaseStatus>,
}

impl PhaseGuard {
    pub fn enter(mut phase: PhaseStatus) -> Result<Self, StateError> {
        phase.init()?;
        Ok(PhaseGuard { phase: Some(phase) })
    }
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        if let Some(mut phase) = self.phase.take() {
            if let Err(error) = phase.stop() {
                log::error!("could not close {} phase: {error}", phase.phase.as_str());
            }
        }
    }
}

/// Aggregate task counts for a job, with phase and throughput accessors.
pub struct JobStatus {
    state: Arc<StateBackend>,
    job: i64,
    pub pending: i64,
    pub running: i64,
    pub failed: i64,
    pub succeeded: i64,
}

impl JobStatus {
    pub(crate) fn load(state: Arc<StateBackend>, job: i64) -> Result<Self, StateError> {
        let counts = state.transaction(|tx| {
            let row = tx.query_opt(
                "select   sum(pending)   as pending,
                          sum(running)   as running,
                          sum(failed)    as failed,
                          sum(succeeded) as succeeded
                 from     job_status
                 where    job = $1
                 group by job",
                &[&job],
            )?;
            Ok(match row {
                Some(row) => (
                    row.try_get::<_, Option<i64>>("pending")?.unwrap_or(0),
                    row.try_get::<_, Option<i64>>("running")?.unwrap_or(0),
                    row.try_get::<_, Option<i64>>("failed")?.unwrap_or(0),
                    row.try_get::<_, Option<i64>>("succeeded")?.unwrap_or(0),
                ),
                None => (0, 0, 0, 0),
            })
        })?;

        Ok(JobStatus {
            state,
            job,
            pending: counts.0,
            running: counts.1,
            failed: counts.2,
            succeeded: counts.3,
        })
    }

    pub fn phase(&self, phase: JobPhase) -> Result<PhaseStatus, StateError> {
        PhaseStatus::load(Arc::clone(&self.state), self.job, phase)
    }

    /// Throughput rates between the given filesystems, by name.
    pub fn throughput(&self, source: &str, target: &str) -> Result<JobThroughput, StateError> {
        let job = self.job;
        let rates = self.state.transaction(|tx| {
            let row = tx.query_opt(
                "select job_throughput.transfer_rate,
                        job_throughput.failure_rate
                 from   job_throughput
                 join   filesystems as source_fs
                 on     source_fs.id = job_throughput.source
                 join   filesystems as target_fs
                 on     target_fs.id = job_throughput.target
                 where  job_throughput.job = $1
                 and    source_fs.name     = $2
                 and    target_fs.name     = $3",
                &[&job, &source, &target],
            )?;
            Ok(match row {
                Some(row) => (
                    row.try_get::<_, Option<f64>>("transfer_rate")?,
                    row.try_get::<_, Option<f64>>("failure_rate")?,
                ),
                None => (None, None),
            })
        })?;

        match rates {
            (Some(transfer_rate), Some(failure_rate)) => Ok(JobThroughput {
                transfer_rate,
                failure_rate,
            }),
            _ => Err(NotReady::NoThroughputData(job).into()),
        }
    }

    /// Completion means the transfer phase has terminated. Completion does
    /// not imply success.
    pub fn complete(&self) -> Result<bool, StateError> {
        let transfer = self.phase(JobPhase::Transfer)?;
        Ok(transfer.start.is_some() && transfer.finish.is_some())
    }

    /// Work remains while the preparation phase is in flight or tasks are
    /// still pending.
    pub fn work_remains(&self) -> Result<bool, StateError> {
        Ok(self.phase(JobPhase::Preparation)?.in_progress() || self.pending > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_match_the_schema() {
        assert_eq!(JobPhase::Preparation.as_str(), "prepare");
        assert_eq!(JobPhase::Transfer.as_str(), "transfer");
    }

    #[test]
    fn phases_are_enumerable() {
        assert_eq!(JOB_PHASES.len(), 2);
        assert_ne!(JOB_PHASES[0], JOB_PHASES[1]);
    }
}
