use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;

use crate::common::error::{AppError, AppResult};

use super::model::Job;

/// The in-memory job table. One exclusive lock guards every record; callers only
/// ever hold it for the duration of a closure and never across an `.await`.
#[derive(Clone, Default)]
pub struct JobTable {
    jobs: Arc<Mutex<HashMap<String, Job>>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a new record if its id is free, neither of its artifact paths belongs
    /// to a record still in the table (terminal ones included, until swept) and fewer
    /// than `max_active` jobs are still running or queued.
    pub fn admit(&self, job: Job, max_active: usize) -> AppResult<()> {
        let mut jobs = self.lock();

        if jobs.contains_key(&job.id) {
            return Err(AppError::Conflict(format!("job id '{}' already exists", job.id)));
        }

        let mut active = 0;
        for other in jobs.values() {
            if other.input_path == job.input_path {
                return Err(AppError::Conflict("input file is already used by another job".to_string()));
            }
            if other.output_path == job.output_path {
                return Err(AppError::Conflict("output file is already owned by another job".to_string()));
            }
            if !other.status.is_terminal() {
                active += 1;
            }
        }
        if active >= max_active {
            return Err(AppError::CapacityExceeded { limit: max_active });
        }

        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Runs `f` against the record under the table lock.
    pub fn with_job<R>(&self, id: &str, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.lock().get_mut(id).map(f)
    }

    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|j| !j.status.is_terminal()).count()
    }

    /// Removes every record past its expiry. `on_expired` runs under the lock
    /// before the record is dropped, so artifact deletion precedes the purge.
    pub fn sweep(&self, now: OffsetDateTime, mut on_expired: impl FnMut(&Job)) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, job| {
            if job.is_expired(now) {
                on_expired(job);
                false
            } else {
                true
            }
        });
        before - jobs.len()
    }
}
