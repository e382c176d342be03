//! In-memory job registry.
//!
//! Jobs live only in process memory; a restart loses them and callers must
//! re-submit. A periodic sweep force-fails jobs stuck in `processing` and
//! drops terminal jobs once their retention window has passed.

use crate::models::{JobState, JobStatus};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Expiry settings for a [`JobStore`].
#[derive(Debug, Clone)]
pub struct JobStoreConfig {
    /// How long terminal jobs are kept after completion.
    pub retention: Duration,
    /// Longest a job may stay in `processing` before it is force-failed.
    pub max_processing: Duration,
    /// Interval between sweeps.
    pub sweep_interval: Duration,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(60 * 60),
            max_processing: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timed_out: Vec<String>,
    pub removed: Vec<String>,
}

/// Shared map of job id to job state.
///
/// Cloning is cheap and every clone sees the same jobs.
#[derive(Debug, Clone)]
pub struct JobStore {
    jobs: Arc<Mutex<HashMap<String, JobState>>>,
    config: JobStoreConfig,
}

impl JobStore {
    pub fn new(config: JobStoreConfig) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, JobState>> {
        // No invariant spans a panic while the lock is held.
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new job.
    pub fn create(&self, job_id: &str, state: JobState) {
        debug!("Creating job {}", job_id);
        self.jobs().insert(job_id.to_string(), state);
    }

    /// Current state of a job, if it is still known.
    pub fn get(&self, job_id: &str) -> Option<JobState> {
        self.jobs().get(job_id).cloned()
    }

    /// Mutate the current state of a job in place.
    ///
    /// The closure sees the entry as it is now, not a copy read before an
    /// await. Returns `false` if the job no longer exists.
    pub fn update<F>(&self, job_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut JobState),
    {
        match self.jobs().get_mut(job_id) {
            Some(state) => {
                f(state);
                true
            }
            None => {
                warn!("Job {} disappeared before update", job_id);
                false
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    /// Run one housekeeping pass as of `now`.
    ///
    /// Stuck jobs are failed first; a job failed here gets `completed_at = now`
    /// and so survives until its own retention window ends.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let mut jobs = self.jobs();

        for (job_id, state) in jobs.iter_mut() {
            if state.status == JobStatus::Processing
                && elapsed(state.started_at, now) > self.config.max_processing
            {
                state.fail(
                    format!(
                        "Job timed out after {} seconds without completing",
                        self.config.max_processing.as_secs()
                    ),
                    now,
                );
                report.timed_out.push(job_id.clone());
            }
        }

        jobs.retain(|job_id, state| {
            let finished_at = match (state.status, state.completed_at) {
                (JobStatus::Processing, _) => return true,
                (_, Some(at)) => at,
                (_, None) => state.started_at,
            };

            if elapsed(finished_at, now) > self.config.retention {
                report.removed.push(job_id.clone());
                false
            } else {
                true
            }
        });

        if !report.timed_out.is_empty() {
            warn!("Force-failed {} stuck jobs", report.timed_out.len());
        }
        if !report.removed.is_empty() {
            info!("Removed {} expired jobs", report.removed.len());
        }

        report
    }

    /// Spawn the periodic sweep. Abort the handle to stop it.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let store = self.clone();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            info!("Starting job sweeper with interval = {}s", period.as_secs());
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                store.sweep(Utc::now());
            }
        })
    }
}

/// Time from `since` to `now`; zero if `since` lies in the future.
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
