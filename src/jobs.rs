use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::models::{Job, JobType, Operation, ProgressSnapshot};

/// How long a finished job stays visible so late subscribers can observe its
/// terminal state before removal.
pub const JOB_CLEANUP_DELAY: Duration = Duration::from_secs(60);

/// In-process registry of batch jobs, keyed by opaque id.
///
/// All mutations go through one shared map. Progress ordering across
/// concurrent increments is not guaranteed; only the final count is, provided
/// every work unit increments exactly once. Operations on unknown ids are
/// silently ignored so progress reporting stays robust against late cleanup
/// races.
pub struct JobTracker {
    jobs: Mutex<HashMap<String, Job>>,
    cleanup_delay: Duration,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_cleanup_delay(JOB_CLEANUP_DELAY)
    }

    pub fn with_cleanup_delay(cleanup_delay: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            cleanup_delay,
        }
    }

    /// Registers a single-operation job over `total_leads` leads and returns
    /// its id. Ids are unique for the process lifetime.
    pub fn create_job(&self, job_type: JobType, total_leads: u32) -> String {
        self.insert_job(job_type, None, total_leads)
    }

    /// Registers an enrichment job. Progress is counted in (lead, operation)
    /// cells, so the work-unit total is `total_leads * operations.len()`.
    pub fn create_enrichment_job(&self, total_leads: u32, operations: Vec<Operation>) -> String {
        let total_units = total_leads.saturating_mul(operations.len() as u32);
        self.insert_job(JobType::Enrichment, Some(operations), total_units)
    }

    fn insert_job(
        &self,
        job_type: JobType,
        operations: Option<Vec<Operation>>,
        total_leads: u32,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let job = Job {
            id: id.clone(),
            job_type,
            operations,
            total_leads,
            processed_leads: 0,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.lock().insert(id.clone(), job);
        tracing::info!("Created {:?} job {} ({} unit(s))", job_type, id, total_leads);
        id
    }

    /// Bumps the processed counter and returns the updated snapshot. The
    /// counter never exceeds the total; the completion timestamp is stamped
    /// exactly once, when the total is first reached.
    pub fn increment_progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(job_id)?;
        if job.processed_leads < job.total_leads {
            job.processed_leads += 1;
        }
        if job.processed_leads >= job.total_leads && job.completed_at.is_none() {
            let completed_at = Utc::now();
            job.completed_at = Some(completed_at);
            let elapsed = completed_at.signed_duration_since(job.started_at);
            tracing::info!(
                "Job {} completed: {}/{} unit(s) in {}ms",
                job_id,
                job.processed_leads,
                job.total_leads,
                elapsed.num_milliseconds()
            );
        }
        Some(ProgressSnapshot {
            completed: job.processed_leads,
            total: job.total_leads,
        })
    }

    /// Snapshot of a job, or `None` when unknown or already cleaned up.
    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.lock().get(job_id).cloned()
    }

    pub fn is_complete(&self, job_id: &str) -> bool {
        self.lock()
            .get(job_id)
            .map(|j| j.completed_at.is_some())
            .unwrap_or(false)
    }

    /// Schedules removal of the job record after the cleanup delay.
    pub fn cleanup(self: &Arc<Self>, job_id: &str) {
        let tracker = Arc::clone(self);
        let job_id = job_id.to_string();
        let delay = self.cleanup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tracker.lock().remove(&job_id).is_some() {
                tracing::debug!("Cleaned up job {}", job_id);
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
