//! Job lifecycle management for asynchronously executed operations.
//!
//! Jobs move `pending → running → {completed | failed | cancelled}` and never
//! backwards. Terminal jobs absorb further mutations as logged no-ops, which
//! is what makes cancellation purely advisory: a handler that finishes after
//! its job was cancelled changes nothing. A background sweep removes terminal
//! jobs once they outlive the retention window; pending and running jobs are
//! never swept.

use crate::services::clock::SharedClock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, handler not yet started.
    Pending,
    /// Handler is executing.
    Running,
    /// Handler finished successfully.
    Completed,
    /// Handler reported or raised an error.
    Failed,
    /// Cancelled by the caller before reaching a terminal state.
    Cancelled,
}

impl JobStatus {
    /// Whether this state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Check if this state can transition to another state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Pending, Cancelled) | (Running, Cancelled) => true,
            // Same state is a no-op, not a regression
            (a, b) if *a == b => true,
            _ => false,
        }
    }
}

/// Internal job record; mutated only through the manager.
#[derive(Debug, Clone)]
struct Job {
    id: String,
    correlation_id: String,
    operation_id: String,
    language_id: String,
    uri: String,
    status: JobStatus,
    progress: u8,
    message: Option<String>,
    result: Option<Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    /// Monotonic completion time; drives retention arithmetic.
    completed_instant: Option<Instant>,
}

/// Wire-facing view of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub correlation_id: String,
    pub operation_id: String,
    pub language_id: String,
    pub uri: String,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    fn record(&self) -> JobRecord {
        JobRecord {
            job_id: self.id.clone(),
            correlation_id: self.correlation_id.clone(),
            operation_id: self.operation_id.clone(),
            language_id: self.language_id.clone(),
            uri: self.uri.clone(),
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        }
    }
}

/// Owner of the job table.
///
/// All mutators warn and return `false` on unknown ids instead of panicking;
/// protocol bindings routinely race job queries against cleanup.
pub struct JobManager {
    jobs: RwLock<HashMap<String, Job>>,
    clock: SharedClock,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl JobManager {
    /// Create a manager using the given clock.
    pub fn new(clock: SharedClock) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            clock,
            sweeper: Mutex::new(None),
        })
    }

    /// Create a job in `pending` state, returning its generated id.
    pub fn create_job(
        &self,
        operation_id: &str,
        language_id: &str,
        uri: &str,
        correlation_id: &str,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let now = self.clock.now_utc();
        let job = Job {
            id: id.clone(),
            correlation_id: correlation_id.to_string(),
            operation_id: operation_id.to_string(),
            language_id: language_id.to_string(),
            uri: uri.to_string(),
            status: JobStatus::Pending,
            progress: 0,
            message: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            completed_instant: None,
        };
        self.jobs.write().unwrap().insert(id.clone(), job);
        tracing::debug!("created job {} for operation '{}'", id, operation_id);
        id
    }

    /// Move a job forward through the state machine.
    ///
    /// Invalid transitions (including anything out of a terminal state) are
    /// logged and refused.
    pub fn update_job_status(&self, job_id: &str, status: JobStatus) -> bool {
        self.with_job(job_id, "update status", |job, clock| {
            if job.status.is_terminal() {
                tracing::warn!(
                    "job {} already {:?}, ignoring status update to {:?}",
                    job.id,
                    job.status,
                    status
                );
                return false;
            }
            if !job.status.can_transition_to(status) {
                tracing::warn!(
                    "refusing status transition {:?} -> {:?} for job {}",
                    job.status,
                    status,
                    job.id
                );
                return false;
            }
            job.status = status;
            job.updated_at = clock.now_utc();
            if status.is_terminal() {
                job.completed_at = Some(job.updated_at);
                job.completed_instant = Some(clock.instant());
            }
            true
        })
    }

    /// Record progress, clamped into `[0, 100]`, with an optional message.
    /// Legal from any non-terminal state.
    pub fn update_job_progress(&self, job_id: &str, progress: i32, message: Option<String>) -> bool {
        self.with_job(job_id, "update progress", |job, clock| {
            if job.status.is_terminal() {
                tracing::warn!(
                    "ignoring progress update for job {} in terminal state {:?}",
                    job.id,
                    job.status
                );
                return false;
            }
            job.progress = progress.clamp(0, 100) as u8;
            if message.is_some() {
                job.message = message.clone();
            }
            job.updated_at = clock.now_utc();
            true
        })
    }

    /// Finish a running job successfully, storing its result.
    pub fn complete_job(&self, job_id: &str, result: Option<Value>) -> bool {
        self.finish(job_id, JobStatus::Completed, |job| {
            job.progress = 100;
            job.result = result.clone();
        })
    }

    /// Finish a running job with an error message.
    pub fn fail_job(&self, job_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        self.finish(job_id, JobStatus::Failed, |job| {
            job.error = Some(error.clone());
        })
    }

    /// Cancel a pending or running job.
    ///
    /// Returns `false` if the job is already terminal (or unknown); the
    /// handler, if running, is not interrupted.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.finish(job_id, JobStatus::Cancelled, |_| {})
    }

    /// Wire view of one job.
    pub fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.read().unwrap().get(job_id).map(Job::record)
    }

    /// Wire views of all jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .read()
            .unwrap()
            .values()
            .map(Job::record)
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        records
    }

    /// Number of tracked jobs.
    pub fn job_count(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    /// Remove terminal jobs whose completion is older than `retention`.
    /// Pending and running jobs are kept regardless of age.
    pub fn sweep_expired(&self, retention: Duration) -> usize {
        let now = self.clock.instant();
        let mut jobs = self.jobs.write().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| match job.completed_instant {
            Some(completed) => now.duration_since(completed) <= retention,
            None => true,
        });
        let removed = before - jobs.len();
        if removed > 0 {
            tracing::debug!("cleanup removed {} expired job(s)", removed);
        }
        removed
    }

    /// Start the periodic cleanup sweep. A previous sweeper, if any, is
    /// stopped first.
    ///
    /// The task holds only a weak reference, so dropping the last external
    /// handle to the manager also winds the sweep down.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, retention: Duration) {
        let weak: Weak<JobManager> = Arc::downgrade(self);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let handle = tokio::spawn(async move {
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep_expired(retention);
            }
        });

        let mut sweeper = self.sweeper.lock().unwrap();
        if let Some(previous) = sweeper.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the periodic cleanup sweep, if running.
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        apply: impl Fn(&mut Job),
    ) -> bool {
        self.with_job(job_id, "finish", |job, clock| {
            if job.status.is_terminal() {
                tracing::warn!(
                    "job {} already {:?}, ignoring transition to {:?}",
                    job.id,
                    job.status,
                    status
                );
                return false;
            }
            if !job.status.can_transition_to(status) {
                tracing::warn!(
                    "refusing status transition {:?} -> {:?} for job {}",
                    job.status,
                    status,
                    job.id
                );
                return false;
            }
            job.status = status;
            apply(job);
            job.updated_at = clock.now_utc();
            job.completed_at = Some(job.updated_at);
            job.completed_instant = Some(clock.instant());
            true
        })
    }

    fn with_job(
        &self,
        job_id: &str,
        action: &str,
        apply: impl FnOnce(&mut Job, &SharedClock) -> bool,
    ) -> bool {
        let mut jobs = self.jobs.write().unwrap();
        match jobs.get_mut(job_id) {
            Some(job) => apply(job, &self.clock),
            None => {
                tracing::warn!("cannot {} unknown job {}", action, job_id);
                false
            }
        }
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.job_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::clock::TestClock;
    use serde_json::json;

    fn manager() -> Arc<JobManager> {
        JobManager::new(TestClock::shared())
    }

    fn create(manager: &JobManager) -> String {
        manager.create_job("simulate", "statemachine", "model://m", "corr-1")
    }

    #[tokio::test]
    async fn test_create_job_starts_pending() {
        let manager = manager();
        let id = create(&manager);

        let record = manager.get_job(&id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.progress, 0);
        assert_eq!(record.correlation_id, "corr-1");
        assert!(record.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_progress_clamps_out_of_range_values() {
        let manager = manager();
        let id = create(&manager);
        manager.update_job_status(&id, JobStatus::Running);

        assert!(manager.update_job_progress(&id, -5, None));
        assert_eq!(manager.get_job(&id).unwrap().progress, 0);

        assert!(manager.update_job_progress(&id, 250, None));
        assert_eq!(manager.get_job(&id).unwrap().progress, 100);

        assert!(manager.update_job_progress(&id, 42, Some("halfway-ish".to_string())));
        let record = manager.get_job(&id).unwrap();
        assert_eq!(record.progress, 42);
        assert_eq!(record.message.as_deref(), Some("halfway-ish"));
    }

    #[tokio::test]
    async fn test_status_never_regresses() {
        let manager = manager();
        let id = create(&manager);

        assert!(manager.update_job_status(&id, JobStatus::Running));
        assert!(manager.complete_job(&id, Some(json!({"ok": true}))));

        // Terminal state absorbs everything afterwards
        assert!(!manager.update_job_status(&id, JobStatus::Running));
        assert!(!manager.update_job_progress(&id, 10, None));
        assert!(!manager.fail_job(&id, "too late"));

        let record = manager.get_job(&id).unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.progress, 100);
        assert!(record.error.is_none());
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let manager = manager();

        let pending = create(&manager);
        assert!(manager.cancel_job(&pending));
        assert_eq!(manager.get_job(&pending).unwrap().status, JobStatus::Cancelled);

        let running = create(&manager);
        manager.update_job_status(&running, JobStatus::Running);
        assert!(manager.cancel_job(&running));

        let completed = create(&manager);
        manager.update_job_status(&completed, JobStatus::Running);
        manager.complete_job(&completed, None);
        assert!(!manager.cancel_job(&completed));
        assert_eq!(manager.get_job(&completed).unwrap().status, JobStatus::Completed);

        let records = manager.list_jobs();
        assert_eq!(records.len(), 3);
        assert_eq!(manager.job_count(), 3);
    }

    #[tokio::test]
    async fn test_late_completion_after_cancel_is_noop() {
        let manager = manager();
        let id = create(&manager);
        manager.update_job_status(&id, JobStatus::Running);
        manager.cancel_job(&id);

        assert!(!manager.complete_job(&id, Some(json!("ignored"))));
        let record = manager.get_job(&id).unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(record.result.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_mutations_are_noops() {
        let manager = manager();
        assert!(!manager.update_job_status("missing", JobStatus::Running));
        assert!(!manager.update_job_progress("missing", 10, None));
        assert!(!manager.complete_job("missing", None));
        assert!(!manager.fail_job("missing", "oops"));
        assert!(!manager.cancel_job("missing"));
        assert!(manager.get_job("missing").is_none());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_sweep_removes_only_expired_terminal_jobs() {
        let manager = manager();

        let done = create(&manager);
        manager.update_job_status(&done, JobStatus::Running);
        manager.complete_job(&done, None);

        let stuck = create(&manager);
        manager.update_job_status(&stuck, JobStatus::Running);

        tokio::time::advance(Duration::from_secs(2 * 3600)).await;

        let removed = manager.sweep_expired(Duration::from_secs(3600));
        assert_eq!(removed, 1);
        assert!(manager.get_job(&done).is_none());
        // Running jobs survive regardless of age
        assert!(manager.get_job(&stuck).is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_fresh_terminal_jobs_survive_sweep() {
        let manager = manager();
        let id = create(&manager);
        manager.update_job_status(&id, JobStatus::Running);
        manager.complete_job(&id, None);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(manager.sweep_expired(Duration::from_secs(3600)), 0);
        assert!(manager.get_job(&id).is_some());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_spawn_cleanup_sweeps_periodically() {
        let manager = manager();
        manager.spawn_cleanup(Duration::from_secs(300), Duration::from_secs(3600));

        let id = create(&manager);
        manager.update_job_status(&id, JobStatus::Running);
        manager.complete_job(&id, None);

        // Not yet past the retention window
        tokio::time::advance(Duration::from_secs(1800)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(manager.get_job(&id).is_some());

        // Well past it; the next tick removes the job
        tokio::time::advance(Duration::from_secs(2100)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(manager.get_job(&id).is_none());

        manager.shutdown();
    }
}
