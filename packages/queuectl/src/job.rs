//! Job model for background command execution.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::QueueError;
use crate::retry;

/// Default retry ceiling for new jobs.
pub const DEFAULT_MAX_RETRIES: i32 = 3;
/// Default per-attempt wall-clock limit in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: i64 = 300;
/// Default exponential backoff base.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::invalid(format!("unknown state: {other}"))),
        }
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// A unit of work: one shell command with its lifecycle state.
///
/// Values of this type are snapshots; all persisted transitions go through
/// [`crate::queue::Queue`] so the state-machine invariants live in one place.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,

    // Retry accounting
    pub attempts: i32,
    pub max_retries: i32,

    // Scheduling
    pub priority: i64,
    pub timeout_seconds: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,

    // Outcome of the most recent attempt
    pub error_message: Option<String>,
    pub output: Option<String>,
    pub execution_time_ms: Option<i64>,

    // Timestamps
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job for a command.
    pub fn new(command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            priority: 0,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            run_at: None,
            next_retry_at: None,
            error_message: None,
            output: None,
            execution_time_ms: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether another execution attempt is allowed after the next failure.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_retries
    }

    /// Backoff delay for the current attempt count.
    pub fn retry_delay(&self, base: u32) -> Duration {
        retry::backoff_delay(self.attempts, base)
    }

    /// Flip the in-memory value to processing.
    pub fn mark_processing(&mut self) {
        self.state = JobState::Processing;
        self.started_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Record a successful run on the in-memory value.
    pub fn mark_completed(&mut self, output: impl Into<String>, execution_time_ms: i64) {
        self.state = JobState::Completed;
        self.output = Some(output.into());
        self.execution_time_ms = Some(execution_time_ms);
        self.completed_at = Some(Utc::now());
        self.error_message = None;
        self.next_retry_at = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt on the in-memory value.
    pub fn mark_failed(&mut self, error_message: impl Into<String>) {
        self.state = JobState::Failed;
        self.attempts += 1;
        self.error_message = Some(error_message.into());
        self.updated_at = Utc::now();
    }

    /// Mark the in-memory value as terminally dead.
    pub fn mark_dead(&mut self) {
        self.state = JobState::Dead;
        self.updated_at = Utc::now();
    }

    /// Re-enter pending with a retry visible after `delay`.
    pub fn schedule_retry(&mut self, delay: Duration) {
        self.state = JobState::Pending;
        self.next_retry_at = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// DLQ entry
// ============================================================================

/// Reduced snapshot of a job that exhausted its retries.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: String,
    pub command: String,
    pub attempts: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new("echo hi")
    }

    #[test]
    fn new_job_starts_pending_with_zero_attempts() {
        let job = sample_job();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn new_job_has_default_max_retries_of_3() {
        let job = sample_job();
        assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn can_retry_until_max_retries_reached() {
        let mut job = sample_job();
        job.max_retries = 2;
        assert!(job.can_retry());
        job.attempts = 1;
        assert!(job.can_retry());
        job.attempts = 2;
        assert!(!job.can_retry());
    }

    #[test]
    fn retry_delay_grows_exponentially() {
        let mut job = sample_job();
        assert_eq!(job.retry_delay(2), Duration::from_secs(1));
        job.attempts = 3;
        assert_eq!(job.retry_delay(2), Duration::from_secs(8));
    }

    #[test]
    fn mark_failed_increments_attempts() {
        let mut job = sample_job();
        job.mark_failed("boom");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn mark_completed_clears_failure_fields() {
        let mut job = sample_job();
        job.mark_failed("boom");
        job.schedule_retry(Duration::from_secs(1));
        job.mark_completed("hi\n", 12);
        assert_eq!(job.state, JobState::Completed);
        assert!(job.error_message.is_none());
        assert!(job.next_retry_at.is_none());
        assert_eq!(job.execution_time_ms, Some(12));
    }

    #[test]
    fn schedule_retry_moves_next_retry_forward() {
        let mut job = sample_job();
        job.schedule_retry(Duration::from_secs(4));
        let at = job.next_retry_at.expect("retry scheduled");
        assert!(at > Utc::now() + chrono::Duration::seconds(2));
    }

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Dead,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }
}
