//! Queue operations over the SQLite store.
//!
//! All job mutations go through this layer; workers and the dashboard never
//! touch the store directly, so the state-machine invariants are enforced in
//! one place. Cross-worker exclusivity hangs off a single linearization
//! point: the guarded `UPDATE ... WHERE state = 'pending'` in [`Queue::claim`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, warn};
use typed_builder::TypedBuilder;

use crate::error::{QueueError, Result};
use crate::job::{DeadLetterEntry, Job, JobState, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECONDS};
use crate::retry;
use crate::store::SqliteStore;

/// Recognized config keys. Unknown keys are stored but never consulted.
pub const CONFIG_MAX_RETRIES: &str = "max_retries";
pub const CONFIG_BACKOFF_BASE: &str = "backoff_base";
pub const CONFIG_WORKER_TIMEOUT: &str = "worker_timeout";

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, priority, timeout_seconds, \
     run_at, next_retry_at, error_message, output, execution_time_ms, \
     started_at, completed_at, created_at, updated_at";

const DLQ_COLUMNS: &str =
    "id, command, attempts, max_retries, error_message, created_at, failed_at";

// ============================================================================
// Request / result types
// ============================================================================

/// Parameters for a new job.
///
/// Unset fields fall back to config-backed defaults at enqueue time.
#[derive(Debug, Clone, Deserialize, TypedBuilder)]
pub struct EnqueueRequest {
    #[builder(setter(into))]
    pub command: String,

    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub id: Option<String>,

    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub priority: Option<i64>,

    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub timeout_seconds: Option<i64>,

    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i32>,

    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub run_at: Option<DateTime<Utc>>,
}

/// Per-state job counts.
///
/// `dead` counts the DLQ table; `failed` is almost always zero because a
/// failed job immediately re-enters pending or migrates to the DLQ.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub dead: i64,
}

/// Derived execution statistics for operator surfaces.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueMetrics {
    /// Completed jobs over the queue's lifetime (main table).
    pub total_completed: i64,
    /// Average wall-clock time of the 100 most recent completed jobs.
    pub avg_execution_time_ms: f64,
    /// completed / (completed + failures), as an integer percent.
    pub success_rate: i64,
}

// ============================================================================
// Queue
// ============================================================================

/// The invariant-preserving layer between callers and the store.
#[derive(Clone)]
pub struct Queue {
    store: SqliteStore,
}

impl Queue {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    // ------------------------------------------------------------------
    // Lifecycle operations
    // ------------------------------------------------------------------

    /// Persist a new pending job.
    ///
    /// Duplicate ids surface the store's uniqueness error; enqueue is not
    /// idempotent.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<Job> {
        if request.command.trim().is_empty() {
            return Err(QueueError::invalid("command must not be empty"));
        }
        if let Some(t) = request.timeout_seconds {
            if t <= 0 {
                return Err(QueueError::invalid("timeout_seconds must be positive"));
            }
        }
        if let Some(r) = request.max_retries {
            if r < 0 {
                return Err(QueueError::invalid("max_retries must not be negative"));
            }
        }

        let max_retries = match request.max_retries {
            Some(v) => v,
            None => self.max_retries().await?,
        };
        let timeout_seconds = match request.timeout_seconds {
            Some(v) => v,
            None => self.worker_timeout().await?,
        };

        let mut job = Job::new(request.command);
        if let Some(id) = request.id {
            job.id = id;
        }
        job.priority = request.priority.unwrap_or(0);
        job.max_retries = max_retries;
        job.timeout_seconds = timeout_seconds;
        job.run_at = request.run_at;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, priority, timeout_seconds,
                run_at, next_retry_at, error_message, output, execution_time_ms,
                started_at, completed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state)
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.timeout_seconds)
        .bind(job.run_at)
        .bind(job.next_retry_at)
        .bind(&job.error_message)
        .bind(&job.output)
        .bind(job.execution_time_ms)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(self.pool())
        .await?;

        debug!(job_id = %job.id, priority = job.priority, "enqueued job");
        Ok(job)
    }

    /// Atomically claim the best eligible pending job, if any.
    ///
    /// The snapshot select picks `priority DESC, created_at ASC` among jobs
    /// whose `run_at`/`next_retry_at` gates have passed; the guarded update
    /// is the linearization point. Losing the race to another worker returns
    /// `None` and the caller polls again.
    pub async fn claim(&self) -> Result<Option<Job>> {
        let now = Utc::now();

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'pending' \
               AND (run_at IS NULL OR run_at <= ?) \
               AND (next_retry_at IS NULL OR next_retry_at <= ?) \
             ORDER BY priority DESC, created_at ASC \
             LIMIT 1"
        );
        let candidate = sqlx::query_as::<_, Job>(&sql)
            .bind(now)
            .bind(now)
            .fetch_optional(self.pool())
            .await?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let updated = sqlx::query(
            "UPDATE jobs SET state = 'processing', started_at = ?, updated_at = ? \
             WHERE id = ? AND state = 'pending'",
        )
        .bind(now)
        .bind(now)
        .bind(&candidate.id)
        .execute(self.pool())
        .await?;

        if updated.rows_affected() == 0 {
            debug!(job_id = %candidate.id, "lost claim race");
            return Ok(None);
        }

        self.get(&candidate.id).await.map(Some)
    }

    /// Record a successful run.
    pub async fn complete(&self, id: &str, output: &str, execution_time_ms: i64) -> Result<()> {
        let job = self.get(id).await?;
        if job.state != JobState::Processing {
            warn!(job_id = %id, state = %job.state, "completing a job that was not processing");
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE jobs SET state = 'completed', output = ?, execution_time_ms = ?, \
             completed_at = ?, error_message = NULL, next_retry_at = NULL, updated_at = ? \
             WHERE id = ?",
        )
        .bind(output)
        .bind(execution_time_ms)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Record a failed attempt: schedule a retry with exponential backoff,
    /// or migrate to the dead letter queue once retries are exhausted.
    ///
    /// Both branches commit in a single transaction, so the transient
    /// `failed` state is never observable and the DLQ migration is all or
    /// nothing.
    pub async fn fail(&self, id: &str, error_message: &str) -> Result<()> {
        let base = self.backoff_base().await?;

        let mut tx = self.pool().begin().await?;

        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        let job = sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QueueError::JobNotFound { id: id.to_string() })?;

        let now = Utc::now();
        let attempts = job.attempts + 1;

        if job.can_retry() {
            let delay = retry::backoff_delay(attempts, base);
            let next_retry_at = now + chrono::Duration::from_std(delay).unwrap_or_default();

            sqlx::query(
                "UPDATE jobs SET state = 'pending', attempts = ?, error_message = ?, \
                 next_retry_at = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(attempts)
            .bind(error_message)
            .bind(next_retry_at)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            debug!(job_id = %id, attempts, next_retry_at = %next_retry_at, "scheduled retry");
        } else {
            sqlx::query(
                "INSERT INTO dead_letter_queue \
                 (id, command, attempts, max_retries, error_message, created_at, failed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&job.id)
            .bind(&job.command)
            .bind(attempts)
            .bind(job.max_retries)
            .bind(error_message)
            .bind(job.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            warn!(job_id = %id, attempts, "retries exhausted, job dead lettered");
        }

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read operations
    // ------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> Result<Job> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?");
        sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| QueueError::JobNotFound { id: id.to_string() })
    }

    /// Most recent jobs, optionally filtered by state.
    pub async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>> {
        let jobs = match state {
            Some(state) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ? \
                     ORDER BY created_at DESC LIMIT ?"
                );
                sqlx::query_as::<_, Job>(&sql)
                    .bind(state)
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
            None => {
                let sql =
                    format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT ?");
                sqlx::query_as::<_, Job>(&sql)
                    .bind(limit)
                    .fetch_all(self.pool())
                    .await?
            }
        };
        Ok(jobs)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(self.pool())
                .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            match state.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "dead" => stats.dead += count,
                _ => {}
            }
        }

        let dlq: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_queue")
            .fetch_one(self.pool())
            .await?;
        stats.dead += dlq;

        Ok(stats)
    }

    /// Derived metrics for the dashboard and the `metrics` command.
    pub async fn metrics(&self) -> Result<QueueMetrics> {
        let stats = self.stats().await?;

        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(execution_time_ms) FROM ( \
                 SELECT execution_time_ms FROM jobs \
                 WHERE state = 'completed' AND execution_time_ms IS NOT NULL \
                 ORDER BY completed_at DESC LIMIT 100 \
             )",
        )
        .fetch_one(self.pool())
        .await?;

        let failures = stats.failed + stats.dead;
        let success_rate = if stats.completed + failures == 0 {
            100
        } else {
            stats.completed * 100 / (stats.completed + failures)
        };

        Ok(QueueMetrics {
            total_completed: stats.completed,
            avg_execution_time_ms: avg.unwrap_or(0.0),
            success_rate,
        })
    }

    // ------------------------------------------------------------------
    // Dead letter queue
    // ------------------------------------------------------------------

    pub async fn get_dlq(&self, limit: i64) -> Result<Vec<DeadLetterEntry>> {
        let sql = format!(
            "SELECT {DLQ_COLUMNS} FROM dead_letter_queue ORDER BY failed_at DESC LIMIT ?"
        );
        let entries = sqlx::query_as::<_, DeadLetterEntry>(&sql)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(entries)
    }

    /// Move a dead letter entry back to the main table as a fresh pending
    /// job: attempts reset to zero, id and command preserved.
    pub async fn retry_dead(&self, id: &str) -> Result<Job> {
        let timeout_seconds = self.worker_timeout().await?;

        let mut tx = self.pool().begin().await?;

        let sql = format!("SELECT {DLQ_COLUMNS} FROM dead_letter_queue WHERE id = ?");
        let entry = sqlx::query_as::<_, DeadLetterEntry>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| QueueError::DlqNotFound { id: id.to_string() })?;

        let now = Utc::now();
        let mut job = Job::new(entry.command);
        job.id = entry.id;
        job.max_retries = entry.max_retries;
        job.timeout_seconds = timeout_seconds;
        job.created_at = now;
        job.updated_at = now;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, priority, timeout_seconds,
                run_at, next_retry_at, error_message, output, execution_time_ms,
                started_at, completed_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state)
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.timeout_seconds)
        .bind(job.run_at)
        .bind(job.next_retry_at)
        .bind(&job.error_message)
        .bind(&job.output)
        .bind(job.execution_time_ms)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM dead_letter_queue WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(job_id = %job.id, "revived dead letter entry");
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Crash recovery
    // ------------------------------------------------------------------

    /// Return `processing` jobs whose worker died to `pending`.
    ///
    /// Only rows whose `started_at` is older than `threshold` are touched,
    /// so live executions on other processes keep their claim. Requeuing
    /// does not count as an attempt: the attempt never reported an outcome.
    pub async fn requeue_stale(&self, threshold: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(threshold).unwrap_or_default();

        let result = sqlx::query(
            "UPDATE jobs SET state = 'pending', started_at = NULL, updated_at = ? \
             WHERE state = 'processing' AND started_at IS NOT NULL AND started_at <= ?",
        )
        .bind(now)
        .bind(cutoff)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        Ok(value)
    }

    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn all_config(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM config ORDER BY key")
                .fetch_all(self.pool())
                .await?;
        Ok(rows)
    }

    /// Retry ceiling applied to jobs enqueued without an explicit value.
    pub async fn max_retries(&self) -> Result<i32> {
        self.typed_config(CONFIG_MAX_RETRIES, DEFAULT_MAX_RETRIES).await
    }

    /// Base of the exponential backoff.
    pub async fn backoff_base(&self) -> Result<u32> {
        self.typed_config(CONFIG_BACKOFF_BASE, DEFAULT_BACKOFF_BASE).await
    }

    /// Per-attempt timeout applied to jobs enqueued without an explicit value.
    pub async fn worker_timeout(&self) -> Result<i64> {
        self.typed_config(CONFIG_WORKER_TIMEOUT, DEFAULT_TIMEOUT_SECONDS).await
    }

    /// Best-effort typed read: missing or unparseable values fall back to
    /// the documented default.
    async fn typed_config<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr + Copy,
    {
        match self.get_config(key).await? {
            Some(raw) => match raw.parse::<T>() {
                Ok(value) => Ok(value),
                Err(_) => {
                    warn!(key, value = %raw, "unparseable config value, using default");
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_request_builder_defaults_to_no_overrides() {
        let request = EnqueueRequest::builder().command("echo hi").build();
        assert_eq!(request.command, "echo hi");
        assert!(request.id.is_none());
        assert!(request.priority.is_none());
        assert!(request.run_at.is_none());
    }

    #[test]
    fn enqueue_request_deserializes_from_json() {
        let request: EnqueueRequest =
            serde_json::from_str(r#"{"command": "echo hi", "priority": 5}"#).unwrap();
        assert_eq!(request.command, "echo hi");
        assert_eq!(request.priority, Some(5));
        assert!(request.max_retries.is_none());
    }
}
