//! Worker pool for executing queued shell commands.
//!
//! A pool of N independent workers, each a poll loop:
//!
//! ```text
//! Worker
//!     │
//!     ├─► Queue.claim()            (atomic pending → processing)
//!     ├─► spawn `sh -c <command>`  (piped stdout/stderr, per-job timeout)
//!     └─► Queue.complete / Queue.fail
//! ```
//!
//! Workers share nothing but the store; cross-worker exclusivity comes from
//! the claim's guarded update. On shutdown the pool stops claiming but lets
//! every in-flight child process run to natural completion (success,
//! failure or timeout) before returning.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::job::Job;
use crate::queue::Queue;

/// Grace period between the termination signal and the forcible kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub count: usize,
    /// How long to wait when no jobs are available.
    pub poll_interval: Duration,
    /// Pause between consecutive executions on a busy worker.
    pub busy_pause: Duration,
    /// Age at which an orphaned `processing` job is returned to pending
    /// on startup.
    pub reaper_threshold: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            count: 4,
            poll_interval: Duration::from_secs(1),
            busy_pause: Duration::from_millis(100),
            reaper_threshold: Duration::from_secs(600),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a config with a specific worker count.
    pub fn with_count(count: usize) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }
}

/// Outcome of one execution attempt, before it is reported to the queue.
enum ExecutionOutcome {
    Completed { stdout: String, execution_time_ms: i64 },
    Failed { message: String },
    TimedOut { seconds: i64 },
}

/// A pool of workers polling the queue until shutdown.
pub struct WorkerPool {
    queue: Arc<Queue>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self {
            queue,
            config: WorkerPoolConfig::default(),
        }
    }

    pub fn with_config(queue: Arc<Queue>, config: WorkerPoolConfig) -> Self {
        Self { queue, config }
    }

    /// Run until `shutdown` is cancelled and every in-flight job finished.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let requeued = self.queue.requeue_stale(self.config.reaper_threshold).await?;
        if requeued > 0 {
            info!(count = requeued, "requeued stale processing jobs");
        }

        info!(count = self.config.count, "worker pool starting");

        let mut handles = Vec::with_capacity(self.config.count);
        for _ in 0..self.config.count {
            let worker = Worker {
                id: format!("worker-{}", Uuid::new_v4()),
                queue: Arc::clone(&self.queue),
                poll_interval: self.config.poll_interval,
                busy_pause: self.config.busy_pause,
            };
            handles.push(tokio::spawn(worker.run(shutdown.clone())));
        }

        join_all(handles).await;

        info!("worker pool stopped");
        Ok(())
    }
}

/// One worker: claims, executes and reports, one job at a time.
struct Worker {
    id: String,
    queue: Arc<Queue>,
    poll_interval: Duration,
    busy_pause: Duration,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "worker starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.queue.claim().await {
                Ok(Some(job)) => {
                    self.process(job).await;
                    tokio::time::sleep(self.busy_pause).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    async fn process(&self, job: Job) {
        let job_id = job.id.clone();
        debug!(worker_id = %self.id, job_id = %job_id, command = %job.command, "executing job");

        let report = match execute(&job).await {
            ExecutionOutcome::Completed {
                stdout,
                execution_time_ms,
            } => {
                debug!(job_id = %job_id, execution_time_ms, "job succeeded");
                self.queue.complete(&job_id, &stdout, execution_time_ms).await
            }
            ExecutionOutcome::Failed { message } => {
                warn!(job_id = %job_id, error = %message, "job failed");
                self.queue.fail(&job_id, &message).await
            }
            ExecutionOutcome::TimedOut { seconds } => {
                warn!(job_id = %job_id, seconds, "job timed out");
                self.queue
                    .fail(&job_id, &format!("Job timed out after {seconds} seconds"))
                    .await
            }
        };

        // A reporting error must not kill the worker; the job stays in
        // processing until the startup reaper returns it.
        if let Err(e) = report {
            error!(job_id = %job_id, error = %e, "failed to report job outcome");
        }
    }
}

/// Run the job's command through the shell, enforcing its timeout.
async fn execute(job: &Job) -> ExecutionOutcome {
    let mut cmd = shell_command(&job.command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionOutcome::Failed {
                message: format!("Failed to spawn command: {e}"),
            }
        }
    };

    // Drain the pipes concurrently so a chatty child never blocks on a
    // full pipe buffer while we wait on it.
    let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
    let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

    let timeout = Duration::from_secs(job.timeout_seconds.max(0) as u64);
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            terminate(&mut child).await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            return ExecutionOutcome::TimedOut {
                seconds: job.timeout_seconds,
            };
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    let execution_time_ms = started.elapsed().as_millis() as i64;

    match status {
        Ok(status) if status.success() => ExecutionOutcome::Completed {
            stdout,
            execution_time_ms,
        },
        Ok(status) => {
            let message = if stderr.trim().is_empty() {
                format!("Command failed with exit code {}", status.code().unwrap_or(-1))
            } else {
                stderr
            };
            ExecutionOutcome::Failed { message }
        }
        Err(e) => ExecutionOutcome::Failed {
            message: format!("Failed to wait on command: {e}"),
        },
    }
}

/// The raw command string goes to the host shell unmodified, so pipes,
/// redirections and globs work.
#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

async fn read_stream<R>(stream: Option<R>) -> String
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = String::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_string(&mut buf).await;
    }
    buf
}

/// Graceful stop: termination signal first, forcible kill after the grace
/// period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("child ignored termination signal, killing");
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill timed out child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.count, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.busy_pause, Duration::from_millis(100));
    }

    #[test]
    fn config_with_count_keeps_other_defaults() {
        let config = WorkerPoolConfig::with_count(2);
        assert_eq!(config.count, 2);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }
}
