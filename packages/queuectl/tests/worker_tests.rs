//! Worker pool tests against real shell child processes.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use queuectl::{
    EnqueueRequest, Job, JobState, Queue, QueueError, SqliteStore, WorkerPool, WorkerPoolConfig,
};
use tokio_util::sync::CancellationToken;

async fn memory_queue() -> Queue {
    Queue::new(SqliteStore::in_memory().await.unwrap())
}

fn start_pool(queue: &Queue, count: usize) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::with_config(
        Arc::new(queue.clone()),
        WorkerPoolConfig::with_count(count),
    );
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        pool.run(token).await.unwrap();
    });
    (shutdown, handle)
}

/// Poll until the job satisfies `pred`, or panic after `timeout`.
async fn wait_until(
    queue: &Queue,
    id: &str,
    timeout: Duration,
    pred: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match queue.get(id).await {
            Ok(job) if pred(&job) => return job,
            Ok(_) | Err(QueueError::JobNotFound { .. }) => {}
            Err(e) => panic!("queue error while waiting for {id}: {e}"),
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {id}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn worker_completes_an_echo_job() {
    let queue = memory_queue().await;
    let job = queue
        .enqueue(EnqueueRequest::builder().command("echo hi").build())
        .await
        .unwrap();

    let (shutdown, handle) = start_pool(&queue, 1);

    let done = wait_until(&queue, &job.id, Duration::from_secs(10), |j| {
        j.state == JobState::Completed
    })
    .await;

    assert!(done.output.unwrap().contains("hi"));
    assert!(done.execution_time_ms.unwrap() >= 0);
    assert!(done.completed_at.is_some());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn worker_records_the_exit_code_of_a_failing_command() {
    let queue = memory_queue().await;
    let job = queue
        .enqueue(
            EnqueueRequest::builder()
                .command("exit 7")
                .max_retries(3)
                .build(),
        )
        .await
        .unwrap();

    let (shutdown, handle) = start_pool(&queue, 1);

    let failed = wait_until(&queue, &job.id, Duration::from_secs(10), |j| {
        j.attempts == 1 && j.state == JobState::Pending
    })
    .await;

    assert_eq!(
        failed.error_message.as_deref(),
        Some("Command failed with exit code 7")
    );
    assert!(failed.next_retry_at.is_some());

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn worker_prefers_stderr_over_the_canonical_message() {
    let queue = memory_queue().await;
    let job = queue
        .enqueue(
            EnqueueRequest::builder()
                .command("echo oops >&2; exit 3")
                .build(),
        )
        .await
        .unwrap();

    let (shutdown, handle) = start_pool(&queue, 1);

    let failed = wait_until(&queue, &job.id, Duration::from_secs(10), |j| j.attempts == 1).await;
    assert!(failed.error_message.unwrap().contains("oops"));

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn worker_times_out_a_long_running_job() {
    let queue = memory_queue().await;
    let job = queue
        .enqueue(
            EnqueueRequest::builder()
                .command("sleep 30")
                .timeout_seconds(1)
                .build(),
        )
        .await
        .unwrap();

    let (shutdown, handle) = start_pool(&queue, 1);

    // Claim ≤ 1s poll + 1s timeout + prompt SIGTERM: well inside 8s.
    let failed = wait_until(&queue, &job.id, Duration::from_secs(8), |j| j.attempts == 1).await;
    assert_eq!(
        failed.error_message.as_deref(),
        Some("Job timed out after 1 seconds")
    );

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_the_in_flight_job() {
    let queue = memory_queue().await;
    let job = queue
        .enqueue(EnqueueRequest::builder().command("sleep 1; echo done").build())
        .await
        .unwrap();

    let (shutdown, handle) = start_pool(&queue, 1);

    wait_until(&queue, &job.id, Duration::from_secs(5), |j| {
        j.state == JobState::Processing
    })
    .await;

    // Cancel mid-execution: the pool must finish the child before returning.
    shutdown.cancel();
    handle.await.unwrap();

    let done = queue.get(&job.id).await.unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert!(done.output.unwrap().contains("done"));
}

#[tokio::test]
async fn two_workers_process_both_jobs() {
    let queue = memory_queue().await;
    let a = queue
        .enqueue(EnqueueRequest::builder().command("echo a").build())
        .await
        .unwrap();
    let b = queue
        .enqueue(EnqueueRequest::builder().command("echo b").build())
        .await
        .unwrap();

    let (shutdown, handle) = start_pool(&queue, 2);

    for job in [&a, &b] {
        wait_until(&queue, &job.id, Duration::from_secs(10), |j| {
            j.state == JobState::Completed
        })
        .await;
    }

    shutdown.cancel();
    handle.await.unwrap();
}
