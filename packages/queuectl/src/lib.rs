//! Durable background-job queue over a single SQLite file.
//!
//! QueueCtl executes shell commands in the background with retries,
//! exponential backoff, a dead-letter queue, priority and scheduled
//! execution — without a broker.
//!
//! # Architecture
//!
//! ```text
//! CLI / API
//!     │
//!     └─► Queue.enqueue ──► SqliteStore (jobs table)
//!
//! WorkerPool (N workers)
//!     │
//!     ├─► Queue.claim          (atomic pending → processing)
//!     ├─► spawn `sh -c <cmd>`  (timeout, output capture)
//!     └─► Queue.complete / Queue.fail (retry schedule or DLQ)
//!
//! Dashboard ──► Queue.stats / Queue.list (read only)
//! ```
//!
//! Every state transition goes through [`Queue`]; workers and the dashboard
//! never write to the store directly. The only cross-worker coordination is
//! the store's conditional update inside [`Queue::claim`], which guarantees
//! at-most-one concurrent execution per job.

mod dashboard;
mod error;
mod job;
mod queue;
mod retry;
mod store;
mod worker;

pub use dashboard::{router as dashboard_router, serve as serve_dashboard};
pub use error::{QueueError, Result};
pub use job::{
    DeadLetterEntry, Job, JobState, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES,
    DEFAULT_TIMEOUT_SECONDS,
};
pub use queue::{
    EnqueueRequest, Queue, QueueMetrics, QueueStats, CONFIG_BACKOFF_BASE, CONFIG_MAX_RETRIES,
    CONFIG_WORKER_TIMEOUT,
};
pub use retry::backoff_delay;
pub use store::SqliteStore;
pub use worker::{WorkerPool, WorkerPoolConfig};
