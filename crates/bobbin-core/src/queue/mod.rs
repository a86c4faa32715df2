//! Queue port and its backends.
//!
//! A queue is addressed by (namespace, queue_id). The store holds one record
//! per job plus an ordered set of record keys scored by the instant (seconds
//! since epoch) at which each job becomes eligible. The set is authoritative
//! for membership; a record without a set entry is not in the queue.

mod memory;
mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BobbinError;
use crate::job::Job;
use crate::observability::QueueMetrics;

#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub namespace: String,
    pub queue_id: String,
}

#[derive(Debug, Clone)]
pub struct DequeueOptions {
    pub namespace: String,
    pub queue_id: String,
    /// Jobs scored after this instant are not eligible.
    pub at: DateTime<Utc>,
    /// Seconds the dequeued job stays hidden from other workers.
    pub invisible_sec: i64,
}

#[derive(Debug, Clone)]
pub struct AckOptions {
    pub namespace: String,
    pub queue_id: String,
}

#[derive(Debug, Clone)]
pub struct QueueMetricsOptions {
    pub namespace: String,
    pub queue_id: String,
    pub at: DateTime<Utc>,
}

pub fn job_key(namespace: &str, job_id: &str) -> String {
    format!("{namespace}:job:{job_id}")
}

pub fn queue_key(namespace: &str, queue_id: &str) -> String {
    format!("{namespace}:queue:{queue_id}")
}

/// Queue port. This trait is the seam between the worker runtime and the
/// store; the worker never talks to the store directly.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Persists the job record and scores the index entry with
    /// `job.enqueued_at` in seconds. Idempotent keyed by `job.id`:
    /// re-enqueueing refreshes the record and the score together.
    async fn enqueue(&self, job: &Job, opt: &EnqueueOptions) -> Result<(), BobbinError>;

    /// Claims the eligible job with the smallest score: bumps its score to
    /// `at + invisible_sec` and returns the decoded record. Select, bump and
    /// fetch are atomic, so concurrent workers never claim the same job.
    ///
    /// Fails with `EmptyQueue` when nothing is eligible. A selected entry
    /// whose record is gone is removed from the index and also reported as
    /// `EmptyQueue` (one attempt per call; the caller retries).
    async fn dequeue(&self, opt: &DequeueOptions) -> Result<Job, BobbinError>;

    /// Removes the index entry and deletes the record. Acking a job that is
    /// already gone succeeds.
    async fn ack(&self, job: &Job, opt: &AckOptions) -> Result<(), BobbinError>;

    /// Bulk capability, when the backend has one.
    fn as_bulk(&self) -> Option<&dyn BulkQueue> {
        None
    }

    /// Metrics capability, when the backend has one.
    fn as_metrics_exporter(&self) -> Option<&dyn MetricsExporter> {
        None
    }
}

/// Batched claim and acknowledgement in a single store round-trip.
#[async_trait]
pub trait BulkQueue: Send + Sync {
    /// Like `dequeue` for up to `count` jobs. An empty result is reported as
    /// `EmptyQueue`.
    async fn bulk_dequeue(&self, count: usize, opt: &DequeueOptions)
        -> Result<Vec<Job>, BobbinError>;

    async fn bulk_ack(&self, jobs: &[Job], opt: &AckOptions) -> Result<(), BobbinError>;
}

#[async_trait]
pub trait MetricsExporter: Send + Sync {
    async fn queue_metrics(&self, opt: &QueueMetricsOptions) -> Result<QueueMetrics, BobbinError>;
}
