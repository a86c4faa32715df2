//! In-memory queue backend.
//!
//! Keeps the same logical layout as the store-backed queue: a record map plus
//! per-queue ordered sets of (score, member), ties broken by member. Jobs are
//! held as encoded record bytes so orphan and round-trip behavior matches the
//! Redis backend. Intended for tests and local development.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    job_key, queue_key, AckOptions, BulkQueue, DequeueOptions, EnqueueOptions, MetricsExporter,
    Queue, QueueMetricsOptions,
};
use crate::error::BobbinError;
use crate::job::Job;
use crate::observability::QueueMetrics;

#[derive(Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    by_score: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn add(&mut self, score: i64, member: &str) {
        if let Some(prev) = self.scores.insert(member.to_string(), score) {
            self.by_score.remove(&(prev, member.to_string()));
        }
        self.by_score.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) {
        if let Some(score) = self.scores.remove(member) {
            self.by_score.remove(&(score, member.to_string()));
        }
    }

    fn len(&self) -> usize {
        self.by_score.len()
    }

    /// Members with score <= max, smallest first.
    fn ready(&self, max: i64, count: usize) -> Vec<String> {
        self.by_score
            .iter()
            .take_while(|(score, _)| *score <= max)
            .take(count)
            .map(|(_, member)| member.clone())
            .collect()
    }
}

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, Vec<u8>>,
    queues: HashMap<String, SortedSet>,
}

/// In-memory queue. All operations take one lock, which also gives the
/// claim-and-bump atomicity the protocol requires.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn take_jobs(&self, count: usize, opt: &DequeueOptions) -> Result<Vec<Job>, BobbinError> {
        let mut state = self.state.lock().await;
        let MemoryState { records, queues } = &mut *state;

        let Some(set) = queues.get_mut(&queue_key(&opt.namespace, &opt.queue_id)) else {
            return Err(BobbinError::EmptyQueue);
        };

        let at = opt.at.timestamp();
        let mut jobs = Vec::new();
        for member in set.ready(at, count) {
            match records.get(&member) {
                // Stale index entry: the record was deleted out from under us.
                None => set.remove(&member),
                Some(bytes) => {
                    let job = Job::decode(bytes)?;
                    set.add(at + opt.invisible_sec, &member);
                    jobs.push(job);
                }
            }
        }

        if jobs.is_empty() {
            return Err(BobbinError::EmptyQueue);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, job: &Job, opt: &EnqueueOptions) -> Result<(), BobbinError> {
        let bytes = job.encode()?;
        let member = job_key(&opt.namespace, &job.id);

        let mut state = self.state.lock().await;
        state.records.insert(member.clone(), bytes);
        state
            .queues
            .entry(queue_key(&opt.namespace, &opt.queue_id))
            .or_default()
            .add(job.enqueued_at.timestamp(), &member);
        Ok(())
    }

    async fn dequeue(&self, opt: &DequeueOptions) -> Result<Job, BobbinError> {
        let mut jobs = self.take_jobs(1, opt).await?;
        Ok(jobs.remove(0))
    }

    async fn ack(&self, job: &Job, opt: &AckOptions) -> Result<(), BobbinError> {
        let member = job_key(&opt.namespace, &job.id);

        let mut state = self.state.lock().await;
        if let Some(set) = state.queues.get_mut(&queue_key(&opt.namespace, &opt.queue_id)) {
            set.remove(&member);
        }
        state.records.remove(&member);
        Ok(())
    }

    fn as_bulk(&self) -> Option<&dyn BulkQueue> {
        Some(self)
    }

    fn as_metrics_exporter(&self) -> Option<&dyn MetricsExporter> {
        Some(self)
    }
}

#[async_trait]
impl BulkQueue for MemoryQueue {
    async fn bulk_dequeue(
        &self,
        count: usize,
        opt: &DequeueOptions,
    ) -> Result<Vec<Job>, BobbinError> {
        self.take_jobs(count, opt).await
    }

    async fn bulk_ack(&self, jobs: &[Job], opt: &AckOptions) -> Result<(), BobbinError> {
        for job in jobs {
            self.ack(job, opt).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsExporter for MemoryQueue {
    async fn queue_metrics(&self, opt: &QueueMetricsOptions) -> Result<QueueMetrics, BobbinError> {
        let state = self.state.lock().await;

        let (ready, total) = match state.queues.get(&queue_key(&opt.namespace, &opt.queue_id)) {
            None => (0, 0),
            Some(set) => {
                let at = opt.at.timestamp();
                let ready = set
                    .by_score
                    .iter()
                    .take_while(|(score, _)| *score <= at)
                    .count();
                (ready, set.len())
            }
        };

        Ok(QueueMetrics {
            namespace: opt.namespace.clone(),
            queue_id: opt.queue_id.clone(),
            ready_total: ready as i64,
            scheduled_total: (total - ready) as i64,
        })
    }
}
