//! Redis queue backend.
//!
//! Job records are one-field hashes (`msgpack` -> encoded job) keyed
//! `<ns>:job:<id>`; the queue index `<ns>:queue:<queue_id>` is a sorted set
//! of record keys scored by eligibility seconds. Claiming runs as a single
//! server-side script: select, drop stale entries, bump scores, fetch
//! payloads. Two workers can therefore never claim the same job.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use super::{
    job_key, queue_key, AckOptions, BulkQueue, DequeueOptions, EnqueueOptions, MetricsExporter,
    Queue, QueueMetricsOptions,
};
use crate::error::BobbinError;
use crate::job::Job;
use crate::observability::QueueMetrics;

// KEYS[1] job record, KEYS[2] queue index; ARGV[1] score, ARGV[2] payload.
const ENQUEUE_SCRIPT: &str = r#"
redis.call('hset', KEYS[1], 'msgpack', ARGV[2])
redis.call('zadd', KEYS[2], ARGV[1], KEYS[1])
return redis.status_reply('OK')
"#;

// KEYS[1] queue index; ARGV[1] at, ARGV[2] invisible seconds, ARGV[3] count.
// Entries without a record are stale and get dropped instead of returned.
const DEQUEUE_SCRIPT: &str = r#"
local ready = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1], 'limit', 0, ARGV[3])
local jobs = {}
for i = 1, #ready do
    local payload = redis.call('hget', ready[i], 'msgpack')
    if payload == false then
        redis.call('zrem', KEYS[1], ready[i])
    else
        redis.call('zadd', KEYS[1], ARGV[1] + ARGV[2], ready[i])
        jobs[#jobs + 1] = payload
    end
end
return jobs
"#;

// KEYS[1] queue index, KEYS[2..] job records.
const ACK_SCRIPT: &str = r#"
for i = 2, #KEYS do
    redis.call('zrem', KEYS[1], KEYS[i])
    redis.call('del', KEYS[i])
end
return redis.status_reply('OK')
"#;

pub struct RedisQueue {
    conn: MultiplexedConnection,
    enqueue_script: Script,
    dequeue_script: Script,
    ack_script: Script,
}

impl RedisQueue {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            ack_script: Script::new(ACK_SCRIPT),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, BobbinError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self::new(conn))
    }

    async fn take_jobs(&self, count: usize, opt: &DequeueOptions) -> Result<Vec<Job>, BobbinError> {
        let mut conn = self.conn.clone();
        let payloads: Vec<Vec<u8>> = self
            .dequeue_script
            .key(queue_key(&opt.namespace, &opt.queue_id))
            .arg(opt.at.timestamp())
            .arg(opt.invisible_sec)
            .arg(count)
            .invoke_async(&mut conn)
            .await?;

        if payloads.is_empty() {
            return Err(BobbinError::EmptyQueue);
        }
        payloads.iter().map(|bytes| Job::decode(bytes)).collect()
    }

    async fn remove_jobs(&self, jobs: &[Job], opt: &AckOptions) -> Result<(), BobbinError> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut invocation = self.ack_script.prepare_invoke();
        invocation.key(queue_key(&opt.namespace, &opt.queue_id));
        for job in jobs {
            invocation.key(job_key(&opt.namespace, &job.id));
        }

        let mut conn = self.conn.clone();
        let _: () = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(&self, job: &Job, opt: &EnqueueOptions) -> Result<(), BobbinError> {
        let bytes = job.encode()?;
        let mut conn = self.conn.clone();
        let _: () = self
            .enqueue_script
            .key(job_key(&opt.namespace, &job.id))
            .key(queue_key(&opt.namespace, &opt.queue_id))
            .arg(job.enqueued_at.timestamp())
            .arg(&bytes[..])
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, opt: &DequeueOptions) -> Result<Job, BobbinError> {
        let mut jobs = self.take_jobs(1, opt).await?;
        Ok(jobs.remove(0))
    }

    async fn ack(&self, job: &Job, opt: &AckOptions) -> Result<(), BobbinError> {
        self.remove_jobs(std::slice::from_ref(job), opt).await
    }

    fn as_bulk(&self) -> Option<&dyn BulkQueue> {
        Some(self)
    }

    fn as_metrics_exporter(&self) -> Option<&dyn MetricsExporter> {
        Some(self)
    }
}

#[async_trait]
impl BulkQueue for RedisQueue {
    async fn bulk_dequeue(
        &self,
        count: usize,
        opt: &DequeueOptions,
    ) -> Result<Vec<Job>, BobbinError> {
        self.take_jobs(count, opt).await
    }

    async fn bulk_ack(&self, jobs: &[Job], opt: &AckOptions) -> Result<(), BobbinError> {
        self.remove_jobs(jobs, opt).await
    }
}

#[async_trait]
impl MetricsExporter for RedisQueue {
    async fn queue_metrics(&self, opt: &QueueMetricsOptions) -> Result<QueueMetrics, BobbinError> {
        let key = queue_key(&opt.namespace, &opt.queue_id);
        let at = opt.at.timestamp();

        let mut conn = self.conn.clone();
        let ready_total: i64 = conn.zcount(&key, "-inf", at).await?;
        let scheduled_total: i64 = conn.zcount(&key, format!("({at}"), "+inf").await?;

        Ok(QueueMetrics {
            namespace: opt.namespace.clone(),
            queue_id: opt.queue_id.clone(),
            ready_total,
            scheduled_total,
        })
    }
}

// Live-server tests. Run with a local redis:
//   cargo test -p bobbin-core redis -- --ignored
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde::{Deserialize, Serialize};
    use ulid::Ulid;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Message {
        text: String,
    }

    async fn connect() -> (RedisQueue, MultiplexedConnection) {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let conn = client.get_multiplexed_async_connection().await.unwrap();
        (RedisQueue::new(conn.clone()), conn)
    }

    // Fresh namespace per test so runs never clobber each other.
    fn test_namespace() -> String {
        format!("bobbin-test-{}", Ulid::new())
    }

    fn hello_job() -> Job {
        let mut job = Job::new();
        job.marshal_payload(&Message {
            text: "hello".into(),
        })
        .unwrap();
        job
    }

    #[tokio::test]
    #[ignore = "needs a local redis server"]
    async fn enqueue_writes_record_and_scores_the_index() {
        let (queue, mut conn) = connect().await;
        let ns = test_namespace();
        let job = hello_job();

        queue
            .enqueue(
                &job,
                &EnqueueOptions {
                    namespace: ns.clone(),
                    queue_id: "q1".into(),
                },
            )
            .await
            .unwrap();

        let record: std::collections::HashMap<String, Vec<u8>> =
            conn.hgetall(job_key(&ns, &job.id)).await.unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record.get("msgpack").unwrap(), &job.encode().unwrap());

        let score: f64 = conn
            .zscore(queue_key(&ns, "q1"), job_key(&ns, &job.id))
            .await
            .unwrap();
        assert_eq!(score as i64, job.enqueued_at.timestamp());

        // Re-enqueueing the same job updates the score, not the membership.
        queue
            .enqueue(
                &job.delay(Duration::seconds(60)),
                &EnqueueOptions {
                    namespace: ns.clone(),
                    queue_id: "q1".into(),
                },
            )
            .await
            .unwrap();
        let members: Vec<String> = conn
            .zrangebyscore(queue_key(&ns, "q1"), "-inf", "+inf")
            .await
            .unwrap();
        assert_eq!(members, vec![job_key(&ns, &job.id)]);
    }

    #[tokio::test]
    #[ignore = "needs a local redis server"]
    async fn dequeue_returns_the_job_and_bumps_its_score() {
        let (queue, mut conn) = connect().await;
        let ns = test_namespace();
        let job = hello_job();

        queue
            .enqueue(
                &job,
                &EnqueueOptions {
                    namespace: ns.clone(),
                    queue_id: "q1".into(),
                },
            )
            .await
            .unwrap();

        let opt = DequeueOptions {
            namespace: ns.clone(),
            queue_id: "q1".into(),
            at: job.enqueued_at,
            invisible_sec: 60,
        };
        let dequeued = queue.dequeue(&opt).await.unwrap();
        assert_eq!(dequeued, job);

        let score: f64 = conn
            .zscore(queue_key(&ns, "q1"), job_key(&ns, &job.id))
            .await
            .unwrap();
        assert_eq!(score as i64, job.enqueued_at.timestamp() + 60);

        // Hidden now, so a second claim finds nothing.
        let err = queue.dequeue(&opt).await.unwrap_err();
        assert!(matches!(err, BobbinError::EmptyQueue));
    }

    #[tokio::test]
    #[ignore = "needs a local redis server"]
    async fn dequeue_drops_entries_whose_record_is_gone() {
        let (queue, mut conn) = connect().await;
        let ns = test_namespace();
        let job = hello_job();

        queue
            .enqueue(
                &job,
                &EnqueueOptions {
                    namespace: ns.clone(),
                    queue_id: "q1".into(),
                },
            )
            .await
            .unwrap();
        let _: () = conn.del(job_key(&ns, &job.id)).await.unwrap();

        let err = queue
            .dequeue(&DequeueOptions {
                namespace: ns.clone(),
                queue_id: "q1".into(),
                at: job.enqueued_at,
                invisible_sec: 60,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BobbinError::EmptyQueue));

        let remaining: i64 = conn.zcard(queue_key(&ns, "q1")).await.unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    #[ignore = "needs a local redis server"]
    async fn ack_deletes_everything_and_is_idempotent() {
        let (queue, mut conn) = connect().await;
        let ns = test_namespace();
        let job = hello_job();

        queue
            .enqueue(
                &job,
                &EnqueueOptions {
                    namespace: ns.clone(),
                    queue_id: "q1".into(),
                },
            )
            .await
            .unwrap();

        let ack = AckOptions {
            namespace: ns.clone(),
            queue_id: "q1".into(),
        };
        queue.ack(&job, &ack).await.unwrap();

        let exists: i64 = conn.exists(job_key(&ns, &job.id)).await.unwrap();
        assert_eq!(exists, 0);
        let remaining: i64 = conn.zcard(queue_key(&ns, "q1")).await.unwrap();
        assert_eq!(remaining, 0);

        queue.ack(&job, &ack).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs a local redis server"]
    async fn metrics_split_ready_and_scheduled() {
        let (queue, _conn) = connect().await;
        let ns = test_namespace();
        let job = hello_job();

        queue
            .enqueue(
                &job,
                &EnqueueOptions {
                    namespace: ns.clone(),
                    queue_id: "q1".into(),
                },
            )
            .await
            .unwrap();

        let metrics = queue
            .queue_metrics(&QueueMetricsOptions {
                namespace: ns.clone(),
                queue_id: "q1".into(),
                at: job.enqueued_at,
            })
            .await
            .unwrap();
        assert_eq!(metrics.ready_total, 1);
        assert_eq!(metrics.scheduled_total, 0);

        let metrics = queue
            .queue_metrics(&QueueMetricsOptions {
                namespace: ns,
                queue_id: "q1".into(),
                at: job.enqueued_at - Duration::seconds(1),
            })
            .await
            .unwrap();
        assert_eq!(metrics.ready_total, 0);
        assert_eq!(metrics.scheduled_total, 1);
    }
}
