//! Worker: per-queue handler pools with batched acknowledgement.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BobbinError;
use crate::job::Job;
use crate::middleware::{
    catch_panic, idle_wait, retry, DequeueFn, DequeueMiddleware, HandleFn, HandleMiddleware,
};
use crate::observability::Metrics;
use crate::queue::{
    AckOptions, BulkQueue, DequeueOptions, EnqueueOptions, MetricsExporter, Queue,
    QueueMetricsOptions,
};

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
// Caps the un-acked batch per loop.
const MAX_ACK_BATCH: usize = 1000;
const BULK_DEQUEUE_COUNT: usize = 1000;

/// How a registered handler runs its jobs. The three scalar fields are
/// required and must be positive.
#[derive(Clone, Default)]
pub struct JobOptions {
    /// Expected upper bound on one handler run; drives the invisibility
    /// window `2 * (max_execution_time + 1s)`.
    pub max_execution_time: Duration,
    /// Sleep after an empty dequeue.
    pub idle_wait: Duration,
    /// Worker loops spawned for this handler.
    pub concurrency: usize,
    pub dequeue_middleware: Vec<DequeueMiddleware>,
    pub handle_middleware: Vec<HandleMiddleware>,
}

impl JobOptions {
    pub fn new(max_execution_time: Duration, idle_wait: Duration, concurrency: usize) -> Self {
        Self {
            max_execution_time,
            idle_wait,
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_dequeue_middleware(mut self, mw: DequeueMiddleware) -> Self {
        self.dequeue_middleware.push(mw);
        self
    }

    pub fn with_handle_middleware(mut self, mw: HandleMiddleware) -> Self {
        self.handle_middleware.push(mw);
        self
    }

    fn validate(&self) -> Result<(), BobbinError> {
        if self.max_execution_time == Duration::ZERO {
            return Err(BobbinError::MaxExecutionTime);
        }
        if self.idle_wait == Duration::ZERO {
            return Err(BobbinError::IdleWait);
        }
        if self.concurrency == 0 {
            return Err(BobbinError::Concurrency);
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Handler {
    queue_id: String,
    handle: HandleFn,
    options: JobOptions,
}

pub struct WorkerOptions {
    pub namespace: String,
    pub queue: Arc<dyn Queue>,
}

/// Runs registered handlers against their queues until stopped.
pub struct Worker {
    namespace: String,
    queue: Arc<dyn Queue>,
    handler_map: HashMap<String, Handler>,
    stop_tx: Option<watch::Sender<bool>>,
    joins: Vec<JoinHandle<()>>,
}

impl Worker {
    pub fn new(opt: WorkerOptions) -> Self {
        Self {
            namespace: opt.namespace,
            queue: opt.queue,
            handler_map: HashMap::new(),
            stop_tx: None,
            joins: Vec::new(),
        }
    }

    /// Associates a handler with a queue. Registering the same queue again
    /// overwrites the previous handler.
    pub fn register(
        &mut self,
        queue_id: impl Into<String>,
        handle: HandleFn,
        options: JobOptions,
    ) -> Result<(), BobbinError> {
        options.validate()?;
        let queue_id = queue_id.into();
        self.handler_map.insert(
            queue_id.clone(),
            Handler {
                queue_id,
                handle,
                options,
            },
        );
        Ok(())
    }

    /// Enqueues a job onto a registered queue under the worker's namespace.
    pub async fn enqueue(&self, queue_id: &str, job: &Job) -> Result<(), BobbinError> {
        if !self.handler_map.contains_key(queue_id) {
            return Err(BobbinError::QueueNotFound);
        }
        self.queue
            .enqueue(
                job,
                &EnqueueOptions {
                    namespace: self.namespace.clone(),
                    queue_id: queue_id.to_string(),
                },
            )
            .await
    }

    /// Spawns `concurrency` loops per registered handler.
    pub fn start(&mut self) {
        let (stop_tx, stop_rx) = watch::channel(false);
        for handler in self.handler_map.values() {
            for _ in 0..handler.options.concurrency {
                self.joins.push(tokio::spawn(run_loop(
                    self.namespace.clone(),
                    Arc::clone(&self.queue),
                    handler.clone(),
                    stop_rx.clone(),
                )));
            }
            info!(
                queue_id = %handler.queue_id,
                concurrency = handler.options.concurrency,
                "worker loops started"
            );
        }
        self.stop_tx = Some(stop_tx);
    }

    /// Signals every loop to stop and waits for them to drain. Each loop
    /// finishes its current job and flushes its ack batch before exiting.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        for join in self.joins.drain(..) {
            let _ = join.await;
        }
        info!("worker stopped");
    }

    /// Current ready/scheduled totals for every registered queue.
    pub async fn export_metrics(&self) -> Result<Metrics, BobbinError> {
        let exporter = self
            .queue
            .as_metrics_exporter()
            .ok_or(BobbinError::Unsupported)?;

        let mut queue = Vec::with_capacity(self.handler_map.len());
        for queue_id in self.handler_map.keys() {
            queue.push(
                exporter
                    .queue_metrics(&QueueMetricsOptions {
                        namespace: self.namespace.clone(),
                        queue_id: queue_id.clone(),
                        at: Utc::now(),
                    })
                    .await?,
            );
        }
        Ok(Metrics { queue })
    }
}

async fn run_loop(
    namespace: String,
    queue: Arc<dyn Queue>,
    handler: Handler,
    mut stop_rx: watch::Receiver<bool>,
) {
    // Twice the worst case of one handler run plus one flush interval, so an
    // un-acked job is not redelivered while its ack still sits in the batch.
    let invisible_sec = (2 * (handler.options.max_execution_time + FLUSH_INTERVAL)).as_secs() as i64;

    let mut dequeue = buffered_dequeue(Arc::clone(&queue));
    for mw in &handler.options.dequeue_middleware {
        dequeue = mw(dequeue);
    }
    dequeue = idle_wait(handler.options.idle_wait, stop_rx.clone())(dequeue);

    let mut handle = Arc::clone(&handler.handle);
    for mw in &handler.options.handle_middleware {
        handle = mw(handle);
    }
    handle = catch_panic()(handle);
    handle = retry(Arc::clone(&queue))(handle);

    let ack_opt = AckOptions {
        namespace: namespace.clone(),
        queue_id: handler.queue_id.clone(),
    };
    let mut ack_jobs: Vec<Job> = Vec::new();
    let mut flush_ticker = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        if *stop_rx.borrow() || stop_rx.has_changed().is_err() {
            break;
        }
        if flush_ticker.tick().now_or_never().is_some() {
            if let Err(err) = flush(queue.as_ref(), &mut ack_jobs, &ack_opt).await {
                warn!(queue_id = %ack_opt.queue_id, error = %err, "ack flush failed, batch kept");
            }
            continue;
        }

        let opt = DequeueOptions {
            namespace: namespace.clone(),
            queue_id: handler.queue_id.clone(),
            at: Utc::now(),
            invisible_sec,
        };
        let job = match dequeue(opt.clone()).await {
            Ok(job) => job,
            Err(_) => continue,
        };
        match handle(job.clone(), opt).await {
            Ok(()) => {
                ack_jobs.push(job);
                if ack_jobs.len() >= MAX_ACK_BATCH {
                    if let Err(err) = flush(queue.as_ref(), &mut ack_jobs, &ack_opt).await {
                        warn!(queue_id = %ack_opt.queue_id, error = %err, "ack flush failed, batch kept");
                    }
                }
            }
            // The retry layer already decided what happens to the job.
            Err(err) => debug!(queue_id = %ack_opt.queue_id, error = %err, "job handling failed"),
        }
    }

    if let Err(err) = flush(queue.as_ref(), &mut ack_jobs, &ack_opt).await {
        warn!(
            queue_id = %ack_opt.queue_id,
            error = %err,
            "final ack flush failed, jobs redeliver after their visibility expires"
        );
    }
}

/// Base dequeue stage. With a bulk-capable queue, jobs are claimed
/// `BULK_DEQUEUE_COUNT` at a time into a per-loop buffer; the invisibility
/// window is scaled by the batch size so the last buffered job is still
/// hidden when its turn comes.
fn buffered_dequeue(queue: Arc<dyn Queue>) -> DequeueFn {
    let buffer: Arc<Mutex<VecDeque<Job>>> = Arc::new(Mutex::new(VecDeque::new()));
    Arc::new(move |opt: DequeueOptions| {
        let queue = Arc::clone(&queue);
        let buffer = Arc::clone(&buffer);
        async move {
            let Some(bulk) = queue.as_bulk() else {
                return queue.dequeue(&opt).await;
            };

            let mut buffer = buffer.lock().await;
            if buffer.is_empty() {
                let mut bulk_opt = opt.clone();
                bulk_opt.invisible_sec *= BULK_DEQUEUE_COUNT as i64;
                buffer.extend(bulk.bulk_dequeue(BULK_DEQUEUE_COUNT, &bulk_opt).await?);
            }
            buffer.pop_front().ok_or(BobbinError::EmptyQueue)
        }
        .boxed()
    })
}

/// Acks the whole batch, in one round-trip when the queue supports it. On
/// failure the batch is kept; re-acking already-removed jobs is a no-op.
async fn flush(
    queue: &dyn Queue,
    ack_jobs: &mut Vec<Job>,
    opt: &AckOptions,
) -> Result<(), BobbinError> {
    if ack_jobs.is_empty() {
        return Ok(());
    }
    if let Some(bulk) = queue.as_bulk() {
        bulk.bulk_ack(ack_jobs, opt).await?;
    } else {
        for job in ack_jobs.iter() {
            queue.ack(job, opt).await?;
        }
    }
    ack_jobs.clear();
    Ok(())
}
