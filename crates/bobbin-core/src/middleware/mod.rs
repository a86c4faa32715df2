//! Middleware kernel: typed wrappers for the dequeue and handle stages.
//!
//! A stage is a boxed async closure; a middleware is a transformer from stage
//! to stage. Stacks are built by a left fold, so the first middleware applied
//! is innermost. The worker pins the outer layers: `idle_wait` outermost on
//! the dequeue stack, `retry(catch_panic(..))` outermost on the handle stack.

pub mod discard;
pub mod logging;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::warn;

use crate::error::BobbinError;
use crate::job::Job;
use crate::queue::{DequeueOptions, EnqueueOptions, Queue};

pub type DequeueFn =
    Arc<dyn Fn(DequeueOptions) -> BoxFuture<'static, Result<Job, BobbinError>> + Send + Sync>;

pub type DequeueMiddleware = Arc<dyn Fn(DequeueFn) -> DequeueFn + Send + Sync>;

pub type HandleFn =
    Arc<dyn Fn(Job, DequeueOptions) -> BoxFuture<'static, Result<(), BobbinError>> + Send + Sync>;

pub type HandleMiddleware = Arc<dyn Fn(HandleFn) -> HandleFn + Send + Sync>;

/// Lifts a plain async closure into a `DequeueFn`.
pub fn dequeue_fn<F, Fut>(f: F) -> DequeueFn
where
    F: Fn(DequeueOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Job, BobbinError>> + Send + 'static,
{
    Arc::new(move |opt| f(opt).boxed())
}

/// Lifts a plain async closure into a `HandleFn`.
pub fn handle_fn<F, Fut>(f: F) -> HandleFn
where
    F: Fn(Job, DequeueOptions) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BobbinError>> + Send + 'static,
{
    Arc::new(move |job, opt| f(job, opt).boxed())
}

/// Sleeps for `d` after an empty dequeue, or until the stop signal fires,
/// whichever comes first. The error passes through unchanged.
pub fn idle_wait(d: Duration, stop: watch::Receiver<bool>) -> DequeueMiddleware {
    Arc::new(move |next: DequeueFn| {
        let stop = stop.clone();
        Arc::new(move |opt: DequeueOptions| {
            let next = Arc::clone(&next);
            let mut stop = stop.clone();
            async move {
                let res = next(opt).await;
                if matches!(res, Err(BobbinError::EmptyQueue)) && !*stop.borrow() {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = stop.changed() => {}
                    }
                }
                res
            }
            .boxed()
        })
    })
}

/// Recovers a panicking handler and reports the panic payload as an error.
pub fn catch_panic() -> HandleMiddleware {
    Arc::new(|next: HandleFn| {
        Arc::new(move |job: Job, opt: DequeueOptions| {
            let next = Arc::clone(&next);
            async move {
                match AssertUnwindSafe(next(job, opt)).catch_unwind().await {
                    Ok(res) => res,
                    Err(panic) => Err(BobbinError::Handler(panic_message(panic.as_ref()))),
                }
            }
            .boxed()
        })
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Re-enqueues failed jobs with linear backoff: the k-th retry becomes
/// eligible `k * invisible_sec` seconds after the failure. `Unrecoverable`
/// is swallowed so the worker's ack flush deletes the job instead. Retries
/// are unbounded; handlers cap them by checking `job.retries` and returning
/// `Unrecoverable`.
pub fn retry(queue: Arc<dyn Queue>) -> HandleMiddleware {
    Arc::new(move |next: HandleFn| {
        let queue = Arc::clone(&queue);
        Arc::new(move |job: Job, opt: DequeueOptions| {
            let next = Arc::clone(&next);
            let queue = Arc::clone(&queue);
            async move {
                match next(job.clone(), opt.clone()).await {
                    Ok(()) => Ok(()),
                    Err(BobbinError::Unrecoverable) => Ok(()),
                    Err(err) => {
                        let now = Utc::now();
                        let mut job = job;
                        job.retries += 1;
                        job.last_error = Some(err.to_string());
                        job.updated_at = now;
                        job.enqueued_at =
                            now + chrono::Duration::seconds(job.retries * opt.invisible_sec);
                        if let Err(enqueue_err) = queue
                            .enqueue(
                                &job,
                                &EnqueueOptions {
                                    namespace: opt.namespace.clone(),
                                    queue_id: opt.queue_id.clone(),
                                },
                            )
                            .await
                        {
                            warn!(job_id = %job.id, error = %enqueue_err, "retry re-enqueue failed");
                        }
                        Err(err)
                    }
                }
            }
            .boxed()
        })
    })
}
