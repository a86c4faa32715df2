//! Structured logging for the handle stage.

use std::sync::Arc;

use futures::FutureExt;
use tracing::warn;

use super::{HandleFn, HandleMiddleware};

/// Logs every failed handle with the job id and retry count. The result is
/// passed through unchanged, so this composes anywhere in the stack.
pub fn log_failures() -> HandleMiddleware {
    Arc::new(|next: HandleFn| {
        Arc::new(move |job, opt| {
            let next = Arc::clone(&next);
            async move {
                let job_id = job.id.clone();
                let retries = job.retries;
                let queue_id = opt.queue_id.clone();
                let res = next(job, opt).await;
                if let Err(err) = &res {
                    warn!(%job_id, retries, %queue_id, error = %err, "job handling failed");
                }
                res
            }
            .boxed()
        })
    })
}
