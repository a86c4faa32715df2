//! Discard middleware for jobs that can never be handled.
//!
//! Translates decode failures into `Unrecoverable`, so the retry layer drops
//! the job instead of re-enqueueing it forever.

use std::sync::Arc;

use futures::FutureExt;

use super::{HandleFn, HandleMiddleware};
use crate::error::BobbinError;

pub type ErrorPredicate = Arc<dyn Fn(&BobbinError) -> bool + Send + Sync>;

/// Marks payload decode failures unrecoverable.
pub fn invalid_payload() -> HandleMiddleware {
    invalid_payload_matching(Arc::new(is_decode_failure))
}

/// Like `invalid_payload` with a caller-supplied predicate.
pub fn invalid_payload_matching(predicate: ErrorPredicate) -> HandleMiddleware {
    Arc::new(move |next: HandleFn| {
        let predicate = Arc::clone(&predicate);
        Arc::new(move |job, opt| {
            let next = Arc::clone(&next);
            let predicate = Arc::clone(&predicate);
            async move {
                match next(job, opt).await {
                    Err(err) if predicate(&err) => Err(BobbinError::Unrecoverable),
                    res => res,
                }
            }
            .boxed()
        })
    })
}

// Typed check first; the message fallback catches handlers that stringify
// the codec error themselves.
fn is_decode_failure(err: &BobbinError) -> bool {
    matches!(err, BobbinError::Decode(_)) || err.to_string().contains("msgpack")
}
