//! bobbin-core
//!
//! Core building blocks for the bobbin job-queue runtime:
//! - job: job records and the msgpack payload codec
//! - queue: Queue trait, optional capabilities, Redis and in-memory backends
//! - middleware: dequeue/handle wrappers (idle wait, panic capture, retry, discard)
//! - worker: per-queue worker pools with batched acknowledgement
//! - observability: ready/scheduled queue metrics
//! - error: crate-level error type

pub mod error;
pub mod job;
pub mod middleware;
pub mod observability;
pub mod queue;
pub mod worker;
