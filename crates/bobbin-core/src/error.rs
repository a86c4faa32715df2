use thiserror::Error;

#[derive(Debug, Error)]
pub enum BobbinError {
    /// No job in the queue is eligible at the requested instant.
    #[error("empty queue")]
    EmptyQueue,

    /// The job must not be retried. The retry layer drops it instead of
    /// re-enqueueing, so the normal ack flush deletes it.
    #[error("permanent error")]
    Unrecoverable,

    /// The queue does not implement the requested capability.
    #[error("unsupported")]
    Unsupported,

    /// The queue has no registered handler.
    #[error("queue is not found")]
    QueueNotFound,

    #[error("max execution time should be > 0")]
    MaxExecutionTime,

    #[error("idle wait should be > 0")]
    IdleWait,

    #[error("concurrency should be > 0")]
    Concurrency,

    #[error("msgpack encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("store: {0}")]
    Store(#[from] redis::RedisError),

    /// Handler failure, including stringified panics.
    #[error("{0}")]
    Handler(String),
}
