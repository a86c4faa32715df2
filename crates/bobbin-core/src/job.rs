//! Job record and payload codec.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::BobbinError;

/// A unit of work.
///
/// `enqueued_at` is the sole ordering key: it is the instant at which the job
/// becomes eligible for dequeue, and may lie in the future for scheduled
/// delivery. The queue index scores jobs by this instant in whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retries: i64,
    pub last_error: Option<String>,
}

impl Job {
    /// Creates a job with a fresh ULID and an empty payload, eligible now.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new().to_string(),
            payload: Vec::new(),
            enqueued_at: now,
            created_at: now,
            updated_at: now,
            retries: 0,
            last_error: None,
        }
    }

    /// Returns a copy whose eligibility instant is shifted by `d`.
    pub fn delay(&self, d: Duration) -> Self {
        let mut job = self.clone();
        job.enqueued_at = job.enqueued_at + d;
        job
    }

    /// Encodes `value` as msgpack into the payload.
    pub fn marshal_payload<T: Serialize>(&mut self, value: &T) -> Result<(), BobbinError> {
        self.payload = rmp_serde::to_vec_named(value)?;
        Ok(())
    }

    /// Decodes the payload back into a typed value.
    pub fn unmarshal_payload<T: DeserializeOwned>(&self) -> Result<T, BobbinError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }

    /// Serializes the whole job for the store record. The encoding is
    /// deterministic and self-delimiting; `decode` returns an equal job.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, BobbinError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, BobbinError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Default for Job {
    fn default() -> Self {
        Self::new()
    }
}
