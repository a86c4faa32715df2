use serde::{Deserialize, Serialize};

/// Queue depth split at an instant: ready (score <= at) vs scheduled (score > at).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub namespace: String,
    pub queue_id: String,
    pub ready_total: i64,
    pub scheduled_total: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub queue: Vec<QueueMetrics>,
}
