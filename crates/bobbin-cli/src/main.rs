//! Smallest end-to-end wiring of the runtime: a memory-backed queue, one
//! handler, an immediate and a delayed job, metrics, graceful stop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use bobbin_core::job::Job;
use bobbin_core::middleware::{handle_fn, logging};
use bobbin_core::queue::MemoryQueue;
use bobbin_core::worker::{JobOptions, Worker, WorkerOptions};

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let queue = Arc::new(MemoryQueue::new());
    let mut worker = Worker::new(WorkerOptions {
        namespace: "demo".into(),
        queue,
    });

    let done = Arc::new(AtomicUsize::new(0));
    let handler = {
        let done = Arc::clone(&done);
        handle_fn(move |job: Job, _opt| {
            let done = Arc::clone(&done);
            async move {
                let greeting: Greeting = job.unmarshal_payload()?;
                info!(job_id = %job.id, name = %greeting.name, "greeted");
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    };
    worker.register(
        "greetings",
        handler,
        JobOptions::new(Duration::from_secs(5), Duration::from_millis(100), 2)
            .with_handle_middleware(logging::log_failures()),
    )?;

    let mut job = Job::new();
    job.marshal_payload(&Greeting {
        name: "bobbin".into(),
    })?;
    worker.enqueue("greetings", &job).await?;

    let mut later = Job::new();
    later.marshal_payload(&Greeting {
        name: "later".into(),
    })?;
    worker
        .enqueue("greetings", &later.delay(chrono::Duration::seconds(2)))
        .await?;

    worker.start();
    while done.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let metrics = worker.export_metrics().await?;
    for queue in &metrics.queue {
        info!(
            queue_id = %queue.queue_id,
            ready = queue.ready_total,
            scheduled = queue.scheduled_total,
            "queue drained"
        );
    }

    worker.stop().await;
    Ok(())
}
