// demos/work_queue_memory.rs

//! Competing consumers on one work queue.
//!
//! Two workers share subscription id "workers" with prefetch 1, so a slow job
//! never holds up the fast ones queued behind it.
//!
//! Run with: cargo run --example work_queue_memory

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use mom_bus::{create_memory_transport, BusBuilder, HandlerError, Message, Result, SubscriberBuilder};

#[derive(Debug, Serialize, Deserialize)]
struct Resize {
    image: String,
    cost_ms: u64,
}

impl Message for Resize {
    fn type_name() -> std::borrow::Cow<'static, str> {
        "demo.Resize".into()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let bus = BusBuilder::new(create_memory_transport("work-queue"))
        .default_prefetch_count(1)
        .build()?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    for worker in ["alice", "bob"] {
        let done_tx = done_tx.clone();
        bus.subscribe_with(
            SubscriberBuilder::<Resize>::new()
                .subscription_id("workers")
                .handler_async(move |job: Resize| {
                    let done_tx = done_tx.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(job.cost_ms)).await;
                        let _ = done_tx.send((worker, job.image));
                        Ok::<(), HandlerError>(())
                    }
                }),
        )
        .await?;
    }

    let start = Instant::now();
    let costs = [0, 500, 0, 500, 0, 500];
    for (i, cost_ms) in costs.into_iter().enumerate() {
        bus.publish(&Resize {
            image: format!("img-{i}.png"),
            cost_ms,
        })
        .await?;
    }

    for _ in 0..costs.len() {
        if let Some((worker, image)) = done_rx.recv().await {
            println!("{worker:>5} resized {image} at {:?}", start.elapsed());
        }
    }

    bus.dispose().await;
    Ok(())
}
