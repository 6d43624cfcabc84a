// tests/fair_work.rs

//! Work sharing between competing consumers of one subscription.
//!
//! Handler costs are simulated with tokio's paused clock, so the 5-second
//! jobs below take no real time and elapsed times are exact.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use common::{init_logging, Job};
use mom_bus::transport::memory::MemoryBroker;
use mom_bus::{
    // ---
    BusBuilder,
    Envelope,
    ExchangeHandle,
    HandlerError,
    Message,
    QueueSpec,
    SubscriberBuilder,
};

const COSTS: [u64; 6] = [0, 5, 0, 5, 0, 5];

/// Two consumers share subscription "workers" with the given prefetch; six
/// jobs of uneven cost are published. Returns the time until all are done.
async fn run_uneven_jobs(prefetch_count: u16) -> Duration {
    // ---
    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("fair-work")).build().unwrap();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u32>();

    let mut subscriptions = Vec::new();
    for _ in 0..2 {
        let done_tx = done_tx.clone();
        let subscription = bus
            .subscribe_with(
                SubscriberBuilder::<Job>::new()
                    .subscription_id("workers")
                    .with_prefetch_count(prefetch_count)
                    .handler_async(move |job: Job| {
                        let done_tx = done_tx.clone();
                        async move {
                            tokio::time::sleep(job.cost()).await;
                            let _ = done_tx.send(job.id);
                            Ok::<(), HandlerError>(())
                        }
                    }),
            )
            .await
            .unwrap();
        subscriptions.push(subscription);
    }

    let start = Instant::now();
    for (id, cost_secs) in COSTS.into_iter().enumerate() {
        bus.publish(&Job {
            id: id as u32,
            cost_secs,
        })
        .await
        .unwrap();
    }

    for _ in 0..COSTS.len() {
        done_rx.recv().await.unwrap();
    }
    let elapsed = start.elapsed();

    bus.dispose().await;
    elapsed
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_one_redistributes_slow_jobs() {
    // ---
    init_logging();

    let elapsed = run_uneven_jobs(1).await;
    assert!(
        elapsed <= Duration::from_secs(11),
        "prefetch 1 should spread the slow jobs, took {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_fifty_lets_one_consumer_hoard() {
    // ---
    init_logging();

    let elapsed = run_uneven_jobs(50).await;
    assert!(
        elapsed >= Duration::from_secs(14),
        "prefetch 50 should leave all slow jobs on one consumer, took {elapsed:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_extremes_are_distinguishable() {
    // ---
    init_logging();

    let fair = run_uneven_jobs(1).await;
    let greedy = run_uneven_jobs(50).await;
    assert!(fair < greedy, "fair {fair:?} vs greedy {greedy:?}");
}

#[tokio::test]
async fn test_backlog_splits_by_prefetch_credit() {
    // ---
    init_logging();

    const TOTAL: usize = 55;

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("mixed")).build().unwrap();

    // Queue and backlog exist before anyone consumes.
    let queue = bus.conventions().queue_name(&Job::type_name(), "mixed");
    bus.transport()
        .declare_queue(QueueSpec::durable(queue.clone()))
        .await
        .unwrap();
    for id in 0..TOTAL as u32 {
        let envelope = Envelope::for_message(&Job { id, cost_secs: 0 }).unwrap();
        bus.transport()
            .publish(&ExchangeHandle::default_exchange(), &queue, envelope)
            .await
            .unwrap();
    }
    assert_eq!(broker.message_count(&queue), TOTAL);

    let (gate_tx, gate_rx) = watch::channel(false);
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<()>();
    let greedy_count = Arc::new(AtomicUsize::new(0));
    let fair_count = Arc::new(AtomicUsize::new(0));

    // The greedy consumer holds its first batch until the fair one has joined.
    let greedy = {
        let count = greedy_count.clone();
        let done_tx = done_tx.clone();
        bus.subscribe_with(
            SubscriberBuilder::<Job>::new()
                .subscription_id("mixed")
                .with_prefetch_count(50)
                .handler_async(move |_job: Job| {
                    let count = count.clone();
                    let done_tx = done_tx.clone();
                    let mut gate = gate_rx.clone();
                    async move {
                        let _ = gate.wait_for(|open| *open).await;
                        count.fetch_add(1, Ordering::SeqCst);
                        let _ = done_tx.send(());
                        Ok::<(), HandlerError>(())
                    }
                }),
        )
        .await
        .unwrap()
    };
    assert_eq!(broker.unacked_count(&queue), 50);

    let fair = {
        let count = fair_count.clone();
        let done_tx = done_tx.clone();
        bus.subscribe_with(
            SubscriberBuilder::<Job>::new()
                .subscription_id("mixed")
                .with_prefetch_count(1)
                .handler_async(move |_job: Job| {
                    let count = count.clone();
                    let done_tx = done_tx.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        let _ = done_tx.send(());
                        Ok::<(), HandlerError>(())
                    }
                }),
        )
        .await
        .unwrap()
    };

    gate_tx.send_replace(true);
    for _ in 0..TOTAL {
        done_rx.recv().await.unwrap();
    }

    let greedy_total = greedy_count.load(Ordering::SeqCst);
    let fair_total = fair_count.load(Ordering::SeqCst);
    assert!(greedy_total >= 50, "greedy consumer got {greedy_total}");
    assert!(fair_total > 0, "fair consumer got nothing");
    assert_eq!(greedy_total + fair_total, TOTAL);

    greedy.dispose().await;
    fair.dispose().await;
    assert_eq!(broker.message_count(&queue), 0);
    assert_eq!(broker.unacked_count(&queue), 0);
    bus.dispose().await;
}
