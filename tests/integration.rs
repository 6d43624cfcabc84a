// tests/integration.rs

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use common::{init_logging, settle_until, Job};
use mom_bus::transport::memory::MemoryBroker;
use mom_bus::{
    // ---
    BusBuilder,
    BusError,
    ConsumerErrorStrategy,
    ConsumerExecutionContext,
    DispatchState,
    Envelope,
    ExchangeHandle,
    HandlerError,
    Message,
    PostExceptionAckStrategy,
    ReceivedInfo,
    SubscriberBuilder,
    HA_POLICY_ARGUMENT,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
    region: String,
}

impl Message for OrderPlaced {
    fn type_name() -> std::borrow::Cow<'static, str> {
        "orders.OrderPlaced".into()
    }
}

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Answers every failure with one fixed decision and counts the calls.
struct FixedDecision {
    decision: PostExceptionAckStrategy,
    calls: Arc<AtomicUsize>,
}

impl ConsumerErrorStrategy for FixedDecision {
    fn handle_consumer_error(
        &self,
        _context: &ConsumerExecutionContext<'_>,
        _error: &BusError,
    ) -> PostExceptionAckStrategy {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}

#[tokio::test]
async fn test_publish_then_subscribe_delivers() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("pubsub")).build().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = bus
        .subscribe("billing", move |order: OrderPlaced| {
            let _ = tx.send(order);
            Ok::<(), HandlerError>(())
        })
        .await
        .unwrap();
    assert_eq!(subscription.queue_name(), "orders.OrderPlaced_billing");

    let order = OrderPlaced {
        order_id: 7,
        region: "eu".into(),
    };
    bus.publish(&order).await.unwrap();

    let received = timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("handler channel closed unexpectedly");
    assert_eq!(received, order);

    bus.dispose().await;
}

#[tokio::test]
async fn test_each_subscription_id_gets_its_own_copy() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("fanout")).build().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    for id in ["billing", "shipping"] {
        let tx = tx.clone();
        bus.subscribe(id, move |_order: OrderPlaced| {
            let _ = tx.send(id);
            Ok::<(), HandlerError>(())
        })
        .await
        .unwrap();
    }

    bus.publish(&OrderPlaced {
        order_id: 1,
        region: "us".into(),
    })
    .await
    .unwrap();

    let mut seen = vec![
        timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap(),
        timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap(),
    ];
    seen.sort_unstable();
    assert_eq!(seen, ["billing", "shipping"]);

    bus.dispose().await;
}

#[tokio::test]
async fn test_topics_filter_deliveries() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("topics")).build().unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();

    bus.subscribe_with_topics("eu-desk", ["orders.eu.*"], move |order: OrderPlaced| {
        let _ = tx.send(order.region);
        Ok::<(), HandlerError>(())
    })
    .await
    .unwrap();

    let us = OrderPlaced {
        order_id: 1,
        region: "us".into(),
    };
    let eu = OrderPlaced {
        order_id: 2,
        region: "eu".into(),
    };
    bus.publish_with_topic(&us, "orders.us.created").await.unwrap();
    bus.publish(&us).await.unwrap();
    bus.publish_with_topic(&eu, "orders.eu.created").await.unwrap();

    let region = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(region, "eu");
    assert!(rx.try_recv().is_err(), "only the eu order matches the binding");
    assert_eq!(broker.message_count("orders.OrderPlaced_eu-desk"), 0);

    bus.dispose().await;
}

#[tokio::test]
async fn test_wrong_type_never_reaches_handler() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("verify")).build().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = {
        let calls = calls.clone();
        bus.subscribe("audit", move |_job: Job| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        })
        .await
        .unwrap()
    };
    let queue = subscription.queue_name().to_string();

    // Right queue, wrong type: must be rejected before any decoding.
    let impostor = Envelope::new("tests.Impostor", Bytes::from_static(b"{\"id\":1,\"cost_secs\":0}"));
    bus.transport()
        .publish(&ExchangeHandle::default_exchange(), &queue, impostor)
        .await
        .unwrap();
    bus.publish(&Job { id: 2, cost_secs: 0 }).await.unwrap();

    settle_until(|| calls.load(Ordering::SeqCst) == 1).await;
    settle_until(|| broker.message_count(&queue) == 0 && broker.unacked_count(&queue) == 0).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    bus.dispose().await;
}

#[tokio::test]
async fn test_failing_handler_is_requeued_then_rejected() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("poison"))
        .max_requeue_attempts(2)
        .build()
        .unwrap();
    let attempts = Arc::new(Mutex::new(Vec::new()));

    let subscription = {
        let attempts = attempts.clone();
        bus.subscribe_with(
            SubscriberBuilder::<Job>::new()
                .subscription_id("poison")
                .handler_with_info(move |_job: Job, info: ReceivedInfo| {
                    attempts
                        .lock()
                        .unwrap()
                        .push((info.attempt, info.redelivered));
                    async move { Err::<(), _>("cannot process") }
                }),
        )
        .await
        .unwrap()
    };
    let queue = subscription.queue_name().to_string();

    bus.publish(&Job { id: 1, cost_secs: 0 }).await.unwrap();

    settle_until(|| attempts.lock().unwrap().len() == 3).await;
    settle_until(|| broker.message_count(&queue) == 0 && broker.unacked_count(&queue) == 0).await;
    for _ in 0..100 {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        *attempts.lock().unwrap(),
        vec![(1, false), (2, true), (3, true)]
    );
    assert_eq!(subscription.state(), DispatchState::AwaitingDelivery);

    bus.dispose().await;
}

#[tokio::test]
async fn test_panicking_handler_is_retried() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("panics")).build().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = {
        let calls = calls.clone();
        bus.subscribe("flaky", move |_job: Job| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first attempt blows up");
            }
            Ok::<(), HandlerError>(())
        })
        .await
        .unwrap()
    };
    let queue = subscription.queue_name().to_string();

    bus.publish(&Job { id: 1, cost_secs: 0 }).await.unwrap();

    settle_until(|| calls.load(Ordering::SeqCst) == 2).await;
    settle_until(|| broker.unacked_count(&queue) == 0).await;
    assert_eq!(broker.message_count(&queue), 0);
    assert!(!subscription.state().is_stopped());

    bus.dispose().await;
}

#[tokio::test]
async fn test_ha_subscription_declares_policy() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("ha")).build().unwrap();

    let subscription = bus
        .subscribe_with(
            SubscriberBuilder::<Job>::new()
                .subscription_id("mirrored")
                .with_ha(true)
                .handler(|_job: Job| Ok::<(), HandlerError>(())),
        )
        .await
        .unwrap();

    let arguments = broker.queue_arguments(subscription.queue_name()).unwrap();
    assert_eq!(arguments.get(HA_POLICY_ARGUMENT), Some(&serde_json::json!("all")));

    bus.dispose().await;
}

#[tokio::test]
async fn test_subscription_dispose_detaches_consumer() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("dispose")).build().unwrap();

    let subscription = bus
        .subscribe("short-lived", |_job: Job| Ok::<(), HandlerError>(()))
        .await
        .unwrap();
    let queue = subscription.queue_name().to_string();
    assert_eq!(broker.consumer_count(&queue), 1);
    assert_eq!(bus.subscription_count(), 1);

    subscription.dispose().await;
    assert_eq!(broker.consumer_count(&queue), 0);
    assert_eq!(bus.subscription_count(), 0);

    // Durable queue outlives its consumer; new messages wait there.
    bus.publish(&Job { id: 1, cost_secs: 0 }).await.unwrap();
    assert_eq!(broker.message_count(&queue), 1);

    bus.dispose().await;
}

#[tokio::test]
async fn test_disconnect_stops_dispatch() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let transport = broker.connect("drops");
    let bus = BusBuilder::new(transport.clone()).build().unwrap();

    let subscription = bus
        .subscribe("watcher", |_job: Job| Ok::<(), HandlerError>(()))
        .await
        .unwrap();

    transport.simulate_disconnect();
    timeout(RECV_TIMEOUT, subscription.stopped())
        .await
        .expect("dispatcher should stop when the connection drops");
    assert_eq!(subscription.state(), DispatchState::Stopped);

    let outcome = bus.publish(&Job { id: 1, cost_secs: 0 }).await;
    assert!(matches!(outcome, Err(BusError::TransportDisconnected)));

    bus.dispose().await;
}

#[tokio::test]
async fn test_invalid_builder_is_rejected_by_bus() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("invalid")).build().unwrap();

    let outcome = bus
        .subscribe_with(SubscriberBuilder::<Job>::new().handler(|_job: Job| Ok::<(), HandlerError>(())))
        .await;
    assert!(matches!(outcome, Err(BusError::Configuration(_))));
    assert_eq!(bus.subscription_count(), 0);

    bus.dispose().await;
}

#[tokio::test]
async fn test_disposed_bus_refuses_work() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("closed")).build().unwrap();
    bus.subscribe("before", |_job: Job| Ok::<(), HandlerError>(()))
        .await
        .unwrap();

    bus.dispose().await;
    bus.dispose().await;

    assert!(bus.is_disposed());
    assert_eq!(bus.subscription_count(), 0);
    assert!(matches!(
        bus.publish(&Job { id: 1, cost_secs: 0 }).await,
        Err(BusError::Shutdown)
    ));
    assert!(matches!(
        bus.subscribe("after", |_job: Job| Ok::<(), HandlerError>(())).await,
        Err(BusError::Shutdown)
    ));
}

#[tokio::test]
async fn test_custom_strategy_ack_and_discard() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let decisions = Arc::new(AtomicUsize::new(0));
    let bus = BusBuilder::new(broker.connect("discard"))
        .error_strategy(FixedDecision {
            decision: PostExceptionAckStrategy::AckAndDiscard,
            calls: decisions.clone(),
        })
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = {
        let calls = calls.clone();
        bus.subscribe("discarding", move |_job: Job| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("always fails")
        })
        .await
        .unwrap()
    };
    let queue = subscription.queue_name().to_string();

    bus.publish(&Job { id: 1, cost_secs: 0 }).await.unwrap();

    settle_until(|| decisions.load(Ordering::SeqCst) == 1).await;
    settle_until(|| broker.unacked_count(&queue) == 0).await;
    assert_eq!(broker.message_count(&queue), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "discarded, never redelivered");

    bus.dispose().await;
}

#[tokio::test]
async fn test_custom_strategy_do_nothing_leaves_delivery_unacked() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let decisions = Arc::new(AtomicUsize::new(0));
    let bus = BusBuilder::new(broker.connect("hold"))
        .error_strategy(FixedDecision {
            decision: PostExceptionAckStrategy::DoNothing,
            calls: decisions.clone(),
        })
        .build()
        .unwrap();

    let subscription = bus
        .subscribe("holding", |_job: Job| Err::<(), _>("cannot process"))
        .await
        .unwrap();
    let queue = subscription.queue_name().to_string();

    bus.publish(&Job { id: 1, cost_secs: 0 }).await.unwrap();

    settle_until(|| decisions.load(Ordering::SeqCst) == 1).await;
    assert_eq!(broker.unacked_count(&queue), 1);
    assert_eq!(broker.message_count(&queue), 0);

    // Once the consumer goes away the broker takes the message back.
    subscription.dispose().await;
    assert_eq!(broker.unacked_count(&queue), 0);
    assert_eq!(broker.message_count(&queue), 1);

    bus.dispose().await;
}

#[tokio::test]
async fn test_dispose_lets_running_handler_finish_and_ack() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("draining")).build().unwrap();

    let (gate_tx, gate_rx) = watch::channel(false);
    let (entered_tx, mut entered_rx) = watch::channel(false);
    let finished = Arc::new(AtomicUsize::new(0));

    let subscription = {
        let finished = finished.clone();
        bus.subscribe_async("draining", move |_job: Job| {
            let mut gate = gate_rx.clone();
            let entered = entered_tx.clone();
            let finished = finished.clone();
            async move {
                entered.send_replace(true);
                let _ = gate.wait_for(|open| *open).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .unwrap()
    };
    let queue = subscription.queue_name().to_string();

    bus.publish(&Job { id: 1, cost_secs: 0 }).await.unwrap();
    entered_rx.wait_for(|entered| *entered).await.unwrap();

    let disposing = tokio::spawn(subscription.dispose());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!disposing.is_finished(), "dispose waits for the running handler");
    assert_eq!(broker.unacked_count(&queue), 1);

    gate_tx.send_replace(true);
    timeout(RECV_TIMEOUT, disposing).await.unwrap().unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(broker.unacked_count(&queue), 0);
    assert_eq!(broker.message_count(&queue), 0);

    bus.dispose().await;
}

#[tokio::test]
async fn test_blocking_sync_handler_does_not_stall_other_subscriptions() {
    // ---
    init_logging();

    let broker = MemoryBroker::new();
    let bus = BusBuilder::new(broker.connect("isolation")).build().unwrap();
    let (entered_tx, mut entered_rx) = watch::channel(false);
    let (tx, mut rx) = mpsc::unbounded_channel();

    bus.subscribe("slow", move |_job: Job| {
        entered_tx.send_replace(true);
        std::thread::sleep(Duration::from_millis(800));
        Ok::<(), HandlerError>(())
    })
    .await
    .unwrap();

    bus.subscribe_async("fast", move |order: OrderPlaced| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(order.order_id);
            Ok::<(), HandlerError>(())
        }
    })
    .await
    .unwrap();

    bus.publish(&Job { id: 1, cost_secs: 0 }).await.unwrap();
    timeout(RECV_TIMEOUT, entered_rx.wait_for(|entered| *entered))
        .await
        .unwrap()
        .unwrap();

    bus.publish(&OrderPlaced {
        order_id: 9,
        region: "eu".into(),
    })
    .await
    .unwrap();

    let handled = timeout(Duration::from_millis(400), rx.recv())
        .await
        .expect("the fast subscription must not wait for the slow handler");
    assert_eq!(handled, Some(9));

    bus.dispose().await;
}
