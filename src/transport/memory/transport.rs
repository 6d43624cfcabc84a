// src/transport/memory/transport.rs

//! One connection to a [`MemoryBroker`].
//!
//! The memory transport is the **reference implementation** of transport
//! semantics. Other transports are expected to approximate this behavior
//! as closely as their underlying systems allow and to document any
//! unavoidable deviations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;

use super::broker::MemoryBroker;
use crate::macros::{log_debug, log_warn};
use crate::{
    // ---
    BusError,
    ConnectionEvent,
    ConsumerHandle,
    ConsumerTag,
    DeliveryTag,
    Envelope,
    ExchangeHandle,
    ExchangeKind,
    QueueHandle,
    QueueSpec,
    Result,
    Transport,
    TransportPtr,
};

/// In-memory transport connection.
///
/// Every operation goes straight to the shared broker, so once an await on
/// this transport returns, its effect is visible to every other connection.
///
/// ## Semantics
///
/// - Deliveries are pushed to consumers within their prefetch credit.
/// - While disconnected every operation fails with
///   [`BusError::TransportDisconnected`].
/// - Disconnecting cancels this connection's consumers (their unacknowledged
///   deliveries return to the queue) and deletes its exclusive queues.
///
/// ## Non-Goals
///
/// - Persistence or durability across process restarts
/// - Network behavior beyond the simulated disconnect/reconnect
pub struct MemoryTransport {
    // ---
    transport_id: String,
    connection: u64,
    broker: Arc<MemoryBroker>,
    connected: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl MemoryTransport {
    pub(super) fn new(transport_id: String, connection: u64, broker: Arc<MemoryBroker>) -> Self {
        // ---
        let (events, _) = broadcast::channel(16);
        Self {
            transport_id,
            connection,
            broker,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            events,
        }
    }

    /// The broker this connection belongs to.
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Drop the connection as a network failure would.
    pub fn simulate_disconnect(&self) {
        // ---
        if self.connected.swap(false, Ordering::AcqRel) {
            self.broker.disconnect(self.connection);
            log_warn!("memory transport {} disconnected", self.transport_id);
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
    }

    /// Restore a connection dropped by [`simulate_disconnect`](Self::simulate_disconnect).
    ///
    /// Consumers cancelled by the disconnect are not restored.
    pub fn simulate_reconnect(&self) {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            log_debug!("memory transport {} reconnected", self.transport_id);
            let _ = self.events.send(ConnectionEvent::Connected);
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        // ---
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::TransportDisconnected)
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<QueueHandle> {
        self.ensure_connected()?;
        self.broker.declare_queue(self.connection, spec)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<ExchangeHandle> {
        self.ensure_connected()?;
        self.broker.declare_exchange(name, kind)
    }

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_keys: &[String],
    ) -> Result<()> {
        // ---
        self.ensure_connected()?;
        if exchange.is_default() {
            return Err(BusError::Transport("the default exchange cannot be bound".into()));
        }
        self.broker.bind(&queue.name, &exchange.name, routing_keys)
    }

    async fn consume(&self, queue: &QueueHandle, prefetch_count: u16) -> Result<ConsumerHandle> {
        self.ensure_connected()?;
        self.broker.consume(self.connection, &queue.name, prefetch_count)
    }

    async fn cancel(&self, consumer_tag: &ConsumerTag) -> Result<()> {
        // ---
        self.ensure_connected()?;
        self.broker.cancel(&consumer_tag.0);
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_connected()?;
        self.broker.ack(tag.0)
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.ensure_connected()?;
        self.broker.nack(tag.0, requeue)
    }

    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<()> {
        // ---
        self.ensure_connected()?;
        self.broker.publish(&exchange.name, routing_key, envelope)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Close the connection. Closing twice is a no-op.
    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            self.broker.disconnect(self.connection);
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
        log_debug!("memory transport {} closed", self.transport_id);
        Ok(())
    }
}

static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

/// Broker shared by every transport created with [`create_memory_transport`].
pub fn global_broker() -> Arc<MemoryBroker> {
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}

/// Create an in-memory transport on the process-wide broker.
///
/// This transport is always available and requires no external resources.
/// Use [`MemoryBroker::connect`] instead when a test needs an isolated broker.
pub fn create_memory_transport(transport_id: impl Into<String>) -> TransportPtr {
    global_broker().connect(transport_id)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_operations_fail_while_disconnected() {
        // ---
        let broker = MemoryBroker::new();
        let conn = broker.connect("conn");
        let mut events = conn.connection_events();

        conn.simulate_disconnect();
        assert!(!conn.is_connected());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnected);

        let outcome = conn
            .publish(
                &ExchangeHandle::default_exchange(),
                "q",
                Envelope::new("T", Bytes::new()),
            )
            .await;
        assert!(matches!(outcome, Err(BusError::TransportDisconnected)));

        conn.simulate_reconnect();
        assert!(conn.is_connected());
        assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_requeues_held_deliveries() {
        // ---
        let broker = MemoryBroker::new();
        let worker = broker.connect("worker");
        let publisher = broker.connect("publisher");

        let queue = worker.declare_queue(QueueSpec::durable("jobs")).await.unwrap();
        let _consumer = worker.consume(&queue, 10).await.unwrap();
        for _ in 0..3 {
            publisher
                .publish(&ExchangeHandle::default_exchange(), "jobs", Envelope::new("T", Bytes::new()))
                .await
                .unwrap();
        }
        assert_eq!(broker.unacked_count("jobs"), 3);

        worker.simulate_disconnect();
        assert_eq!(broker.unacked_count("jobs"), 0);
        assert_eq!(broker.message_count("jobs"), 3);
        assert_eq!(broker.consumer_count("jobs"), 0);
    }

    #[tokio::test]
    async fn test_close_cannot_be_undone() {
        // ---
        let broker = MemoryBroker::new();
        let conn = broker.connect("conn");
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        conn.simulate_reconnect();
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_default_exchange_cannot_be_bound() {
        // ---
        let broker = MemoryBroker::new();
        let conn = broker.connect("conn");
        let queue = conn.declare_queue(QueueSpec::durable("q")).await.unwrap();
        let outcome = conn
            .bind(&queue, &ExchangeHandle::default_exchange(), &["q".to_string()])
            .await;
        assert!(outcome.is_err());
    }
}
