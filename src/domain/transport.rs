// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the contract between the dispatch/RPC core and a
//! message-queue transport. It speaks in broker concepts (queues, exchanges,
//! bindings, prefetch credit, delivery tags) but never in terms of a concrete
//! client library.
//!
//! The transport is responsible for:
//! - declaring topology and routing published envelopes through it,
//! - granting each consumer at most `prefetch_count` unacknowledged deliveries,
//! - tracking delivery tags until they are acked or nacked.
//!
//! Type checking, handler invocation, ack decisions and RPC correlation are
//! handled by higher layers.
//!
//! Concrete implementations live under `src/transport/`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::{CorrelationId, Result};

/// Header values carried alongside an envelope.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// A transport address, used for reply routing.
///
/// For AMQP-style transports this is a queue name reachable through the
/// default exchange.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message envelope: a serialized payload plus delivery metadata.
///
/// Envelopes are built by publishers (or by the transport on receipt) and are
/// treated as immutable once delivered. The transport never interprets the
/// body; `type_name` is what subscribers verify before decoding it.
///
/// # Example
///
/// ```
/// # use mom_bus::{Address, CorrelationId, Envelope};
/// # use bytes::Bytes;
/// let request = Envelope::request(
///     "billing.Invoice",
///     Bytes::from_static(b"{\"amount\":12}"),
///     CorrelationId::generate(),
///     Address::from("mom_bus.response.client-1"),
/// );
/// assert!(request.reply_to.is_some());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    // ---
    /// Serialized type name of the payload.
    pub type_name: Arc<str>,

    /// Opaque payload bytes (JSON for typed messages).
    pub body: Bytes,

    /// Correlation identifier; set on RPC requests and responses.
    pub correlation_id: Option<CorrelationId>,

    /// Where responses to this envelope must be sent.
    pub reply_to: Option<Address>,

    /// Free-form headers.
    pub headers: Headers,
}

impl Envelope {
    // ---
    /// Create an envelope with only a type name and body.
    pub fn new(type_name: impl Into<Arc<str>>, body: Bytes) -> Self {
        Self {
            type_name: type_name.into(),
            body,
            correlation_id: None,
            reply_to: None,
            headers: Headers::new(),
        }
    }

    /// Create an RPC request envelope.
    ///
    /// # Arguments
    ///
    /// * `type_name` - Serialized request type name
    /// * `body` - Serialized request
    /// * `correlation_id` - Identifier the response will echo
    /// * `reply_to` - Private queue of the caller
    pub fn request(
        type_name: impl Into<Arc<str>>,
        body: Bytes,
        correlation_id: CorrelationId,
        reply_to: Address,
    ) -> Self {
        Self::new(type_name, body)
            .with_correlation_id(correlation_id)
            .with_reply_to(reply_to)
    }

    /// Create an RPC response envelope echoing `correlation_id`.
    pub fn response(
        type_name: impl Into<Arc<str>>,
        body: Bytes,
        correlation_id: CorrelationId,
    ) -> Self {
        Self::new(type_name, body).with_correlation_id(correlation_id)
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set the reply address.
    pub fn with_reply_to(mut self, reply_to: Address) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Add or replace a header.
    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// Look up a header holding a string value.
    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|value| value.as_str())
    }
}

/// Transport-assigned identifier of one delivery, used to ack or nack it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-assigned identifier of one consumer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub Arc<str>);

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message handed to a consumer, not yet acknowledged.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Tag to ack or nack with.
    pub tag: DeliveryTag,
    /// Consumer the transport delivered to.
    pub consumer_tag: ConsumerTag,
    /// Queue the message was taken from.
    pub queue: Arc<str>,
    /// True if the message was delivered before and requeued.
    pub redelivered: bool,
    /// 1 on first delivery, incremented on each redelivery when the transport
    /// can tell; otherwise 1 or 2 depending on `redelivered`.
    pub attempt: u32,
    /// The delivered envelope.
    pub envelope: Envelope,
}

/// Kind of exchange, determining how routing keys are matched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Exact routing-key equality.
    Direct,
    /// Dot-separated words with `*` and `#` wildcards in bindings.
    Topic,
}

/// A declared exchange.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExchangeHandle {
    /// Exchange name; empty for the default exchange.
    pub name: Arc<str>,
    /// Routing semantics.
    pub kind: ExchangeKind,
}

impl ExchangeHandle {
    /// The default exchange: routes by queue name, needs no declaration.
    pub fn default_exchange() -> Self {
        Self {
            name: Arc::from(""),
            kind: ExchangeKind::Direct,
        }
    }

    /// True for the default exchange.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }
}

/// Parameters for declaring a queue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Survives broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection and removed with it.
    pub exclusive: bool,
    /// Removed once its last consumer is cancelled.
    pub auto_delete: bool,
    /// Broker-specific arguments (`x-ha-policy`, ...).
    pub arguments: Headers,
}

impl QueueSpec {
    /// A durable, shared queue as used for subscriptions.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Headers::new(),
        }
    }

    /// A private queue (exclusive, auto-delete, non-durable), as used for RPC
    /// replies.
    pub fn private(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: true,
            auto_delete: true,
            arguments: Headers::new(),
        }
    }

    /// Add a declaration argument.
    pub fn with_argument(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }
}

/// A declared (or pre-existing) queue.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    /// Queue name.
    pub name: Arc<str>,
}

impl QueueHandle {
    /// Refer to a queue that already exists on the broker.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }
}

/// Connection state changes reported by a transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport (re)established its broker connection.
    Connected,
    /// The transport lost its broker connection.
    Disconnected,
}

/// Handle returned from [`Transport::consume`].
///
/// The inbox is an infinite sequence: it only ends when the consumer is
/// cancelled or the connection drops, and it cannot be restarted afterwards.
pub struct ConsumerHandle {
    // ---
    /// Tag identifying this consumer to the transport.
    pub consumer_tag: ConsumerTag,

    /// Deliveries granted to this consumer, in delivery order.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Message-queue transport abstraction.
///
/// Implementations must ensure that:
/// - a consumer never holds more than `prefetch_count` unacknowledged
///   deliveries (0 meaning unbounded),
/// - every delivery tag is acked or nacked at most once,
/// - deliveries held by a cancelled consumer become available again.
///
/// The in-memory transport is the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; treat its methods as plain `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Identifier of this transport instance, used in logs.
    fn transport_id(&self) -> &str;

    /// Declare a queue (idempotent for identical specs).
    async fn declare_queue(&self, spec: QueueSpec) -> Result<QueueHandle>;

    /// Declare an exchange (idempotent for identical kinds).
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<ExchangeHandle>;

    /// Bind `queue` to `exchange` once per routing key.
    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_keys: &[String],
    ) -> Result<()>;

    /// Start consuming `queue` with the given prefetch credit.
    async fn consume(&self, queue: &QueueHandle, prefetch_count: u16) -> Result<ConsumerHandle>;

    /// Stop a consumer. Deliveries it still holds unacknowledged are returned
    /// to the queue.
    async fn cancel(&self, consumer_tag: &ConsumerTag) -> Result<()>;

    /// Positively acknowledge a delivery.
    async fn ack(&self, tag: DeliveryTag) -> Result<()>;

    /// Negatively acknowledge a delivery, optionally requeueing it.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()>;

    /// Publish an envelope through `exchange` with `routing_key`.
    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<()>;

    /// True while the broker connection is up.
    fn is_connected(&self) -> bool;

    /// Subscribe to connection state changes.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Close the transport and release its resources.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// Cheap to clone; every clone refers to the same connection.
pub type TransportPtr = Arc<dyn Transport>;
