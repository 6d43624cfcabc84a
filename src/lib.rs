// src/lib.rs

//! Subscription dispatch and RPC correlation over message-queue transports
//!
//! This library puts a typed message bus on top of an AMQP-style broker. It
//! handles queue and exchange declaration, prefetch-bounded dispatch of
//! deliveries to handlers, ack/nack decisions after handler failures, and
//! request/response correlation over private reply queues.
//!
//! The in-memory transport ([`transport::memory`]) is always available and
//! defines the reference semantics. A RabbitMQ transport built on `lapin` is
//! available behind the `transport_lapin` feature.

// Import all sub modules once...
mod macros;

mod bus;
mod bus_builder;
mod bus_config;
mod connectivity;
mod consumer;
mod conventions;
mod correlation;
mod domain;
mod error;
mod message;
mod rpc;
mod subscriber;

pub mod transport;

// Re-export main types
pub use bus::{Bus, SubscriptionHandle};
pub use bus_builder::BusBuilder;
pub use bus_config::BusConfig;

pub use correlation::CorrelationId;
pub use error::{BusError, HandlerError, Result};

pub use conventions::{Conventions, DefaultConventions, DEFAULT_RPC_EXCHANGE};
pub use message::Message;
pub use rpc::ERROR_HEADER;

pub use consumer::{
    // ---
    ConsumerErrorStrategy,
    ConsumerExecutionContext,
    DefaultConsumerErrorStrategy,
    DispatchState,
    ErrorStrategyPtr,
    PostExceptionAckStrategy,
};

pub use subscriber::{
    // ---
    BuildContext,
    ReceivedInfo,
    SubscriberBuilder,
    SubscriberConfiguration,
    SubscriberTopology,
    HA_POLICY_ARGUMENT,
    MATCH_ALL_TOPICS,
};

pub use transport::create_memory_transport;

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    Address,
    ConnectionEvent,
    ConsumerHandle,
    ConsumerTag,
    Delivery,
    DeliveryTag,
    Envelope,
    ExchangeHandle,
    ExchangeKind,
    Headers,
    QueueHandle,
    QueueSpec,
    Transport,
    TransportPtr,
};
