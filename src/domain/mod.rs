// src/domain/mod.rs

//! Domain layer public interface.
//!
//! This module defines the transport-facing abstractions shared by the
//! subscriber, consumer and rpc layers. Nothing here knows about a concrete
//! broker client.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod transport;

pub use transport::{
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
