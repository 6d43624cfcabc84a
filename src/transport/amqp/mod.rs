// src/transport/amqp/mod.rs

//! AMQP protocol transports.
//!
//! This module contains transport implementations for AMQP-based brokers.
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ)

mod lapin;

pub use self::lapin::{create_transport as create_lapin_transport, AmqpTransport};
