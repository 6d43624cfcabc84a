// src/transport/mod.rs

//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`Transport`](crate::Transport) trait. Broker-backed transports are hidden
//! behind feature flags; the in-memory transport is always available.
//!
//! Domain code must not depend on transport-specific types.

pub mod memory;

#[cfg(feature = "transport_lapin")]
pub mod amqp;

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_transport;

pub use memory::create_memory_transport;
