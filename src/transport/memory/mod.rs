// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the transport
//! layer. All other transport implementations are expected to approximate this
//! behavior as closely as their underlying systems allow and to document any
//! unavoidable deviations.
//!
//! In particular, the in-memory broker establishes the following expectations:
//!
//! - Once `consume()` returns, the consumer takes part in dispatch from the
//!   queue, after the consumers that attached before it.
//! - Ready messages go round robin to consumers that still have prefetch
//!   credit; a consumer at its limit is skipped until it acks or nacks.
//! - A nack with requeue puts the message back at the head of its queue,
//!   marked redelivered, with its delivery attempt counted.
//! - Routing follows AMQP: the default exchange routes by queue name, direct
//!   exchanges by exact key, topic exchanges by `*`/`#` word patterns.
//!
//! ## Non-Goals
//!
//! This transport does not attempt to emulate the persistence or clustering
//! of any specific broker. It exists to provide a clear, deterministic
//! baseline against which higher-level behavior can be validated.

mod broker;
mod topic;
mod transport;

pub use broker::MemoryBroker;
pub use transport::{create_memory_transport, global_broker, MemoryTransport};
