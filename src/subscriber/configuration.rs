// src/subscriber/configuration.rs

//! Immutable subscriber configuration produced by the builder.

use std::fmt;
use std::sync::Arc;

use super::handler::HandlerFn;
use crate::macros::log_debug;
use crate::{ExchangeKind, QueueHandle, QueueSpec, Result, TransportPtr};

/// Where a subscription's messages come from.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriberTopology {
    /// Consume a queue that already exists; nothing is declared.
    Existing(QueueHandle),

    /// Declare a durable queue, a topic exchange, and bindings between them.
    Declared {
        /// Queue to declare (name from the conventions).
        queue: QueueSpec,
        /// Topic exchange the message type is published to.
        exchange: String,
        /// One binding per entry; `"#"` when no topic was requested.
        routing_keys: Vec<String>,
    },
}

impl SubscriberTopology {
    /// Queue name this topology consumes.
    pub fn queue_name(&self) -> &str {
        // ---
        match self {
            SubscriberTopology::Existing(handle) => &handle.name,
            SubscriberTopology::Declared { queue, .. } => &queue.name,
        }
    }

    /// Ensure the topology exists on the transport and return the queue to
    /// consume.
    pub(crate) async fn declare(&self, transport: &TransportPtr) -> Result<QueueHandle> {
        // ---
        match self {
            SubscriberTopology::Existing(handle) => Ok(handle.clone()),

            SubscriberTopology::Declared {
                queue,
                exchange,
                routing_keys,
            } => {
                let handle = transport.declare_queue(queue.clone()).await?;
                let exchange = transport.declare_exchange(exchange, ExchangeKind::Topic).await?;
                transport.bind(&handle, &exchange, routing_keys).await?;

                log_debug!(
                    "declared queue '{}' bound to '{}' with {:?}",
                    handle.name,
                    exchange.name,
                    routing_keys
                );
                Ok(handle)
            }
        }
    }
}

/// The resolved, immutable description of one subscription.
///
/// Built once by [`SubscriberBuilder::build`](super::SubscriberBuilder::build)
/// and then only read; cloning is cheap and shares the handler.
#[derive(Clone)]
pub struct SubscriberConfiguration {
    // ---
    pub(crate) topology: SubscriberTopology,
    pub(crate) topics: Vec<String>,
    pub(crate) prefetch_count: u16,
    pub(crate) is_highly_available: bool,
    pub(crate) expected_type_name: Option<Arc<str>>,
    pub(crate) handler: HandlerFn,
}

impl SubscriberConfiguration {
    /// Queue topology this subscription consumes.
    pub fn topology(&self) -> &SubscriberTopology {
        &self.topology
    }

    /// Requested topics, deduplicated, in first-seen order.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Prefetch credit granted to the consumer (0 means unbounded).
    pub fn prefetch_count(&self) -> u16 {
        self.prefetch_count
    }

    /// Whether the derived queue is declared highly available.
    pub fn is_highly_available(&self) -> bool {
        self.is_highly_available
    }

    /// Type name every delivery must carry, or `None` for raw handlers.
    pub fn expected_type_name(&self) -> Option<&str> {
        self.expected_type_name.as_deref()
    }
}

impl fmt::Debug for SubscriberConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberConfiguration")
            .field("topology", &self.topology)
            .field("topics", &self.topics)
            .field("prefetch_count", &self.prefetch_count)
            .field("is_highly_available", &self.is_highly_available)
            .field("expected_type_name", &self.expected_type_name)
            .finish_non_exhaustive()
    }
}
