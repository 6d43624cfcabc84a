// src/consumer/error_strategy.rs

//! Consumer error strategy.
//!
//! When a handler fails (or a delivery fails type verification) the
//! dispatcher asks the bus's [`ConsumerErrorStrategy`] what to do with the
//! delivery. The strategy only decides; the dispatcher performs the ack or
//! nack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::macros::{log_error, log_warn};
use crate::{BusError, ConsumerTag, DeliveryTag, Envelope};

/// What the dispatcher should do with a delivery whose handling failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PostExceptionAckStrategy {
    /// Acknowledge it; the message is dropped.
    AckAndDiscard,
    /// Reject it without requeue; the broker dead-letters or drops it.
    NackWithoutRequeue,
    /// Reject it and put it back on the queue.
    NackWithRequeue,
    /// Leave it unacknowledged; the strategy has taken ownership.
    DoNothing,
}

/// Everything known about a failed delivery.
#[derive(Debug)]
pub struct ConsumerExecutionContext<'a> {
    /// Queue the delivery came from.
    pub queue: &'a str,
    /// Consumer that received it.
    pub consumer_tag: &'a ConsumerTag,
    /// Tag the decision applies to.
    pub delivery_tag: DeliveryTag,
    /// Whether the broker reported an earlier delivery.
    pub redelivered: bool,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    /// The failed envelope.
    pub envelope: &'a Envelope,
}

/// Decides the ack outcome of failed deliveries.
///
/// One strategy is shared by every subscription of a bus, so implementations
/// must be safe to call concurrently.
pub trait ConsumerErrorStrategy: Send + Sync {
    /// Decide what happens to a delivery that failed with `error`.
    fn handle_consumer_error(
        &self,
        context: &ConsumerExecutionContext<'_>,
        error: &BusError,
    ) -> PostExceptionAckStrategy;

    /// Called once when the owning bus starts disposing, before its
    /// dispatchers stop. Decisions for deliveries still in flight are asked
    /// for after this call.
    fn dispose(&self) {}
}

/// Shared strategy pointer.
pub type ErrorStrategyPtr = Arc<dyn ConsumerErrorStrategy>;

/// Strategy used unless the bus is built with another one.
///
/// - Deliveries that can never succeed (wrong type name, undecodable body)
///   are rejected without requeue on first failure.
/// - Other failures are requeued while `attempt <= max_requeue_attempts`, then
///   rejected without requeue so a poison message cannot cycle forever.
/// - After [`dispose`](ConsumerErrorStrategy::dispose), every failure is
///   requeued so messages in flight during shutdown are not lost.
#[derive(Debug)]
pub struct DefaultConsumerErrorStrategy {
    // ---
    max_requeue_attempts: u32,
    disposed: AtomicBool,
}

impl DefaultConsumerErrorStrategy {
    /// Create a strategy allowing `max_requeue_attempts` requeues per message.
    pub fn new(max_requeue_attempts: u32) -> Self {
        Self {
            max_requeue_attempts,
            disposed: AtomicBool::new(false),
        }
    }

    /// Requeue bound this strategy was built with.
    pub fn max_requeue_attempts(&self) -> u32 {
        self.max_requeue_attempts
    }
}

impl Default for DefaultConsumerErrorStrategy {
    fn default() -> Self {
        Self::new(crate::BusConfig::DEFAULT_MAX_REQUEUE_ATTEMPTS)
    }
}

impl ConsumerErrorStrategy for DefaultConsumerErrorStrategy {
    fn handle_consumer_error(
        &self,
        context: &ConsumerExecutionContext<'_>,
        error: &BusError,
    ) -> PostExceptionAckStrategy {
        // ---
        // Type mismatches were already reported by the verifier.
        if !matches!(error, BusError::MessageTypeMismatch { .. }) {
            log_error!(
                "failed to handle delivery {} from queue '{}' (type '{}', attempt {}): {error}",
                context.delivery_tag,
                context.queue,
                context.envelope.type_name,
                context.attempt
            );
        }

        if self.disposed.load(Ordering::Acquire) {
            return PostExceptionAckStrategy::NackWithRequeue;
        }

        if matches!(
            error,
            BusError::MessageTypeMismatch { .. } | BusError::Serialization(_)
        ) {
            log_warn!(
                "delivery {} on '{}' can never be handled; rejecting without requeue",
                context.delivery_tag,
                context.queue
            );
            return PostExceptionAckStrategy::NackWithoutRequeue;
        }

        if context.attempt <= self.max_requeue_attempts {
            PostExceptionAckStrategy::NackWithRequeue
        } else {
            log_warn!(
                "delivery {} on '{}' failed {} times; rejecting without requeue",
                context.delivery_tag,
                context.queue,
                context.attempt
            );
            PostExceptionAckStrategy::NackWithoutRequeue
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}
