// src/consumer/mod.rs

//! Delivery dispatch.
//!
//! Turns a [`SubscriberConfiguration`](crate::SubscriberConfiguration) into a
//! running consumer: deliveries flow from the transport through type
//! verification and the handler, and each one ends in exactly one ack, nack,
//! or explicit hand-off decided by the [`ConsumerErrorStrategy`].

mod dispatcher;
mod error_strategy;
mod state;

pub(crate) use dispatcher::RunningDispatcher;
pub use error_strategy::{
    // ---
    ConsumerErrorStrategy,
    ConsumerExecutionContext,
    DefaultConsumerErrorStrategy,
    ErrorStrategyPtr,
    PostExceptionAckStrategy,
};
pub use state::DispatchState;
