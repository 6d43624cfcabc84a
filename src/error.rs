// src/error.rs

use std::time::Duration;

use thiserror::Error;

/// Failure type produced by application handlers and RPC responders.
///
/// Anything implementing `std::error::Error + Send + Sync` converts into it
/// with `?` or `.into()`, including plain strings.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the bus, its subscriptions and its RPC engine.
#[derive(Error, Debug)]
pub enum BusError {
    /// The subscriber or bus builder was used incorrectly.
    ///
    /// Raised by `build()`; never produced while a subscription is running.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A delivery declared a different type name than the subscription expects.
    #[error("message type is incorrect: expected '{expected}', but was '{actual}'")]
    MessageTypeMismatch {
        /// Type name the subscription was built for.
        expected: String,
        /// Type name carried by the delivery (empty when absent).
        actual: String,
    },

    /// An application handler returned an error or panicked.
    #[error("handler fault: {0}")]
    HandlerFault(HandlerError),

    /// The remote responder failed while handling an RPC request.
    ///
    /// Distinct from [`BusError::TransportDisconnected`]: the request reached
    /// the responder, which then reported a failure.
    #[error("responder failed: {0}")]
    Responder(String),

    /// The transport is not connected to its broker.
    #[error("transport disconnected")]
    TransportDisconnected,

    /// Any other transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The bus was disposed while the operation was outstanding.
    #[error("bus has been shut down")]
    Shutdown,

    /// No RPC response arrived within the configured bound.
    #[error("rpc request timed out after {0:?}")]
    RpcTimeout(Duration),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Ack or nack referred to a delivery the transport no longer tracks.
    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),
}

impl BusError {
    /// Wrap any handler-side failure as [`BusError::HandlerFault`].
    pub fn handler_fault(err: impl Into<HandlerError>) -> Self {
        // ---
        BusError::HandlerFault(err.into())
    }
}

/// Result type alias for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_mismatch_message_names_both_types() {
        // ---
        let err = BusError::MessageTypeMismatch {
            expected: "orders.Placed".into(),
            actual: "orders.Cancelled".into(),
        };
        let text = err.to_string();
        assert!(text.contains("'orders.Placed'"));
        assert!(text.contains("'orders.Cancelled'"));
    }

    #[test]
    fn test_handler_fault_from_str() {
        // ---
        let err = BusError::handler_fault("boom");
        assert!(matches!(err, BusError::HandlerFault(_)));
        assert_eq!(err.to_string(), "handler fault: boom");
    }
}
