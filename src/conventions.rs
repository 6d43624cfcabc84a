// src/conventions.rs

//! Naming policy for derived queues and exchanges.

use uuid::Uuid;

/// Injected naming policy.
///
/// Subscriptions declared by subscription id derive their queue and exchange
/// names through this trait, as does the RPC engine. Two subscriptions built
/// with the same type and subscription id therefore share one queue and split
/// its messages between them.
pub trait Conventions: Send + Sync {
    /// Exchange that messages of `type_name` are published to.
    fn exchange_name(&self, type_name: &str) -> String;

    /// Queue for `type_name` consumed under `subscription_id`.
    fn queue_name(&self, type_name: &str, subscription_id: &str) -> String;

    /// Direct exchange RPC requests are routed through.
    fn rpc_exchange_name(&self) -> String;

    /// Name for a fresh private RPC reply queue.
    fn rpc_return_queue_name(&self) -> String;
}

/// Naming used unless another [`Conventions`] is supplied.
///
/// | name                 | value                         |
/// |----------------------|-------------------------------|
/// | exchange             | `{type}`                      |
/// | queue                | `{type}_{subscription_id}`    |
/// | rpc exchange         | `mom_bus_rpc`                 |
/// | rpc return queue     | `mom_bus.response.{uuid}`     |
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConventions;

/// Exchange every RPC request goes through under [`DefaultConventions`].
pub const DEFAULT_RPC_EXCHANGE: &str = "mom_bus_rpc";

impl Conventions for DefaultConventions {
    fn exchange_name(&self, type_name: &str) -> String {
        type_name.to_string()
    }

    fn queue_name(&self, type_name: &str, subscription_id: &str) -> String {
        format!("{type_name}_{subscription_id}")
    }

    fn rpc_exchange_name(&self) -> String {
        DEFAULT_RPC_EXCHANGE.to_string()
    }

    fn rpc_return_queue_name(&self) -> String {
        format!("mom_bus.response.{}", Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_queue_name_joins_type_and_subscription() {
        // ---
        let conventions = DefaultConventions;
        assert_eq!(conventions.queue_name("app.Work", "workers"), "app.Work_workers");
        assert_eq!(conventions.exchange_name("app.Work"), "app.Work");
    }

    #[test]
    fn test_return_queues_are_unique() {
        // ---
        let conventions = DefaultConventions;
        assert_ne!(
            conventions.rpc_return_queue_name(),
            conventions.rpc_return_queue_name()
        );
    }
}
