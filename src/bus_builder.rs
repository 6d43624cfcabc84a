// src/bus_builder.rs

//! Bus builder.
//!
//! Provides a fluent builder API for configuring a [`Bus`] with its
//! transport, naming conventions, error strategy and tunables.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    // ---
    Bus,
    BusConfig,
    BusError,
    ConsumerErrorStrategy,
    Conventions,
    DefaultConsumerErrorStrategy,
    DefaultConventions,
    Result,
    TransportPtr,
};

/// Builder for [`Bus`] instances.
///
/// Only the transport is required. Everything else falls back to
/// [`DefaultConventions`], [`DefaultConsumerErrorStrategy`] and
/// [`BusConfig::default`].
///
/// # Examples
///
/// ```
/// use mom_bus::transport::memory::MemoryBroker;
/// use mom_bus::BusBuilder;
/// use std::time::Duration;
///
/// # async fn example() -> mom_bus::Result<()> {
/// let broker = MemoryBroker::new();
/// let bus = BusBuilder::new(broker.connect("worker"))
///     .default_prefetch_count(1)
///     .request_timeout(Duration::from_secs(5))
///     .build()?;
///
/// assert!(bus.is_connected());
/// bus.dispose().await;
/// # Ok(())
/// # }
/// ```
pub struct BusBuilder {
    // ---
    transport: TransportPtr,
    conventions: Option<Arc<dyn Conventions>>,
    error_strategy: Option<Arc<dyn ConsumerErrorStrategy>>,
    config: BusConfig,
}

impl BusBuilder {
    /// Create a builder for a bus on `transport`.
    ///
    /// The bus takes ownership of the connection and closes it on dispose.
    pub fn new(transport: TransportPtr) -> Self {
        // ---
        Self {
            transport,
            conventions: None,
            error_strategy: None,
            config: BusConfig::default(),
        }
    }

    /// Replace the naming conventions.
    pub fn conventions(mut self, conventions: impl Conventions + 'static) -> Self {
        self.conventions = Some(Arc::new(conventions));
        self
    }

    /// Replace the consumer error strategy.
    ///
    /// When set, [`max_requeue_attempts`](Self::max_requeue_attempts) has no
    /// effect; it only configures the default strategy.
    pub fn error_strategy(mut self, strategy: impl ConsumerErrorStrategy + 'static) -> Self {
        self.error_strategy = Some(Arc::new(strategy));
        self
    }

    /// Replace all tunables at once.
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the prefetch used by subscriptions that set none.
    ///
    /// Default: 50.
    pub fn default_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.config.default_prefetch_count = prefetch_count;
        self
    }

    /// Set how long RPC callers wait for a response.
    ///
    /// Default: 30s.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set how often responders re-check the connection.
    ///
    /// Default: 100ms.
    pub fn connect_poll_interval(mut self, interval: Duration) -> Self {
        self.config.connect_poll_interval = interval;
        self
    }

    /// Set the requeue bound of the default error strategy.
    ///
    /// Default: 3.
    pub fn max_requeue_attempts(mut self, attempts: u32) -> Self {
        self.config.max_requeue_attempts = attempts;
        self
    }

    /// Build the bus (consumes self).
    pub fn build(self) -> Result<Bus> {
        // ---
        if self.config.connect_poll_interval.is_zero() {
            return Err(BusError::Configuration(
                "connect_poll_interval must be greater than zero".into(),
            ));
        }
        if self.config.request_timeout.is_zero() {
            return Err(BusError::Configuration(
                "request_timeout must be greater than zero".into(),
            ));
        }

        let conventions = self
            .conventions
            .unwrap_or_else(|| Arc::new(DefaultConventions));
        let error_strategy = self.error_strategy.unwrap_or_else(|| {
            Arc::new(DefaultConsumerErrorStrategy::new(
                self.config.max_requeue_attempts,
            ))
        });

        Ok(Bus::new(self.transport, conventions, error_strategy, self.config))
    }
}
