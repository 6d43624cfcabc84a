// src/bus_config.rs

//! Public, transport-agnostic bus configuration.
//!
//! This type contains no transport-specific concepts. Transport layers are
//! configured separately when the transport is created.

use std::time::Duration;

/// Tunables shared by every subscription and RPC call of a bus.
///
/// # Example
///
/// ```
/// use mom_bus::BusConfig;
/// use std::time::Duration;
///
/// let config = BusConfig::default()
///     .with_default_prefetch_count(1)
///     .with_request_timeout(Duration::from_secs(5));
///
/// assert_eq!(config.default_prefetch_count, 1);
/// assert_eq!(config.max_requeue_attempts, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    // ---
    /// Prefetch applied to subscriptions that do not set their own.
    ///
    /// Default: 50. Use 1 for fair dispatch between competing consumers of
    /// uneven cost; 0 removes the bound entirely.
    pub default_prefetch_count: u16,

    /// How long an RPC caller waits for its response.
    ///
    /// Default: 30 seconds
    pub request_timeout: Duration,

    /// How often a responder re-checks the connection while waiting to
    /// publish a response.
    ///
    /// Default: 100 milliseconds
    pub connect_poll_interval: Duration,

    /// Requeues the default error strategy allows before rejecting a message
    /// for good.
    ///
    /// Default: 3
    pub max_requeue_attempts: u32,
}

impl BusConfig {
    /// Default prefetch for subscriptions.
    pub const DEFAULT_PREFETCH_COUNT: u16 = 50;
    /// Default RPC wait.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default connection poll interval.
    pub const DEFAULT_CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Default requeue bound.
    pub const DEFAULT_MAX_REQUEUE_ATTEMPTS: u32 = 3;

    /// Set the default prefetch count.
    pub fn with_default_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.default_prefetch_count = prefetch_count;
        self
    }

    /// Set the RPC request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the connection poll interval.
    pub fn with_connect_poll_interval(mut self, interval: Duration) -> Self {
        self.connect_poll_interval = interval;
        self
    }

    /// Set the requeue bound used by the default error strategy.
    pub fn with_max_requeue_attempts(mut self, attempts: u32) -> Self {
        self.max_requeue_attempts = attempts;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_prefetch_count: Self::DEFAULT_PREFETCH_COUNT,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
            connect_poll_interval: Self::DEFAULT_CONNECT_POLL_INTERVAL,
            max_requeue_attempts: Self::DEFAULT_MAX_REQUEUE_ATTEMPTS,
        }
    }
}
