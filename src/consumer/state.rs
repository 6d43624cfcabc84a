// src/consumer/state.rs

use std::fmt;

/// Lifecycle of one subscription's dispatch loop.
///
/// ```text
/// Idle -> AwaitingDelivery -> Dispatching -> Acking  -> AwaitingDelivery
///                                         -> Nacking -> AwaitingDelivery
/// any state -> Stopped (disposal or end of the delivery stream)
/// ```
///
/// `Stopped` is terminal: a stopped consumer is never restarted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatchState {
    /// Consumer registered, loop not yet running.
    Idle,
    /// Waiting for the transport to hand over a delivery.
    AwaitingDelivery,
    /// Verifying and running the handler for one delivery.
    Dispatching,
    /// Acknowledging a handled (or discarded) delivery.
    Acking,
    /// Negatively acknowledging a failed delivery.
    Nacking,
    /// Loop finished; no further deliveries will be handled.
    Stopped,
}

impl DispatchState {
    /// True once the loop has ended.
    pub fn is_stopped(self) -> bool {
        self == DispatchState::Stopped
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Idle => "idle",
            DispatchState::AwaitingDelivery => "awaiting-delivery",
            DispatchState::Dispatching => "dispatching",
            DispatchState::Acking => "acking",
            DispatchState::Nacking => "nacking",
            DispatchState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
