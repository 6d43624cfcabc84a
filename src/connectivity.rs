// src/connectivity.rs

//! Waiting for the transport to be usable.

use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::macros::{log_debug, log_warn};
use crate::{BusError, Result, TransportPtr};

/// Block until `transport` reports a live connection.
///
/// Re-checks every `poll_interval`, and immediately whenever the transport
/// announces a connection change. A connected transport always wins, even
/// after shutdown has begun. While disconnected, returns
/// [`BusError::Shutdown`] as soon as `shutdown` flips to true (or its sender
/// is gone), so a disposed bus never leaves callers parked here.
pub(crate) async fn wait_for_connection(
    transport: &TransportPtr,
    poll_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    // ---
    let mut events = Some(transport.connection_events());
    let mut warned = false;

    loop {
        if transport.is_connected() {
            if warned {
                log_debug!("transport {} reconnected", transport.transport_id());
            }
            return Ok(());
        }
        if *shutdown.borrow() {
            return Err(BusError::Shutdown);
        }
        if !warned {
            log_warn!(
                "transport {} is disconnected; waiting before publishing",
                transport.transport_id()
            );
            warned = true;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Err(BusError::Shutdown);
                }
            }

            event = next_event(&mut events) => {
                if let Err(broadcast::error::RecvError::Closed) = event {
                    events = None;
                }
            }

            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

// Pends forever once the event stream has closed, leaving the poll to do the
// work.
async fn next_event(
    events: &mut Option<broadcast::Receiver<crate::ConnectionEvent>>,
) -> std::result::Result<crate::ConnectionEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
