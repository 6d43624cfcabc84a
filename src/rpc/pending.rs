// src/rpc/pending.rs

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::macros::log_debug;
use crate::{BusError, CorrelationId, Envelope, Result};

/// One outstanding request.
struct PendingRequest {
    // ---
    completion: oneshot::Sender<Result<Envelope>>,
    created_at: Instant,
    request_type: Arc<str>,
}

/// Tracks requests waiting for a response, keyed by correlation id.
///
/// Entries are locked individually, so completing one request never blocks
/// registering or completing another. Each entry is resolved at most once:
/// whichever of completion, removal, or shutdown takes it out of the map
/// wins, and later attempts find nothing.
pub(crate) struct PendingRequests {
    // ---
    requests: DashMap<CorrelationId, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        // ---
        Self {
            requests: DashMap::new(),
        }
    }

    /// Register a new pending request under a fresh correlation id.
    ///
    /// An id already present in the table is never handed out again.
    pub(crate) fn register(
        &self,
        request_type: &str,
    ) -> (CorrelationId, oneshot::Receiver<Result<Envelope>>) {
        // ---
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            completion: tx,
            created_at: Instant::now(),
            request_type: Arc::from(request_type),
        };

        loop {
            let correlation_id = CorrelationId::generate();
            match self.requests.entry(correlation_id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(request);
                    return (correlation_id, rx);
                }
                Entry::Occupied(_) => {
                    log_debug!("correlation id {correlation_id} already pending; generating another");
                }
            }
        }
    }

    /// Resolve a pending request.
    ///
    /// Returns true if the id was pending. The waiting caller may already have
    /// given up; the outcome is then dropped.
    pub(crate) fn complete(&self, correlation_id: &CorrelationId, outcome: Result<Envelope>) -> bool {
        // ---
        match self.requests.remove(correlation_id) {
            Some((_, pending)) => {
                log_debug!(
                    "request {correlation_id} ({}) resolved after {:?}",
                    pending.request_type,
                    pending.created_at.elapsed()
                );
                let _ = pending.completion.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove a pending request without resolving it.
    pub(crate) fn remove(&self, correlation_id: &CorrelationId) -> bool {
        // ---
        self.requests.remove(correlation_id).is_some()
    }

    /// Fail every pending request with [`BusError::Shutdown`].
    ///
    /// Returns how many were failed.
    pub(crate) fn fail_all(&self) -> usize {
        // ---
        let ids: Vec<CorrelationId> = self.requests.iter().map(|entry| entry.key().clone()).collect();

        ids.iter()
            .filter(|id| self.complete(id, Err(BusError::Shutdown)))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.requests.contains_key(correlation_id)
    }
}
