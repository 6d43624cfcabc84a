// src/rpc/requester.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::pending::PendingRequests;
use super::ERROR_HEADER;
use crate::consumer::{ErrorStrategyPtr, RunningDispatcher};
use crate::macros::{log_debug, log_info, log_warn};
use crate::subscriber::verifier;
use crate::{
    // ---
    Address,
    BuildContext,
    BusError,
    Conventions,
    CorrelationId,
    Delivery,
    Envelope,
    ExchangeKind,
    HandlerError,
    Message,
    QueueSpec,
    Result,
    SubscriberBuilder,
    TransportPtr,
};

/// The caller's private reply queue and the consumer draining it.
struct ReplyQueue {
    address: Address,
    dispatcher: RunningDispatcher,
}

/// Caller side of request/response.
///
/// Every request registers a pending entry under a fresh correlation id,
/// then publishes to the RPC exchange with the caller's reply queue as
/// `reply_to`. Responses arriving on the reply queue resolve the matching
/// entry. The reply queue is declared on first use and shared by all requests
/// of the bus.
pub(crate) struct RpcRequester {
    // ---
    transport: TransportPtr,
    conventions: Arc<dyn Conventions>,
    strategy: ErrorStrategyPtr,
    prefetch_count: u16,
    pending: Arc<PendingRequests>,
    reply_queue: Mutex<Option<ReplyQueue>>,
    closed: AtomicBool,
}

impl RpcRequester {
    pub(crate) fn new(
        transport: TransportPtr,
        conventions: Arc<dyn Conventions>,
        strategy: ErrorStrategyPtr,
        prefetch_count: u16,
    ) -> Self {
        // ---
        Self {
            transport,
            conventions,
            strategy,
            prefetch_count,
            pending: Arc::new(PendingRequests::new()),
            reply_queue: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send `request` and wait up to `timeout` for its response.
    pub(crate) async fn request<Req, Res>(&self, request: &Req, timeout: Duration) -> Result<Res>
    where
        Req: Message,
        Res: Message,
    {
        // ---
        if !self.transport.is_connected() {
            return Err(BusError::TransportDisconnected);
        }

        let request_type = Req::type_name();
        let body = Envelope::for_message(request)?;
        let reply_to = self.reply_address().await?;
        let exchange = self
            .transport
            .declare_exchange(&self.conventions.rpc_exchange_name(), ExchangeKind::Direct)
            .await?;

        let (correlation_id, completion) = self.pending.register(&request_type);
        let _entry = PendingEntry {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };
        let envelope = body
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(reply_to);

        self.transport.publish(&exchange, &request_type, envelope).await?;
        log_debug!("sent request {correlation_id} ({request_type})");

        let response = match tokio::time::timeout(timeout, completion).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(BusError::Shutdown),
            Err(_) => {
                log_warn!("request {correlation_id} ({request_type}) timed out after {timeout:?}");
                return Err(BusError::RpcTimeout(timeout));
            }
        };

        decode_response(&response)
    }

    /// Stop the reply consumer and fail every outstanding request.
    pub(crate) async fn shutdown(&self) {
        // ---
        let reply_queue = {
            let mut slot = self.reply_queue.lock().await;
            self.closed.store(true, Ordering::Release);
            slot.take()
        };
        if let Some(reply_queue) = reply_queue {
            reply_queue.dispatcher.stop().await;
        }

        let failed = self.pending.fail_all();
        if failed > 0 {
            log_info!("failed {failed} pending request(s) on shutdown");
        }
    }

    /// Address of the reply queue, declaring it and starting its consumer
    /// when there is none yet (or the previous one lost its connection).
    async fn reply_address(&self) -> Result<Address> {
        // ---
        let mut slot = self.reply_queue.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Shutdown);
        }
        if let Some(existing) = slot.as_ref() {
            if !existing.dispatcher.state().is_stopped() {
                return Ok(existing.address.clone());
            }
            log_warn!(
                "reply consumer on '{}' has stopped; declaring a new reply queue",
                existing.address
            );
        }

        let queue = self
            .transport
            .declare_queue(QueueSpec::private(self.conventions.rpc_return_queue_name()))
            .await?;

        let pending = self.pending.clone();
        let config = SubscriberBuilder::raw()
            .queue(queue.clone())
            .with_prefetch_count(self.prefetch_count)
            .handler_raw(move |delivery: Delivery| {
                let pending = pending.clone();
                async move {
                    resolve(&pending, delivery.envelope);
                    Ok::<(), HandlerError>(())
                }
            })
            .build(&BuildContext {
                conventions: self.conventions.as_ref(),
                default_prefetch_count: self.prefetch_count,
            })?;

        let dispatcher =
            RunningDispatcher::start(self.transport.clone(), queue.clone(), config, self.strategy.clone())
                .await?;

        let address = Address::from(queue.name.clone());
        log_debug!("reply queue '{address}' ready");

        *slot = Some(ReplyQueue {
            address: address.clone(),
            dispatcher,
        });
        Ok(address)
    }
}

/// Removes a request's pending entry when its caller stops waiting: on
/// timeout, on a failed publish, or when the request future is dropped.
/// Entries already resolved are gone and left alone.
struct PendingEntry<'a> {
    // ---
    pending: &'a PendingRequests,
    correlation_id: CorrelationId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        // ---
        if self.pending.remove(&self.correlation_id) {
            log_debug!("request {} abandoned", self.correlation_id);
        }
    }
}

/// Hand a response to the request waiting for it.
fn resolve(pending: &PendingRequests, envelope: Envelope) {
    // ---
    let Some(correlation_id) = envelope.correlation_id.clone() else {
        log_warn!("response missing correlation_id");
        return;
    };

    if !pending.complete(&correlation_id, Ok(envelope)) {
        log_debug!("no pending request for correlation_id: {correlation_id}");
    }
}

fn decode_response<Res: Message>(envelope: &Envelope) -> Result<Res> {
    // ---
    if let Some(message) = envelope.header_str(ERROR_HEADER) {
        return Err(BusError::Responder(message.to_string()));
    }

    verifier::check_message_type(&Res::type_name(), envelope)?;
    envelope.decode()
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Answer {
        value: i64,
    }

    impl Message for Answer {
        fn type_name() -> std::borrow::Cow<'static, str> {
            "tests.Answer".into()
        }
    }

    #[test]
    fn test_error_header_wins_over_body() {
        // ---
        let envelope = Envelope::response("tests.Answer", Bytes::new(), CorrelationId::generate())
            .with_header(ERROR_HEADER, serde_json::json!("division by zero"));

        match decode_response::<Answer>(&envelope) {
            Err(BusError::Responder(message)) => assert_eq!(message, "division by zero"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_response_type_is_verified() {
        // ---
        let envelope = Envelope::response(
            "tests.Other",
            Bytes::from_static(b"{\"value\":1}"),
            CorrelationId::generate(),
        );
        assert!(matches!(
            decode_response::<Answer>(&envelope),
            Err(BusError::MessageTypeMismatch { .. })
        ));

        let good = Envelope::for_message(&Answer { value: 42 }).unwrap();
        assert_eq!(decode_response::<Answer>(&good).unwrap(), Answer { value: 42 });
    }

    #[tokio::test]
    async fn test_resolve_ignores_unknown_and_uncorrelated_responses() {
        // ---
        let pending = PendingRequests::new();
        let (id, completion) = pending.register("tests.Ask");

        resolve(&pending, Envelope::new("tests.Answer", Bytes::new()));
        resolve(
            &pending,
            Envelope::response("tests.Answer", Bytes::new(), CorrelationId::generate()),
        );
        assert_eq!(pending.len(), 1);

        resolve(&pending, Envelope::response("tests.Answer", Bytes::new(), id));
        assert!(completion.await.unwrap().is_ok());
    }

    #[test]
    fn test_dropped_entry_leaves_table() {
        // ---
        let pending = PendingRequests::new();
        let (id, _completion) = pending.register("tests.Ask");
        let (kept, _kept_completion) = pending.register("tests.Ask");

        drop(PendingEntry {
            pending: &pending,
            correlation_id: id.clone(),
        });
        assert!(!pending.contains(&id));
        assert!(pending.contains(&kept));

        // Resolved first, then dropped: nothing left to remove.
        assert!(pending.complete(&kept, Err(BusError::Shutdown)));
        drop(PendingEntry {
            pending: &pending,
            correlation_id: kept,
        });
        assert_eq!(pending.len(), 0);
    }
}
