// src/rpc/responder.rs

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::ERROR_HEADER;
use crate::connectivity::wait_for_connection;
use crate::macros::{log_debug, log_error, log_warn};
use crate::subscriber::handler::BoxFuture;
use crate::{
    // ---
    Address,
    Conventions,
    Envelope,
    ExchangeHandle,
    ExchangeKind,
    HandlerError,
    Message,
    QueueHandle,
    QueueSpec,
    ReceivedInfo,
    Result,
    SubscriberBuilder,
    TransportPtr,
};

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Response publications still running, so the bus can let them finish
/// before it closes the transport.
#[derive(Default)]
pub(crate) struct ResponseTasks {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ResponseTasks {
    fn track(&self, task: JoinHandle<()>) {
        // ---
        let mut tasks = lock_ignore_poison(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Wait for every tracked publication to finish.
    pub(crate) async fn drain(&self) {
        // ---
        let tasks = std::mem::take(&mut *lock_ignore_poison(&self.tasks));
        if !tasks.is_empty() {
            log_debug!("waiting for {} response(s) to be published", tasks.len());
        }
        for task in tasks {
            if let Err(e) = task.await {
                log_error!("response publication failed: {e}");
            }
        }
    }
}

/// What a responder subscription needs besides the responder itself.
#[derive(Clone)]
pub(crate) struct ResponderContext {
    // ---
    pub(crate) transport: TransportPtr,
    pub(crate) poll_interval: Duration,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) tasks: Arc<ResponseTasks>,
}

/// Declare the RPC exchange and the durable request queue for `request_type`,
/// bound by the type name.
pub(crate) async fn declare_request_queue(
    transport: &TransportPtr,
    conventions: &dyn Conventions,
    request_type: &str,
) -> Result<QueueHandle> {
    // ---
    let exchange = transport
        .declare_exchange(&conventions.rpc_exchange_name(), ExchangeKind::Direct)
        .await?;
    let queue = transport.declare_queue(QueueSpec::durable(request_type)).await?;
    transport.bind(&queue, &exchange, &[request_type.to_string()]).await?;

    log_debug!("responding to '{request_type}' on queue '{}'", queue.name);
    Ok(queue)
}

/// Build the subscription that serves `Req` with `responder`.
///
/// The responder runs inside the ordinary dispatch loop. Its outcome is then
/// published from a separate task, so waiting for a reconnect holds back only
/// that one response, never the next request. The task is tracked in
/// [`ResponseTasks`] and the bus waits for it on dispose. A failed responder
/// answers the caller with an error response.
pub(crate) fn responder_subscription<Req, Res, F, Fut, E>(
    queue: QueueHandle,
    ctx: ResponderContext,
    responder: F,
) -> SubscriberBuilder<Req>
where
    Req: Message,
    Res: Message,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Res, E>> + Send + 'static,
    E: Into<HandlerError>,
{
    // ---
    SubscriberBuilder::<Req>::new()
        .queue(queue)
        .handler_with_info(move |request: Req, info: ReceivedInfo| {
            let ctx = ctx.clone();
            let reply = info.reply_to.zip(info.correlation_id);
            let queue = info.queue;
            let fut = responder(request);

            async move {
                let Some((reply_to, correlation_id)) = reply else {
                    log_warn!("request on '{queue}' missing reply_to or correlation_id");
                    return Ok::<(), HandlerError>(());
                };

                let outcome = fut
                    .await
                    .map_err(Into::into)
                    .and_then(|response| Envelope::for_message(&response).map_err(HandlerError::from));

                let response = match outcome {
                    Ok(envelope) => envelope.with_correlation_id(correlation_id),
                    Err(e) => {
                        log_error!("responder for '{}' failed: {e}", Req::type_name());
                        error_response::<Res>(correlation_id, &e)
                    }
                };

                let tasks = ctx.tasks.clone();
                tasks.track(tokio::spawn(publish_response(ctx, reply_to, response)));
                Ok(())
            }
        })
}

/// Adapt a synchronous responder; it runs on the blocking pool.
pub(crate) fn blocking_responder<Req, Res, F, E>(
    responder: F,
) -> impl Fn(Req) -> BoxFuture<'static, std::result::Result<Res, HandlerError>> + Send + Sync + 'static
where
    Req: Message,
    Res: Message,
    F: Fn(Req) -> std::result::Result<Res, E> + Send + Sync + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    // ---
    let responder = Arc::new(responder);
    move |request: Req| {
        let responder = responder.clone();
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || responder(request)).await {
                Ok(outcome) => outcome.map_err(Into::into),
                Err(e) => Err(HandlerError::from(format!("responder panicked: {e}"))),
            }
        }) as BoxFuture<'static, std::result::Result<Res, HandlerError>>
    }
}

fn error_response<Res: Message>(correlation_id: crate::CorrelationId, error: &HandlerError) -> Envelope {
    Envelope::response(Res::type_name().as_ref(), Bytes::new(), correlation_id)
        .with_header(ERROR_HEADER, serde_json::Value::String(error.to_string()))
}

async fn publish_response(ctx: ResponderContext, reply_to: Address, response: Envelope) {
    // ---
    let ResponderContext {
        transport,
        poll_interval,
        mut shutdown,
        ..
    } = ctx;

    if let Err(e) = wait_for_connection(&transport, poll_interval, &mut shutdown).await {
        log_warn!("dropping response for '{reply_to}': {e}");
        return;
    }

    if let Err(e) = transport
        .publish(&ExchangeHandle::default_exchange(), &reply_to.0, response)
        .await
    {
        log_error!("failed to publish response to '{reply_to}': {e}");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::CorrelationId;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Pong;

    impl Message for Pong {
        fn type_name() -> std::borrow::Cow<'static, str> {
            "tests.Pong".into()
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_tracked_tasks() {
        // ---
        let tasks = ResponseTasks::default();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let flag = done.clone();
        tasks.track(tokio::spawn(async move {
            let _ = rx.await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));

        tx.send(()).unwrap();
        tasks.drain().await;
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
        assert!(lock_ignore_poison(&tasks.tasks).is_empty());
    }

    #[test]
    fn test_error_response_carries_message_and_correlation() {
        // ---
        let id = CorrelationId::generate();
        let error: HandlerError = "no such account".into();
        let envelope = error_response::<Pong>(id.clone(), &error);

        assert_eq!(envelope.type_name.as_ref(), "tests.Pong");
        assert_eq!(envelope.correlation_id, Some(id));
        assert_eq!(envelope.header_str(ERROR_HEADER), Some("no such account"));
        assert!(envelope.body.is_empty());
    }
}
