// src/subscriber/handler.rs

//! Handler adaptation.
//!
//! Applications register handlers in several shapes (sync or async, typed or
//! raw). All of them are erased here into one [`HandlerFn`] so the dispatcher
//! treats every subscription identically.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{BusError, CorrelationId, Delivery, Message};
use crate::{Address, ConsumerTag, DeliveryTag, Headers, HandlerError, Result};

pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased async handler: one call per delivery, resolved when the
/// delivery has been fully handled.
pub(crate) type HandlerFn = Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Delivery metadata handed to handlers that ask for it.
#[derive(Clone, Debug)]
pub struct ReceivedInfo {
    /// Queue the message came from.
    pub queue: Arc<str>,
    /// Consumer that received it.
    pub consumer_tag: ConsumerTag,
    /// Tag the dispatcher will ack or nack.
    pub delivery_tag: DeliveryTag,
    /// True if this message was delivered before.
    pub redelivered: bool,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
    /// Correlation id carried by the envelope, if any.
    pub correlation_id: Option<CorrelationId>,
    /// Reply address carried by the envelope, if any.
    pub reply_to: Option<Address>,
    /// Envelope headers.
    pub headers: Headers,
}

impl ReceivedInfo {
    fn from_delivery(delivery: &Delivery) -> Self {
        // ---
        Self {
            queue: delivery.queue.clone(),
            consumer_tag: delivery.consumer_tag.clone(),
            delivery_tag: delivery.tag,
            redelivered: delivery.redelivered,
            attempt: delivery.attempt,
            correlation_id: delivery.envelope.correlation_id.clone(),
            reply_to: delivery.envelope.reply_to.clone(),
            headers: delivery.envelope.headers.clone(),
        }
    }
}

/// Turn a handler failure into a [`BusError`].
///
/// A handler that fails with a `BusError` keeps its variant; anything else
/// becomes [`BusError::HandlerFault`].
fn into_bus_error<E: Into<HandlerError>>(err: E) -> BusError {
    // ---
    let err: HandlerError = err.into();
    match err.downcast::<BusError>() {
        Ok(err) => *err,
        Err(other) => BusError::HandlerFault(other),
    }
}

/// Adapt a synchronous handler.
///
/// The handler runs on tokio's blocking pool, so a slow handler holds up only
/// its own subscription. Its `Err` becomes the failure signal and its return
/// is success.
pub(crate) fn wrap_sync<T, F, E>(handler: F) -> HandlerFn
where
    T: Message,
    F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
    E: Into<HandlerError>,
{
    // ---
    let handler = Arc::new(handler);
    Arc::new(move |delivery: Delivery| {
        let message = match delivery.envelope.decode::<T>() {
            Ok(message) => message,
            Err(err) => return Box::pin(async move { Err(err) }) as BoxFuture<'static, Result<()>>,
        };

        let handler = handler.clone();
        Box::pin(async move {
            match tokio::task::spawn_blocking(move || handler(message).map_err(into_bus_error)).await {
                Ok(outcome) => outcome,
                Err(e) => Err(BusError::handler_fault(format!("handler panicked: {e}"))),
            }
        })
    })
}

/// Adapt an asynchronous handler; its future is awaited as-is.
pub(crate) fn wrap_async<T, F, Fut, E>(handler: F) -> HandlerFn
where
    T: Message,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<HandlerError>,
{
    // ---
    Arc::new(move |delivery: Delivery| {
        let message = match delivery.envelope.decode::<T>() {
            Ok(message) => message,
            Err(err) => return Box::pin(async move { Err(err) }) as BoxFuture<'static, Result<()>>,
        };

        let fut = handler(message);
        Box::pin(async move { fut.await.map_err(into_bus_error) })
    })
}

/// Adapt an asynchronous handler that also receives delivery metadata.
pub(crate) fn wrap_async_with_info<T, F, Fut, E>(handler: F) -> HandlerFn
where
    T: Message,
    F: Fn(T, ReceivedInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<HandlerError>,
{
    // ---
    Arc::new(move |delivery: Delivery| {
        let message = match delivery.envelope.decode::<T>() {
            Ok(message) => message,
            Err(err) => return Box::pin(async move { Err(err) }) as BoxFuture<'static, Result<()>>,
        };

        let fut = handler(message, ReceivedInfo::from_delivery(&delivery));
        Box::pin(async move { fut.await.map_err(into_bus_error) })
    })
}

/// Adapt a raw handler that sees the undecoded delivery.
pub(crate) fn wrap_raw<F, Fut, E>(handler: F) -> HandlerFn
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<HandlerError>,
{
    // ---
    Arc::new(move |delivery: Delivery| {
        let fut = handler(delivery);
        Box::pin(async move { fut.await.map_err(into_bus_error) }) as BoxFuture<'static, Result<()>>
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::Envelope;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Serialize, Deserialize)]
    struct Tick {
        n: u32,
    }

    impl Message for Tick {}

    fn delivery_of(env: Envelope) -> Delivery {
        // ---
        Delivery {
            tag: DeliveryTag(1),
            consumer_tag: ConsumerTag(Arc::from("ctag-test")),
            queue: Arc::from("q"),
            redelivered: false,
            attempt: 1,
            envelope: env,
        }
    }

    #[tokio::test]
    async fn test_sync_error_becomes_handler_fault() {
        // ---
        let handler = wrap_sync(|tick: Tick| {
            if tick.n == 0 {
                Err("zero tick")
            } else {
                Ok(())
            }
        });

        let ok = handler(delivery_of(Envelope::for_message(&Tick { n: 1 }).unwrap())).await;
        assert!(ok.is_ok());

        let err = handler(delivery_of(Envelope::for_message(&Tick { n: 0 }).unwrap())).await;
        assert!(matches!(err, Err(BusError::HandlerFault(_))));
    }

    #[tokio::test]
    async fn test_sync_handler_runs_off_the_async_worker() {
        // ---
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let rx = std::sync::Mutex::new(rx);
        let handler = wrap_sync(move |_tick: Tick| {
            rx.lock()
                .unwrap()
                .recv_timeout(std::time::Duration::from_secs(2))
                .map_err(|e| e.to_string())
        });

        // Building the future must not run the handler on this thread.
        let outcome = handler(delivery_of(Envelope::for_message(&Tick { n: 1 }).unwrap()));
        tx.send(()).unwrap();
        assert!(outcome.await.is_ok());
    }

    #[tokio::test]
    async fn test_sync_panic_becomes_handler_fault() {
        // ---
        let handler = wrap_sync(|_tick: Tick| -> std::result::Result<(), HandlerError> { panic!("boom") });
        let outcome = handler(delivery_of(Envelope::for_message(&Tick { n: 1 }).unwrap())).await;
        assert!(matches!(outcome, Err(BusError::HandlerFault(_))));
    }

    #[tokio::test]
    async fn test_async_handler_sees_decoded_body() {
        // ---
        let seen = Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();
        let handler = wrap_async(move |tick: Tick| {
            let seen = seen_clone.clone();
            async move {
                seen.store(tick.n, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        });

        handler(delivery_of(Envelope::for_message(&Tick { n: 9 }).unwrap()))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 9);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_serialization_error() {
        // ---
        let handler = wrap_async(|_tick: Tick| async { Ok::<(), HandlerError>(()) });
        let env = Envelope::new(Tick::type_name().as_ref(), bytes::Bytes::from_static(b"[]"));
        let outcome = handler(delivery_of(env)).await;
        assert!(matches!(outcome, Err(BusError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_info_carries_delivery_metadata() {
        // ---
        let handler = wrap_async_with_info(|_tick: Tick, info: ReceivedInfo| async move {
            if info.attempt == 1 && info.queue.as_ref() == "q" {
                Ok(())
            } else {
                Err("wrong metadata")
            }
        });
        let outcome = handler(delivery_of(Envelope::for_message(&Tick { n: 2 }).unwrap())).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_bus_errors_keep_their_variant() {
        // ---
        let handler = wrap_raw(|_d: Delivery| async { Err::<(), BusError>(BusError::Shutdown) });
        let outcome = handler(delivery_of(Envelope::new("x", bytes::Bytes::new()))).await;
        assert!(matches!(outcome, Err(BusError::Shutdown)));
    }
}
