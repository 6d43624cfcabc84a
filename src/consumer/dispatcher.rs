// src/consumer/dispatcher.rs

//! Per-subscription dispatch loop.
//!
//! One loop runs per subscription. It takes deliveries from the transport in
//! order, verifies their type, runs the handler to completion, and only then
//! acks or nacks. Because the next delivery is not taken until the current
//! one is settled, a consumer never holds more work than its prefetch credit
//! allows the transport to push, and prefetch 1 gives fair dispatch.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::error_strategy::{ConsumerExecutionContext, ErrorStrategyPtr, PostExceptionAckStrategy};
use super::state::DispatchState;
use crate::macros::{log_debug, log_error};
use crate::subscriber::verifier;
use crate::{
    // ---
    BusError,
    ConsumerHandle,
    ConsumerTag,
    Delivery,
    QueueHandle,
    Result,
    SubscriberConfiguration,
    TransportPtr,
};

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A running dispatch loop and the means to stop it.
pub(crate) struct RunningDispatcher {
    // ---
    queue: Arc<str>,
    consumer_tag: ConsumerTag,
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<DispatchState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RunningDispatcher {
    /// Register a consumer on `queue` and start its loop.
    ///
    /// Returns once the transport has accepted the consumer, so consumers
    /// started one after another attach to the queue in that order.
    pub(crate) async fn start(
        transport: TransportPtr,
        queue: QueueHandle,
        config: SubscriberConfiguration,
        strategy: ErrorStrategyPtr,
    ) -> Result<Self> {
        // ---
        let ConsumerHandle {
            consumer_tag,
            inbox,
        } = transport.consume(&queue, config.prefetch_count).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(DispatchState::Idle);

        log_debug!(
            "consumer {consumer_tag} attached to '{}' with prefetch {}",
            queue.name,
            config.prefetch_count
        );

        let dispatcher = Dispatcher {
            transport,
            queue: queue.name.clone(),
            consumer_tag: consumer_tag.clone(),
            config,
            strategy,
            state: state_tx,
        };
        let task = tokio::spawn(dispatcher.run(inbox, stop_rx));

        Ok(Self {
            queue: queue.name,
            consumer_tag,
            stop_tx,
            state_rx,
            task: Mutex::new(Some(task)),
        })
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn consumer_tag(&self) -> &ConsumerTag {
        &self.consumer_tag
    }

    pub(crate) fn state(&self) -> DispatchState {
        *self.state_rx.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<DispatchState> {
        self.state_rx.clone()
    }

    /// Stop taking deliveries and wait for the loop to finish.
    ///
    /// A handler already running completes and its delivery is settled first.
    /// Calling this more than once is harmless.
    pub(crate) async fn stop(&self) {
        // ---
        self.stop_tx.send_replace(true);

        let task = lock_ignore_poison(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log_error!("dispatch loop for '{}' failed: {e}", self.queue);
            }
        }
    }
}

struct Dispatcher {
    // ---
    transport: TransportPtr,
    queue: Arc<str>,
    consumer_tag: ConsumerTag,
    config: SubscriberConfiguration,
    strategy: ErrorStrategyPtr,
    state: watch::Sender<DispatchState>,
}

impl Dispatcher {
    async fn run(self, mut inbox: mpsc::UnboundedReceiver<Delivery>, mut stop: watch::Receiver<bool>) {
        // ---
        loop {
            if *stop.borrow() {
                break;
            }
            self.set_state(DispatchState::AwaitingDelivery);

            let delivery = tokio::select! {
                biased;

                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }

                next = inbox.recv() => match next {
                    Some(delivery) => delivery,
                    None => {
                        log_debug!("delivery stream for consumer {} ended", self.consumer_tag);
                        break;
                    }
                },
            };

            self.set_state(DispatchState::Dispatching);
            let outcome = self.dispatch(delivery.clone()).await;
            self.settle(&delivery, outcome).await;
        }

        // Deliveries still buffered for this consumer go back to the queue.
        drop(inbox);
        if let Err(e) = self.transport.cancel(&self.consumer_tag).await {
            log_debug!("cancel of consumer {} on '{}': {e}", self.consumer_tag, self.queue);
        }

        self.set_state(DispatchState::Stopped);
        log_debug!("consumer {} on '{}' stopped", self.consumer_tag, self.queue);
    }

    fn set_state(&self, state: DispatchState) {
        self.state.send_replace(state);
    }

    async fn dispatch(&self, delivery: Delivery) -> Result<()> {
        // ---
        if let Some(expected) = self.config.expected_type_name() {
            verifier::check_message_type(expected, &delivery.envelope)?;
        }

        // Run on its own task so a panicking handler surfaces as a fault
        // instead of taking the loop down.
        let handler = self.config.handler.clone();
        match tokio::spawn(async move { handler(delivery).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(BusError::handler_fault(format!("handler panicked: {e}"))),
        }
    }

    async fn settle(&self, delivery: &Delivery, outcome: Result<()>) {
        // ---
        let decision = match outcome {
            Ok(()) => None,
            Err(err) => {
                let context = ConsumerExecutionContext {
                    queue: &self.queue,
                    consumer_tag: &self.consumer_tag,
                    delivery_tag: delivery.tag,
                    redelivered: delivery.redelivered,
                    attempt: delivery.attempt,
                    envelope: &delivery.envelope,
                };
                Some(self.strategy.handle_consumer_error(&context, &err))
            }
        };

        let settled = match decision {
            None | Some(PostExceptionAckStrategy::AckAndDiscard) => {
                self.set_state(DispatchState::Acking);
                self.transport.ack(delivery.tag).await
            }
            Some(PostExceptionAckStrategy::NackWithoutRequeue) => {
                self.set_state(DispatchState::Nacking);
                self.transport.nack(delivery.tag, false).await
            }
            Some(PostExceptionAckStrategy::NackWithRequeue) => {
                self.set_state(DispatchState::Nacking);
                self.transport.nack(delivery.tag, true).await
            }
            Some(PostExceptionAckStrategy::DoNothing) => Ok(()),
        };

        if let Err(e) = settled {
            log_error!(
                "failed to settle delivery {} on '{}': {e}",
                delivery.tag,
                self.queue
            );
        }
    }
}
