// src/transport/memory/broker.rs

//! Shared in-process broker state.
//!
//! A [`MemoryBroker`] plays the part of the AMQP server: it owns exchanges,
//! queues and bindings, hands deliveries to consumers within their prefetch
//! credit, and tracks unacknowledged deliveries until they are settled. Any
//! number of [`MemoryTransport`] connections can be opened against one broker,
//! which is how tests put several buses on the same queues.
//!
//! All state sits behind one mutex and every operation completes without
//! awaiting, so operations from different connections are linearizable.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use super::topic::topic_matches;
use super::transport::MemoryTransport;
use crate::macros::log_debug;
use crate::{
    // ---
    BusError,
    ConsumerHandle,
    ConsumerTag,
    Delivery,
    DeliveryTag,
    Envelope,
    ExchangeHandle,
    ExchangeKind,
    Headers,
    QueueHandle,
    QueueSpec,
    Result,
};

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-process message broker shared by [`MemoryTransport`] connections.
///
/// # Example
///
/// ```
/// use mom_bus::transport::memory::MemoryBroker;
///
/// let broker = MemoryBroker::new();
/// let publisher = broker.connect("publisher");
/// let subscriber = broker.connect("subscriber");
/// # let _ = (publisher, subscriber);
/// assert_eq!(broker.consumer_count("missing"), 0);
/// ```
pub struct MemoryBroker {
    // ---
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(PartialEq)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct QueuedMessage {
    envelope: Envelope,
    deliveries: u32,
}

struct Unacked {
    message: QueuedMessage,
    consumer: Arc<str>,
}

struct ConsumerState {
    tag: Arc<str>,
    connection: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_credit(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

struct QueueState {
    // ---
    name: Arc<str>,
    spec: QueueSpec,
    owner: u64,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
    unacked: BTreeMap<u64, Unacked>,
}

impl QueueState {
    fn new(spec: QueueSpec, owner: u64) -> Self {
        // ---
        Self {
            name: Arc::from(spec.name.as_str()),
            spec,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cursor: 0,
            unacked: BTreeMap::new(),
        }
    }

    /// Hand ready messages to consumers, round robin, while any has credit.
    fn pump(&mut self, next_tag: &mut u64) {
        // ---
        while !self.ready.is_empty() && !self.consumers.is_empty() {
            let count = self.consumers.len();
            let Some(index) = (0..count)
                .map(|offset| (self.cursor + offset) % count)
                .find(|&index| self.consumers[index].has_credit())
            else {
                return;
            };

            let Some(mut message) = self.ready.pop_front() else {
                return;
            };
            message.deliveries += 1;
            *next_tag += 1;
            let tag = *next_tag;

            let consumer = &mut self.consumers[index];
            let delivery = Delivery {
                tag: DeliveryTag(tag),
                consumer_tag: ConsumerTag(consumer.tag.clone()),
                queue: self.name.clone(),
                redelivered: message.deliveries > 1,
                attempt: message.deliveries,
                envelope: message.envelope.clone(),
            };

            if consumer.sender.send(delivery).is_err() {
                // Receiver is gone; treat it as a cancel.
                message.deliveries -= 1;
                self.ready.push_front(message);
                let gone = consumer.tag.clone();
                self.detach(&gone);
                continue;
            }

            consumer.in_flight += 1;
            let consumer_tag = consumer.tag.clone();
            self.unacked.insert(
                tag,
                Unacked {
                    message,
                    consumer: consumer_tag,
                },
            );
            self.cursor = (index + 1) % count;
        }
    }

    /// Remove a consumer and put the deliveries it still holds back at the
    /// head of the queue, in their original order.
    fn detach(&mut self, consumer_tag: &str) -> bool {
        // ---
        let Some(position) = self
            .consumers
            .iter()
            .position(|consumer| consumer.tag.as_ref() == consumer_tag)
        else {
            return false;
        };
        self.consumers.remove(position);

        if self.consumers.is_empty() {
            self.cursor = 0;
        } else {
            if position < self.cursor {
                self.cursor -= 1;
            }
            self.cursor %= self.consumers.len();
        }

        let held: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.consumer.as_ref() == consumer_tag)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in held.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.ready.push_front(unacked.message);
            }
        }
        true
    }

    fn release_credit(&mut self, consumer_tag: &str) {
        if let Some(consumer) = self
            .consumers
            .iter_mut()
            .find(|consumer| consumer.tag.as_ref() == consumer_tag)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
    }

    fn should_auto_delete(&self) -> bool {
        self.spec.auto_delete && self.consumers.is_empty()
    }
}

impl BrokerState {
    fn delete_queue(&mut self, name: &str) {
        // ---
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|binding| binding.queue != name);
            }
            log_debug!("memory broker deleted queue '{name}'");
        }
    }

    fn queue_for_delivery(&mut self, tag: u64) -> Option<&mut QueueState> {
        self.queues
            .values_mut()
            .find(|queue| queue.unacked.contains_key(&tag))
    }

    fn check_owner(queue: &QueueState, connection: u64) -> Result<()> {
        // ---
        if queue.spec.exclusive && queue.owner != connection {
            return Err(BusError::Transport(format!(
                "queue '{}' is exclusive to another connection",
                queue.name
            )));
        }
        Ok(())
    }
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Open a new connection to this broker.
    pub fn connect(self: &Arc<Self>, transport_id: impl Into<String>) -> Arc<MemoryTransport> {
        // ---
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryTransport::new(transport_id.into(), connection, self.clone()))
    }

    /// True if a queue with this name exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        lock_ignore_poison(&self.state).queues.contains_key(queue)
    }

    /// Messages waiting in `queue` that no consumer holds.
    pub fn message_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.ready.len())
    }

    /// Deliveries from `queue` handed out but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.unacked.len())
    }

    /// Consumers currently attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map_or(0, |queue| queue.consumers.len())
    }

    /// Declaration arguments of `queue`, if it exists.
    pub fn queue_arguments(&self, queue: &str) -> Option<Headers> {
        lock_ignore_poison(&self.state)
            .queues
            .get(queue)
            .map(|queue| queue.spec.arguments.clone())
    }

    pub(super) fn declare_queue(&self, connection: u64, spec: QueueSpec) -> Result<QueueHandle> {
        // ---
        if spec.name.is_empty() {
            return Err(BusError::Transport("queue name must not be empty".into()));
        }

        let mut state = lock_ignore_poison(&self.state);
        if let Some(existing) = state.queues.get(&spec.name) {
            BrokerState::check_owner(existing, connection)?;
            if existing.spec != spec {
                return Err(BusError::Transport(format!(
                    "queue '{}' already declared with different properties",
                    spec.name
                )));
            }
            return Ok(QueueHandle::named(existing.name.clone()));
        }

        let queue = QueueState::new(spec, connection);
        let handle = QueueHandle::named(queue.name.clone());
        log_debug!("memory broker declared queue '{}'", handle.name);
        state.queues.insert(queue.spec.name.clone(), queue);
        Ok(handle)
    }

    pub(super) fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<ExchangeHandle> {
        // ---
        if name.is_empty() {
            return Ok(ExchangeHandle::default_exchange());
        }

        let mut state = lock_ignore_poison(&self.state);
        let exchange = state
            .exchanges
            .entry(name.to_string())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });

        if exchange.kind != kind {
            return Err(BusError::Transport(format!(
                "exchange '{name}' already declared as {:?}",
                exchange.kind
            )));
        }

        Ok(ExchangeHandle {
            name: Arc::from(name),
            kind,
        })
    }

    pub(super) fn bind(&self, queue: &str, exchange: &str, routing_keys: &[String]) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if !state.queues.contains_key(queue) {
            return Err(BusError::Transport(format!("no queue '{queue}'")));
        }

        let Some(exchange_state) = state.exchanges.get_mut(exchange) else {
            return Err(BusError::Transport(format!("no exchange '{exchange}' to bind to")));
        };

        for routing_key in routing_keys {
            let binding = Binding {
                queue: queue.to_string(),
                routing_key: routing_key.clone(),
            };
            if !exchange_state.bindings.contains(&binding) {
                exchange_state.bindings.push(binding);
            }
        }
        Ok(())
    }

    pub(super) fn consume(&self, connection: u64, queue: &str, prefetch: u16) -> Result<ConsumerHandle> {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let state = &mut *guard;

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(BusError::Transport(format!("no queue '{queue}' to consume")));
        };
        BrokerState::check_owner(queue_state, connection)?;

        state.next_consumer_tag += 1;
        let tag: Arc<str> = Arc::from(format!("ctag-{}", state.next_consumer_tag));
        let (sender, inbox) = mpsc::unbounded_channel();

        queue_state.consumers.push(ConsumerState {
            tag: tag.clone(),
            connection,
            prefetch,
            in_flight: 0,
            sender,
        });
        queue_state.pump(&mut state.next_delivery_tag);

        Ok(ConsumerHandle {
            consumer_tag: ConsumerTag(tag),
            inbox,
        })
    }

    pub(super) fn cancel(&self, consumer_tag: &str) {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let state = &mut *guard;

        let Some(queue_state) = state
            .queues
            .values_mut()
            .find(|queue| queue.consumers.iter().any(|c| c.tag.as_ref() == consumer_tag))
        else {
            log_debug!("memory broker: consumer {consumer_tag} already gone");
            return;
        };

        queue_state.detach(consumer_tag);
        if queue_state.should_auto_delete() {
            let name = queue_state.spec.name.clone();
            state.delete_queue(&name);
        } else {
            queue_state.pump(&mut state.next_delivery_tag);
        }
    }

    pub(super) fn ack(&self, tag: u64) -> Result<()> {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let mut next_tag = guard.next_delivery_tag;

        let Some(queue_state) = guard.queue_for_delivery(tag) else {
            return Err(BusError::UnknownDeliveryTag(tag));
        };
        if let Some(unacked) = queue_state.unacked.remove(&tag) {
            queue_state.release_credit(&unacked.consumer);
        }
        queue_state.pump(&mut next_tag);

        guard.next_delivery_tag = next_tag;
        Ok(())
    }

    pub(super) fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let mut next_tag = guard.next_delivery_tag;

        let Some(queue_state) = guard.queue_for_delivery(tag) else {
            return Err(BusError::UnknownDeliveryTag(tag));
        };
        if let Some(unacked) = queue_state.unacked.remove(&tag) {
            queue_state.release_credit(&unacked.consumer);
            if requeue {
                queue_state.ready.push_front(unacked.message);
            } else {
                log_debug!(
                    "memory broker discarded delivery {tag} from '{}'",
                    queue_state.name
                );
            }
        }
        queue_state.pump(&mut next_tag);

        guard.next_delivery_tag = next_tag;
        Ok(())
    }

    pub(super) fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<()> {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let state = &mut *guard;

        let targets: BTreeSet<String> = if exchange.is_empty() {
            std::iter::once(routing_key.to_string()).collect()
        } else {
            let Some(exchange_state) = state.exchanges.get(exchange) else {
                return Err(BusError::Transport(format!("no exchange '{exchange}'")));
            };
            exchange_state
                .bindings
                .iter()
                .filter(|binding| match exchange_state.kind {
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                })
                .map(|binding| binding.queue.clone())
                .collect()
        };

        let mut routed = false;
        for name in &targets {
            if let Some(queue_state) = state.queues.get_mut(name) {
                queue_state.ready.push_back(QueuedMessage {
                    envelope: envelope.clone(),
                    deliveries: 0,
                });
                queue_state.pump(&mut state.next_delivery_tag);
                routed = true;
            }
        }

        if !routed {
            log_debug!(
                "memory broker: '{}' published to '{exchange}' with key '{routing_key}' was unroutable",
                envelope.type_name
            );
        }
        Ok(())
    }

    /// Drop everything a connection holds: its consumers are cancelled and the
    /// exclusive queues it declared are deleted.
    pub(super) fn disconnect(&self, connection: u64) {
        // ---
        let mut guard = lock_ignore_poison(&self.state);
        let state = &mut *guard;

        let mut emptied = Vec::new();
        for queue_state in state.queues.values_mut() {
            let owned: Vec<Arc<str>> = queue_state
                .consumers
                .iter()
                .filter(|consumer| consumer.connection == connection)
                .map(|consumer| consumer.tag.clone())
                .collect();
            if owned.is_empty() {
                continue;
            }

            for tag in &owned {
                queue_state.detach(tag);
            }
            if queue_state.should_auto_delete() {
                emptied.push(queue_state.spec.name.clone());
            } else {
                queue_state.pump(&mut state.next_delivery_tag);
            }
        }

        let exclusive: Vec<String> = state
            .queues
            .values()
            .filter(|queue| queue.spec.exclusive && queue.owner == connection)
            .map(|queue| queue.spec.name.clone())
            .collect();

        for name in emptied.into_iter().chain(exclusive) {
            state.delete_queue(&name);
        }
    }
}
