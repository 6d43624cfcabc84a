// src/transport/amqp/lapin.rs

//! AMQP transport implementation using `lapin`.
//!
//! This module provides an implementation of the `Transport` trait backed by
//! a RabbitMQ connection. It follows an **actor-based concurrency model**
//! to safely integrate with the underlying AMQP client.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor declares topology, publishes, starts and cancels consumers and
//!   settles deliveries, one command at a time.
//! - Each consumer gets a forwarding task that turns lapin deliveries into
//!   [`Delivery`] values and pushes them to the consumer's inbox.
//!
//! Serializing channel operations through the actor matters for prefetch:
//! `basic.qos` applies to consumers started after it on the channel, so the
//! qos/consume pair for one consumer must not interleave with another's.
//!
//! ## Deviations from the reference semantics
//!
//! - AMQP keeps deliveries of a cancelled consumer unacknowledged. This
//!   transport tracks outstanding tags per consumer and requeues them on
//!   `cancel`, matching the in-memory broker.
//! - Classic queues do not count redeliveries, so a failed delivery that is
//!   nacked with requeue is instead republished to the tail of its queue
//!   with the `x-mom-bus-attempt` header set to the attempts made so far,
//!   and the original is acked. The attempt number then keeps growing and the
//!   error strategy's retry bound holds. Unlike the in-memory broker, the
//!   retried message goes behind messages already queued. If the republish
//!   fails, the delivery falls back to a plain requeue.
//! - The attempt is the largest of: `x-mom-bus-attempt` + 1 (+ 1 more if
//!   the broker redelivered it), `x-delivery-count` + 1 (quorum queues), and
//!   1, or 2 if redelivered.
//! - A lost connection is reported through `connection_events` but not
//!   re-established. Create a new transport (and bus) to recover.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind as AmqpExchangeKind,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::macros::{log_debug, log_error, log_info, log_warn};
use crate::{
    //
    BusError,
    ConnectionEvent,
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
    Transport,
    TransportPtr,
};

const CONTENT_TYPE_JSON: &str = "application/json";
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const ATTEMPT_HEADER: &str = "x-mom-bus-attempt";
const PERSISTENT: u8 = 2;
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A delivery handed out and not yet settled.
///
/// Keeps what is needed to republish it on a requeue.
struct Held {
    // ---
    consumer_tag: ConsumerTag,
    queue: Arc<str>,
    attempt: u32,
    properties: BasicProperties,
    body: Vec<u8>,
}

/// Outstanding deliveries by delivery tag.
type Outstanding = Arc<Mutex<HashMap<u64, Held>>>;

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn amqp_error(what: &str, e: lapin::Error) -> BusError {
    BusError::Transport(format!("amqp: {what} failed: {e}"))
}

//
// Actor commands
//

enum Cmd {
    //
    DeclareQueue {
        spec: QueueSpec,
        resp: oneshot::Sender<Result<QueueHandle>>,
    },
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
        resp: oneshot::Sender<Result<ExchangeHandle>>,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_keys: Vec<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    Consume {
        queue: String,
        prefetch_count: u16,
        resp: oneshot::Sender<Result<ConsumerHandle>>,
    },
    Cancel {
        consumer_tag: ConsumerTag,
        resp: oneshot::Sender<Result<()>>,
    },
    Settle {
        tag: u64,
        outcome: Settlement,
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        exchange: String,
        routing_key: String,
        env: Envelope,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone, Copy)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

enum ActorStep {
    //
    Cmd(Cmd),
    Closed,
}

/// AMQP transport implementation using lapin.
///
/// One instance owns one broker connection with a single channel.
pub struct AmqpTransport {
    // ---
    transport_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
    connected: Arc<AtomicBool>,
    events: broadcast::Sender<ConnectionEvent>,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    /// Creates a new AMQP transport with the given connection and channel.
    ///
    /// Spawns a background actor task to handle AMQP operations.
    fn create(transport_id: &str, connection: Connection, channel: Channel) -> TransportPtr {
        // ---
        let transport_id = transport_id.to_string();

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events, _) = broadcast::channel(16);
        let connected = Arc::new(AtomicBool::new(true));
        let outstanding: Outstanding = Arc::new(Mutex::new(HashMap::new()));

        {
            let transport_id = transport_id.clone();
            let connected = Arc::clone(&connected);
            let events = events.clone();
            let outstanding = Arc::clone(&outstanding);
            connection.on_error(move |e| {
                log_error!("[{transport_id}] AMQP connection lost: {e}");
                if connected.swap(false, Ordering::AcqRel) {
                    // The broker requeues everything this connection held.
                    lock_ignore_poison(&outstanding).clear();
                    let _ = events.send(ConnectionEvent::Disconnected);
                }
            });
        }

        let actor = Actor {
            transport_id: transport_id.clone(),
            connection,
            channel,
            cmd_rx,
            outstanding,
            consumers: HashMap::new(),
            next_consumer: AtomicU64::new(1),
        };
        let handle = tokio::spawn(actor.run());

        Arc::new(Self {
            transport_id,
            cmd_tx,
            connected,
            events,
            actor: Mutex::new(Some(handle)),
        })
    }

    fn ensure_connected(&self) -> Result<()> {
        // ---
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BusError::TransportDisconnected)
        }
    }

    /// Send a command to the actor and wait for its reply.
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd) -> Result<T> {
        // ---
        self.ensure_connected()?;

        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|e| {
            let msg = format!("actor command channel closed:{e}");
            BusError::Transport(msg)
        })?;

        rx.await.map_err(|e| {
            let msg = format!("actor responder channel read failed:{e}");
            BusError::Transport(msg)
        })?
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    transport_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    outstanding: Outstanding,
    consumers: HashMap<ConsumerTag, JoinHandle<()>>,
    next_consumer: AtomicU64,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_info!("[{}] AMQP actor started", self.transport_id);

        loop {
            match self.next_step().await {
                ActorStep::Cmd(cmd) => {
                    self.handle_cmd(cmd).await;
                }
                ActorStep::Closed => {
                    log_info!("[{}] AMQP actor shutting down", self.transport_id);
                    break;
                }
            }
        }

        for (_, handle) in self.consumers.drain() {
            handle.abort();
        }

        let _ = self.channel.close(200, "Normal shutdown".into()).await;
        let _ = self.connection.close(200, "Normal shutdown".into()).await;

        log_info!("[{}] AMQP actor stopped", self.transport_id);
    }

    async fn next_step(&mut self) -> ActorStep {
        // ---
        match self.cmd_rx.recv().await {
            Some(cmd) => ActorStep::Cmd(cmd),
            None => ActorStep::Closed,
        }
    }

    async fn handle_cmd(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::DeclareQueue { spec, resp } => {
                let _ = resp.send(self.do_declare_queue(spec).await);
            }
            Cmd::DeclareExchange { name, kind, resp } => {
                let _ = resp.send(self.do_declare_exchange(name, kind).await);
            }
            Cmd::Bind {
                queue,
                exchange,
                routing_keys,
                resp,
            } => {
                let _ = resp.send(self.do_bind(&queue, &exchange, &routing_keys).await);
            }
            Cmd::Consume {
                queue,
                prefetch_count,
                resp,
            } => {
                let _ = resp.send(self.do_consume(queue, prefetch_count).await);
            }
            Cmd::Cancel { consumer_tag, resp } => {
                let _ = resp.send(self.do_cancel(&consumer_tag).await);
            }
            Cmd::Settle { tag, outcome, resp } => {
                let _ = resp.send(self.do_settle(tag, outcome).await);
            }
            Cmd::Publish {
                exchange,
                routing_key,
                env,
                resp,
            } => {
                let _ = resp.send(self.do_publish(&exchange, &routing_key, env).await);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                self.cmd_rx.close();
            }
        }
    }

    async fn do_declare_queue(&mut self, spec: QueueSpec) -> Result<QueueHandle> {
        // ---
        let queue_opts = QueueDeclareOptions {
            passive: false,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };

        self.channel
            .queue_declare(spec.name.as_str().into(), queue_opts, to_field_table(&spec.arguments))
            .await
            .map_err(|e| amqp_error("queue declare", e))?;

        log_debug!("[{}] Declared queue: {}", self.transport_id, spec.name);
        Ok(QueueHandle::named(spec.name))
    }

    async fn do_declare_exchange(&mut self, name: String, kind: ExchangeKind) -> Result<ExchangeHandle> {
        // ---
        if name.is_empty() {
            return Ok(ExchangeHandle::default_exchange());
        }

        let amqp_kind = match kind {
            ExchangeKind::Direct => AmqpExchangeKind::Direct,
            ExchangeKind::Topic => AmqpExchangeKind::Topic,
        };
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(name.as_str().into(), amqp_kind, options, FieldTable::default())
            .await
            .map_err(|e| amqp_error("exchange declare", e))?;

        log_debug!("[{}] Declared exchange: {name}", self.transport_id);
        Ok(ExchangeHandle {
            name: Arc::from(name),
            kind,
        })
    }

    async fn do_bind(&mut self, queue: &str, exchange: &str, routing_keys: &[String]) -> Result<()> {
        // ---
        for key in routing_keys {
            self.channel
                .queue_bind(
                    queue.into(),
                    exchange.into(),
                    key.as_str().into(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| amqp_error("queue bind", e))?;
        }

        log_debug!("[{}] Bound '{queue}' to '{exchange}' with {routing_keys:?}", self.transport_id);
        Ok(())
    }

    async fn do_consume(&mut self, queue: String, prefetch_count: u16) -> Result<ConsumerHandle> {
        // ---
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|e| amqp_error("basic qos", e))?;

        let n = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        let consumer_tag = ConsumerTag(Arc::from(format!("{}-consumer-{n}", self.transport_id)));

        let consumer = self
            .channel
            .basic_consume(
                queue.as_str().into(),
                consumer_tag.0.as_ref().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("consume", e))?;

        log_info!(
            "[{}] Started consuming queue: {queue} (prefetch {prefetch_count})",
            self.transport_id
        );

        let (tx, inbox) = mpsc::unbounded_channel();
        let forwarder = Forwarder {
            transport_id: self.transport_id.clone(),
            queue: Arc::from(queue),
            consumer_tag: consumer_tag.clone(),
            outstanding: Arc::clone(&self.outstanding),
            tx,
        };
        let handle = tokio::spawn(forwarder.run(consumer));
        self.consumers.insert(consumer_tag.clone(), handle);

        Ok(ConsumerHandle { consumer_tag, inbox })
    }

    async fn do_cancel(&mut self, consumer_tag: &ConsumerTag) -> Result<()> {
        // ---
        let Some(handle) = self.consumers.remove(consumer_tag) else {
            return Ok(());
        };

        self.channel
            .basic_cancel(consumer_tag.0.as_ref().into(), BasicCancelOptions::default())
            .await
            .map_err(|e| amqp_error("cancel", e))?;

        // The stream ends after cancel-ok; wait so no delivery slips past the
        // requeue below.
        let abort = handle.abort_handle();
        if tokio::time::timeout(CANCEL_DRAIN_TIMEOUT, handle).await.is_err() {
            log_warn!("[{}] consumer {consumer_tag} did not drain; aborting", self.transport_id);
            abort.abort();
        }

        let mut held: Vec<u64> = {
            let mut outstanding = lock_ignore_poison(&self.outstanding);
            let tags: Vec<u64> = outstanding
                .iter()
                .filter(|(_, held)| held.consumer_tag == *consumer_tag)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in &tags {
                outstanding.remove(tag);
            }
            tags
        };

        held.sort_unstable();
        for tag in held {
            let options = BasicNackOptions {
                multiple: false,
                requeue: true,
            };
            if let Err(e) = self.channel.basic_nack(tag, options).await {
                log_error!("[{}] Failed to requeue delivery {tag}: {e}", self.transport_id);
            }
        }

        log_debug!("[{}] Cancelled consumer {consumer_tag}", self.transport_id);
        Ok(())
    }

    async fn do_settle(&mut self, tag: u64, outcome: Settlement) -> Result<()> {
        // ---
        // Settling an unknown tag is a channel error in AMQP; reject it here.
        let Some(held) = lock_ignore_poison(&self.outstanding).remove(&tag) else {
            return Err(BusError::UnknownDeliveryTag(tag));
        };

        match outcome {
            Settlement::Ack => self.ack(tag).await,
            Settlement::Nack { requeue: false } => self.nack(tag, false).await,
            Settlement::Nack { requeue: true } => self.retry(tag, held).await,
        }
    }

    async fn ack(&self, tag: u64) -> Result<()> {
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| amqp_error("ack", e))
    }

    async fn nack(&self, tag: u64, requeue: bool) -> Result<()> {
        // ---
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.channel
            .basic_nack(tag, options)
            .await
            .map_err(|e| amqp_error("nack", e))
    }

    /// Put a failed delivery back on its queue with its attempt count.
    async fn retry(&self, tag: u64, held: Held) -> Result<()> {
        // ---
        let properties = with_attempt(&held.properties, held.attempt);
        let republished = self
            .channel
            .basic_publish(
                "".into(),
                held.queue.as_ref().into(),
                BasicPublishOptions::default(),
                &held.body,
                properties,
            )
            .await;

        match republished {
            Ok(_) => {
                log_debug!(
                    "[{}] Republished delivery {tag} to '{}' after attempt {}",
                    self.transport_id,
                    held.queue,
                    held.attempt
                );
                self.ack(tag).await
            }
            Err(e) => {
                log_warn!("[{}] Republish of delivery {tag} failed, requeueing: {e}", self.transport_id);
                self.nack(tag, true).await
            }
        }
    }

    async fn do_publish(&mut self, exchange: &str, routing_key: &str, env: Envelope) -> Result<()> {
        // ---
        let properties = to_properties(&env);

        self.channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                &env.body,
                properties,
            )
            .await
            .map_err(|e| amqp_error("publish", e))?;

        log_debug!(
            "[{}] Published '{}' to '{exchange}' with key '{routing_key}'",
            self.transport_id,
            env.type_name
        );
        Ok(())
    }
}

/// Moves deliveries of one consumer from lapin to the consumer's inbox.
struct Forwarder {
    // ---
    transport_id: String,
    queue: Arc<str>,
    consumer_tag: ConsumerTag,
    outstanding: Outstanding,
    tx: mpsc::UnboundedSender<Delivery>,
}

impl Forwarder {
    async fn run(self, mut consumer: lapin::Consumer) {
        // ---
        use futures_lite::stream::StreamExt;

        let transport_id = &self.transport_id;
        while let Some(delivery_result) = consumer.next().await {
            match delivery_result {
                Ok(raw) => {
                    let tag = raw.delivery_tag;
                    let delivery = from_amqp_delivery(&raw, &self.queue, &self.consumer_tag);
                    let held = Held {
                        consumer_tag: self.consumer_tag.clone(),
                        queue: self.queue.clone(),
                        attempt: delivery.attempt,
                        properties: raw.properties,
                        body: raw.data,
                    };
                    lock_ignore_poison(&self.outstanding).insert(tag, held);

                    log_debug!("[{transport_id}] Received delivery {tag} on queue: {}", self.queue);

                    // A dropped inbox means the consumer is being cancelled; the
                    // delivery stays outstanding and is requeued by the cancel.
                    let _ = self.tx.send(delivery);
                }
                Err(e) => {
                    log_error!("[{transport_id}] Consumer error on {}: {e}", self.queue);
                    break;
                }
            }
        }

        log_info!("[{transport_id}] Consumer task ended for queue: {}", self.queue);
    }
}

fn to_properties(env: &Envelope) -> BasicProperties {
    // ---
    let mut properties = BasicProperties::default()
        .with_type(ShortString::from(env.type_name.to_string()))
        .with_content_type(ShortString::from(CONTENT_TYPE_JSON))
        .with_delivery_mode(PERSISTENT);

    if let Some(correlation_id) = &env.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(reply_to) = &env.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.0.as_ref()));
    }
    if !env.headers.is_empty() {
        properties = properties.with_headers(to_field_table(&env.headers));
    }
    properties
}

fn from_amqp_delivery(raw: &lapin::message::Delivery, queue: &Arc<str>, consumer_tag: &ConsumerTag) -> Delivery {
    // ---
    let properties = &raw.properties;

    let type_name = properties
        .kind()
        .as_ref()
        .map(|kind| kind.as_str())
        .unwrap_or_default();

    let headers = properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    let attempt = delivery_attempt(&headers, raw.redelivered);

    let mut envelope = Envelope::new(type_name, raw.data.clone().into());
    envelope.correlation_id = properties
        .correlation_id()
        .as_ref()
        .map(|id| id.as_str().into());
    envelope.reply_to = properties
        .reply_to()
        .as_ref()
        .map(|address| address.as_str().into());
    envelope.headers = headers;

    Delivery {
        tag: DeliveryTag(raw.delivery_tag),
        consumer_tag: consumer_tag.clone(),
        queue: queue.clone(),
        redelivered: raw.redelivered,
        attempt,
        envelope,
    }
}

fn delivery_attempt(headers: &Headers, redelivered: bool) -> u32 {
    // ---
    let count = |key: &str| {
        headers
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
    };

    let republished = count(ATTEMPT_HEADER).map(|n| n.saturating_add(1 + u32::from(redelivered)));
    let broker_counted = count(DELIVERY_COUNT_HEADER).map(|n| n.saturating_add(1));
    let flagged = if redelivered { 2 } else { 1 };

    [republished, broker_counted].into_iter().flatten().fold(flagged, u32::max)
}

/// `properties` with the attempt header set to `attempt`.
fn with_attempt(properties: &BasicProperties, attempt: u32) -> BasicProperties {
    // ---
    let mut headers = properties.headers().clone().unwrap_or_default();
    headers.insert(ShortString::from(ATTEMPT_HEADER), AMQPValue::LongUInt(attempt));
    properties.clone().with_headers(headers)
}

fn to_field_table(headers: &Headers) -> FieldTable {
    // ---
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
            serde_json::Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => AMQPValue::LongLongInt(i),
                None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
            },
            other => AMQPValue::LongString(LongString::from(other.to_string())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    // ---
    let mut headers = Headers::new();
    for (key, value) in table.inner() {
        let value = match value {
            AMQPValue::Boolean(b) => serde_json::Value::Bool(*b),
            AMQPValue::LongString(s) => {
                serde_json::Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
            }
            AMQPValue::ShortString(s) => serde_json::Value::String(s.as_str().to_string()),
            AMQPValue::LongLongInt(i) => (*i).into(),
            AMQPValue::LongInt(i) => (*i).into(),
            AMQPValue::LongUInt(i) => (*i).into(),
            AMQPValue::ShortInt(i) => (*i).into(),
            AMQPValue::ShortUInt(i) => (*i).into(),
            _ => continue,
        };
        headers.insert(key.as_str().to_string(), value);
    }
    headers
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    // ---
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    async fn declare_queue(&self, spec: QueueSpec) -> Result<QueueHandle> {
        self.call(|resp| Cmd::DeclareQueue { spec, resp }).await
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<ExchangeHandle> {
        // ---
        let name = name.to_string();
        self.call(|resp| Cmd::DeclareExchange { name, kind, resp }).await
    }

    async fn bind(
        &self,
        queue: &QueueHandle,
        exchange: &ExchangeHandle,
        routing_keys: &[String],
    ) -> Result<()> {
        // ---
        if exchange.is_default() {
            return Err(BusError::Transport("the default exchange cannot be bound".into()));
        }
        self.call(|resp| Cmd::Bind {
            queue: queue.name.to_string(),
            exchange: exchange.name.to_string(),
            routing_keys: routing_keys.to_vec(),
            resp,
        })
        .await
    }

    async fn consume(&self, queue: &QueueHandle, prefetch_count: u16) -> Result<ConsumerHandle> {
        // ---
        self.call(|resp| Cmd::Consume {
            queue: queue.name.to_string(),
            prefetch_count,
            resp,
        })
        .await
    }

    async fn cancel(&self, consumer_tag: &ConsumerTag) -> Result<()> {
        // ---
        let consumer_tag = consumer_tag.clone();
        self.call(|resp| Cmd::Cancel { consumer_tag, resp }).await
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        // ---
        self.call(|resp| Cmd::Settle {
            tag: tag.0,
            outcome: Settlement::Ack,
            resp,
        })
        .await
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        // ---
        self.call(|resp| Cmd::Settle {
            tag: tag.0,
            outcome: Settlement::Nack { requeue },
            resp,
        })
        .await
    }

    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<()> {
        // ---
        self.call(|resp| Cmd::Publish {
            exchange: exchange.name.to_string(),
            routing_key: routing_key.to_string(),
            env: envelope,
            resp,
        })
        .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        let _ = self.cmd_tx.send(Cmd::Close { resp: tx }).await;
        let _ = rx.await;

        let actor = lock_ignore_poison(&self.actor).take();
        if let Some(handle) = actor {
            let _ = handle.await;
        }

        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.events.send(ConnectionEvent::Disconnected);
        }
        Ok(())
    }
}

/// Creates a lapin-based AMQP transport connected to `uri`.
///
/// # Errors
///
/// Returns [`BusError::Transport`] if the URI cannot be parsed or the
/// connection or channel cannot be opened.
///
/// # Connection Behavior
///
/// The connection to the broker happens immediately during transport creation.
pub async fn create_transport(transport_id: &str, uri: &str) -> Result<TransportPtr> {
    // ---
    let (connection, channel) = create_amqp_connection(uri).await?;
    Ok(AmqpTransport::create(transport_id, connection, channel))
}

/// Creates an AMQP connection and channel.
async fn create_amqp_connection(uri: &str) -> Result<(Connection, Channel)> {
    // ---
    log_info!("Connecting to AMQP broker: {uri}");

    let connection = Connection::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|e| {
            let msg = format!("amqp: connection failed: {e}");
            log_error!("{msg}");
            BusError::Transport(msg)
        })?;

    log_info!("Connected to AMQP broker");

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        BusError::Transport(msg)
    })?;

    log_info!("Created AMQP channel");

    Ok((connection, channel))
}
