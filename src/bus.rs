// src/bus.rs

//! The message bus.
//!
//! [`Bus`] ties one transport connection to the subscriber, dispatch and RPC
//! layers. Publishing, subscribing, requesting and responding all go through
//! it, and disposing it tears them down in a fixed order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};

use crate::consumer::{ErrorStrategyPtr, RunningDispatcher};
use crate::macros::{log_debug, log_info, log_warn};
use crate::rpc::{self, ResponderContext, ResponseTasks, RpcRequester};
use crate::{
    // ---
    BuildContext,
    BusConfig,
    BusError,
    ConnectionEvent,
    ConsumerTag,
    Conventions,
    DispatchState,
    Envelope,
    ExchangeKind,
    HandlerError,
    Message,
    Result,
    SubscriberBuilder,
    SubscriberConfiguration,
    TransportPtr,
};

struct Inner {
    // ---
    transport: TransportPtr,
    conventions: Arc<dyn Conventions>,
    error_strategy: ErrorStrategyPtr,
    config: BusConfig,
    subscriptions: DashMap<u64, Arc<RunningDispatcher>>,
    next_subscription: AtomicU64,
    requester: RpcRequester,
    responses: Arc<ResponseTasks>,
    shutdown_tx: watch::Sender<bool>,
    disposed: AtomicBool,
}

/// A message bus over one transport connection.
///
/// Cheap to clone; all clones share the same subscriptions and pending
/// requests. Create one with [`BusBuilder`](crate::BusBuilder).
///
/// # Example
///
/// ```
/// use mom_bus::transport::memory::MemoryBroker;
/// use mom_bus::{BusBuilder, Message};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Greeting { text: String }
/// impl Message for Greeting {}
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mom_bus::Result<()> {
/// let broker = MemoryBroker::new();
/// let bus = BusBuilder::new(broker.connect("app")).build()?;
///
/// let subscription = bus
///     .subscribe("printer", |greeting: Greeting| {
///         println!("{}", greeting.text);
///         Ok::<(), &str>(())
///     })
///     .await?;
///
/// bus.publish(&Greeting { text: "hello".into() }).await?;
///
/// subscription.dispose().await;
/// bus.dispose().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    /// Create a bus (internal use by BusBuilder).
    pub(crate) fn new(
        transport: TransportPtr,
        conventions: Arc<dyn Conventions>,
        error_strategy: ErrorStrategyPtr,
        config: BusConfig,
    ) -> Self {
        // ---
        let requester = RpcRequester::new(
            transport.clone(),
            conventions.clone(),
            error_strategy.clone(),
            config.default_prefetch_count,
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                transport,
                conventions,
                error_strategy,
                config,
                subscriptions: DashMap::new(),
                next_subscription: AtomicU64::new(1),
                requester,
                responses: Arc::new(ResponseTasks::default()),
                shutdown_tx,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// The transport this bus runs on.
    pub fn transport(&self) -> &TransportPtr {
        &self.inner.transport
    }

    /// The naming conventions in use.
    pub fn conventions(&self) -> &dyn Conventions {
        self.inner.conventions.as_ref()
    }

    /// The tunables this bus was built with.
    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// True while the transport reports a live connection.
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Subscribe to the transport's connection state changes.
    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.transport.connection_events()
    }

    /// True once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Number of active subscriptions, responders included.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    /// Number of RPC requests still waiting for a response.
    pub fn pending_request_count(&self) -> usize {
        self.inner.requester.pending_count()
    }

    // ---- publishing -------------------------------------------------------

    /// Publish `message` to its type's exchange with an empty routing key.
    ///
    /// Only subscriptions without topics (bound with `"#"`) receive it.
    pub async fn publish<T: Message>(&self, message: &T) -> Result<()> {
        self.publish_with_topic(message, "").await
    }

    /// Publish `message` to its type's exchange with `topic` as routing key.
    pub async fn publish_with_topic<T: Message>(&self, message: &T, topic: &str) -> Result<()> {
        // ---
        self.ensure_active()?;

        let envelope = Envelope::for_message(message)?;
        let exchange = self
            .inner
            .transport
            .declare_exchange(
                &self.inner.conventions.exchange_name(&envelope.type_name),
                ExchangeKind::Topic,
            )
            .await?;

        self.inner.transport.publish(&exchange, topic, envelope).await
    }

    // ---- subscribing ------------------------------------------------------

    /// Subscribe a synchronous handler under `subscription_id`.
    pub async fn subscribe<T, F, E>(&self, subscription_id: &str, handler: F) -> Result<SubscriptionHandle>
    where
        T: Message,
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Into<HandlerError>,
    {
        self.subscribe_with(
            SubscriberBuilder::<T>::new()
                .subscription_id(subscription_id)
                .handler(handler),
        )
        .await
    }

    /// Subscribe a synchronous handler to the given topics only.
    pub async fn subscribe_with_topics<T, F, E, I, S>(
        &self,
        subscription_id: &str,
        topics: I,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        T: Message,
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Into<HandlerError>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_with(
            SubscriberBuilder::<T>::new()
                .subscription_id(subscription_id)
                .with_topics(topics)
                .handler(handler),
        )
        .await
    }

    /// Subscribe an async handler under `subscription_id`.
    pub async fn subscribe_async<T, F, Fut, E>(
        &self,
        subscription_id: &str,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        T: Message,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<HandlerError>,
    {
        self.subscribe_with(
            SubscriberBuilder::<T>::new()
                .subscription_id(subscription_id)
                .handler_async(handler),
        )
        .await
    }

    /// Build `builder` and start consuming.
    ///
    /// Returns once the consumer is attached, so subscriptions started one
    /// after another join their queue in that order.
    pub async fn subscribe_with<T>(&self, builder: SubscriberBuilder<T>) -> Result<SubscriptionHandle> {
        // ---
        self.ensure_active()?;

        let config = builder.build(&BuildContext {
            conventions: self.inner.conventions.as_ref(),
            default_prefetch_count: self.inner.config.default_prefetch_count,
        })?;
        self.start_subscription(config).await
    }

    async fn start_subscription(&self, config: SubscriberConfiguration) -> Result<SubscriptionHandle> {
        // ---
        let queue = config.topology().declare(&self.inner.transport).await?;
        let dispatcher = Arc::new(
            RunningDispatcher::start(
                self.inner.transport.clone(),
                queue,
                config,
                self.inner.error_strategy.clone(),
            )
            .await?,
        );

        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner.subscriptions.insert(id, dispatcher.clone());

        // Lost a race with dispose(): it will not see this entry.
        if self.is_disposed() {
            self.inner.subscriptions.remove(&id);
            dispatcher.stop().await;
            return Err(BusError::Shutdown);
        }

        Ok(SubscriptionHandle {
            id,
            dispatcher,
            bus: Arc::downgrade(&self.inner),
        })
    }

    // ---- rpc --------------------------------------------------------------

    /// Send `request` and wait for its response, up to the configured
    /// request timeout.
    ///
    /// # Errors
    ///
    /// - [`BusError::TransportDisconnected`] if the transport is down; no
    ///   request is left pending.
    /// - [`BusError::Responder`] if the responder failed.
    /// - [`BusError::RpcTimeout`] if no response arrived in time.
    /// - [`BusError::Shutdown`] if the bus was disposed meanwhile.
    pub async fn request<Req, Res>(&self, request: &Req) -> Result<Res>
    where
        Req: Message,
        Res: Message,
    {
        self.request_with_timeout(request, self.inner.config.request_timeout)
            .await
    }

    /// [`request`](Self::request) with an explicit timeout.
    pub async fn request_with_timeout<Req, Res>(&self, request: &Req, timeout: Duration) -> Result<Res>
    where
        Req: Message,
        Res: Message,
    {
        // ---
        self.ensure_active()?;
        self.inner.requester.request(request, timeout).await
    }

    /// Serve requests of type `Req` with a synchronous responder.
    ///
    /// The responder runs on tokio's blocking pool.
    pub async fn respond<Req, Res, F, E>(&self, responder: F) -> Result<SubscriptionHandle>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req) -> std::result::Result<Res, E> + Send + Sync + 'static,
        E: Into<HandlerError> + Send + 'static,
    {
        self.respond_async::<Req, Res, _, _, HandlerError>(rpc::blocking_responder(responder))
            .await
    }

    /// Serve requests of type `Req` with an async responder.
    ///
    /// Each response is published to the caller's reply queue once the
    /// transport is connected. A responder error is sent back to the caller,
    /// which sees it as [`BusError::Responder`].
    pub async fn respond_async<Req, Res, F, Fut, E>(&self, responder: F) -> Result<SubscriptionHandle>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Res, E>> + Send + 'static,
        E: Into<HandlerError>,
    {
        // ---
        self.ensure_active()?;

        let queue = rpc::declare_request_queue(
            &self.inner.transport,
            self.inner.conventions.as_ref(),
            &Req::type_name(),
        )
        .await?;

        let ctx = ResponderContext {
            transport: self.inner.transport.clone(),
            poll_interval: self.inner.config.connect_poll_interval,
            shutdown: self.inner.shutdown_tx.subscribe(),
            tasks: self.inner.responses.clone(),
        };

        self.subscribe_with(rpc::responder_subscription::<Req, Res, F, Fut, E>(
            queue, ctx, responder,
        ))
        .await
    }

    // ---- lifecycle --------------------------------------------------------

    /// Shut the bus down.
    ///
    /// In order: responses waiting for a lost connection give up, the error
    /// strategy is disposed, pending requests fail with
    /// [`BusError::Shutdown`], every subscription stops (handlers already
    /// running finish and are settled), responses still being published are
    /// waited for, and the transport is closed. Calling it again does nothing.
    pub async fn dispose(&self) {
        // ---
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        log_info!("disposing bus on transport {}", self.inner.transport.transport_id());

        self.inner.shutdown_tx.send_replace(true);
        self.inner.error_strategy.dispose();
        self.inner.requester.shutdown().await;

        let ids: Vec<u64> = self.inner.subscriptions.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, dispatcher)) = self.inner.subscriptions.remove(&id) {
                dispatcher.stop().await;
            }
        }

        self.inner.responses.drain().await;

        // Requests registered while subscriptions were stopping.
        self.inner.requester.shutdown().await;

        if let Err(e) = self.inner.transport.close().await {
            log_warn!("failed to close transport: {e}");
        }
        log_debug!("bus disposed");
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            Err(BusError::Shutdown)
        } else {
            Ok(())
        }
    }
}

/// A running subscription.
///
/// Dropping the handle does not stop the subscription; call
/// [`dispose`](Self::dispose), or dispose the bus.
pub struct SubscriptionHandle {
    // ---
    id: u64,
    dispatcher: Arc<RunningDispatcher>,
    bus: Weak<Inner>,
}

impl SubscriptionHandle {
    /// Queue this subscription consumes.
    pub fn queue_name(&self) -> &str {
        self.dispatcher.queue()
    }

    /// Transport-assigned consumer tag.
    pub fn consumer_tag(&self) -> &ConsumerTag {
        self.dispatcher.consumer_tag()
    }

    /// Current state of the dispatch loop.
    pub fn state(&self) -> DispatchState {
        self.dispatcher.state()
    }

    /// Wait until the dispatch loop has stopped, for whatever reason.
    pub async fn stopped(&self) {
        // ---
        let mut state = self.dispatcher.watch_state();
        let _ = state.wait_for(|state| state.is_stopped()).await;
    }

    /// Stop this subscription.
    ///
    /// A handler already running finishes and its delivery is settled;
    /// deliveries buffered but not yet dispatched go back to the queue.
    pub async fn dispose(self) {
        // ---
        if let Some(bus) = self.bus.upgrade() {
            bus.subscriptions.remove(&self.id);
        }
        self.dispatcher.stop().await;
    }
}
