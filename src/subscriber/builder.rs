// src/subscriber/builder.rs

//! Fluent subscriber builder.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use super::configuration::{SubscriberConfiguration, SubscriberTopology};
use super::handler::{self, HandlerFn, ReceivedInfo};
use crate::macros::log_warn;
use crate::{
    // ---
    BusError,
    Conventions,
    Delivery,
    HandlerError,
    Message,
    QueueHandle,
    QueueSpec,
    Result,
};

/// Queue argument requesting mirroring across broker nodes.
pub const HA_POLICY_ARGUMENT: &str = "x-ha-policy";

/// Routing key used when a derived subscription asks for no topic.
pub const MATCH_ALL_TOPICS: &str = "#";

/// Inputs the builder needs from the owning bus.
pub struct BuildContext<'a> {
    /// Naming policy for derived queues and exchanges.
    pub conventions: &'a dyn Conventions,
    /// Prefetch used when the builder sets none.
    pub default_prefetch_count: u16,
}

/// Fluent builder for one subscription.
///
/// Every setter consumes and returns the builder; nothing is validated until
/// [`build`](Self::build), which reports misuse as
/// [`BusError::Configuration`] and never touches a transport.
///
/// Exactly one queue source is required: a subscription id (the queue and
/// exchange are then derived from the message type through the conventions)
/// or an existing [`QueueHandle`]. Exactly one handler is required.
///
/// # Example
///
/// ```
/// use mom_bus::{BuildContext, DefaultConventions, Message, SubscriberBuilder};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Resize { width: u32 }
/// impl Message for Resize {}
///
/// let config = SubscriberBuilder::<Resize>::new()
///     .subscription_id("thumbnails")
///     .with_topic("images.png")
///     .with_prefetch_count(1)
///     .handler(|_job: Resize| Ok::<(), &str>(()))
///     .build(&BuildContext {
///         conventions: &DefaultConventions,
///         default_prefetch_count: 50,
///     })
///     .unwrap();
///
/// assert_eq!(config.prefetch_count(), 1);
/// assert_eq!(config.topics(), ["images.png".to_string()]);
/// ```
pub struct SubscriberBuilder<T = ()> {
    // ---
    type_name: Option<String>,
    subscription_ids: Vec<String>,
    queues: Vec<QueueHandle>,
    topics: Vec<String>,
    prefetch_count: Option<u16>,
    is_highly_available: bool,
    handlers: Vec<(HandlerFn, bool)>,
    _message: PhantomData<fn() -> T>,
}

impl<T: Message> SubscriberBuilder<T> {
    /// Start a builder for messages of type `T`.
    pub fn new() -> Self {
        Self::with_type_name(Some(T::type_name().into_owned()))
    }

    /// Handle each message synchronously.
    pub fn handler<F, E>(self, handler: F) -> Self
    where
        F: Fn(T) -> std::result::Result<(), E> + Send + Sync + 'static,
        E: Into<HandlerError>,
    {
        self.push_handler(handler::wrap_sync(handler), true)
    }

    /// Handle each message with an async handler.
    pub fn handler_async<F, Fut, E>(self, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<HandlerError>,
    {
        self.push_handler(handler::wrap_async(handler), true)
    }

    /// Handle each message with an async handler that also receives its
    /// delivery metadata.
    pub fn handler_with_info<F, Fut, E>(self, handler: F) -> Self
    where
        F: Fn(T, ReceivedInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<HandlerError>,
    {
        self.push_handler(handler::wrap_async_with_info(handler), true)
    }
}

impl<T: Message> Default for SubscriberBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberBuilder<()> {
    /// Start a builder with no message type.
    ///
    /// Raw builders must consume an existing queue and use
    /// [`handler_raw`](Self::handler_raw); deliveries are not type checked.
    pub fn raw() -> Self {
        Self::with_type_name(None)
    }
}

impl<T> SubscriberBuilder<T> {
    fn with_type_name(type_name: Option<String>) -> Self {
        // ---
        Self {
            type_name,
            subscription_ids: Vec::new(),
            queues: Vec::new(),
            topics: Vec::new(),
            prefetch_count: None,
            is_highly_available: false,
            handlers: Vec::new(),
            _message: PhantomData,
        }
    }

    fn push_handler(mut self, handler: HandlerFn, type_checked: bool) -> Self {
        self.handlers.push((handler, type_checked));
        self
    }

    /// Derive the queue from the message type and this subscription id.
    ///
    /// Subscriptions sharing a type and id share a queue and compete for its
    /// messages.
    pub fn subscription_id(mut self, id: impl Into<String>) -> Self {
        self.subscription_ids.push(id.into());
        self
    }

    /// Consume an existing queue instead of deriving one.
    pub fn queue(mut self, queue: QueueHandle) -> Self {
        self.queues.push(queue);
        self
    }

    /// Add a topic binding. Duplicates are ignored.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        if !self.topics.contains(&topic) {
            self.topics.push(topic);
        }
        self
    }

    /// Add several topic bindings. Duplicates are ignored.
    pub fn with_topics<I, S>(self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        topics.into_iter().fold(self, |builder, topic| builder.with_topic(topic))
    }

    /// Set the prefetch credit; the last call wins.
    ///
    /// `1` yields fair dispatch between competing consumers. `0` means
    /// unbounded and lets the transport push the whole backlog into memory.
    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = Some(prefetch_count);
        self
    }

    /// Declare the derived queue highly available; the last call wins.
    pub fn with_ha(mut self, is_highly_available: bool) -> Self {
        self.is_highly_available = is_highly_available;
        self
    }

    /// Handle raw deliveries without decoding or type checking.
    pub fn handler_raw<F, Fut, E>(self, handler: F) -> Self
    where
        F: Fn(Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), E>> + Send + 'static,
        E: Into<HandlerError>,
    {
        self.push_handler(handler::wrap_raw(handler), false)
    }

    /// Validate the builder and freeze it into a configuration.
    pub fn build(mut self, ctx: &BuildContext<'_>) -> Result<SubscriberConfiguration> {
        // ---
        let (handler, type_checked) = match self.handlers.len() {
            0 => return Err(config_error("no handler supplied")),
            1 => self.handlers.remove(0),
            _ => return Err(config_error("more than one handler supplied")),
        };

        let prefetch_count = self.prefetch_count.unwrap_or(ctx.default_prefetch_count);
        if prefetch_count == 0 {
            log_warn!(
                "prefetch count 0 is unbounded: the transport may deliver an entire backlog into memory"
            );
        }

        let topology = match (self.subscription_ids.len(), self.queues.len()) {
            (0, 0) => return Err(config_error("no subscription id or queue supplied")),

            (1, 0) => {
                let subscription_id = self.subscription_ids.remove(0);
                if subscription_id.trim().is_empty() {
                    return Err(config_error("subscription id must not be empty"));
                }
                let Some(type_name) = self.type_name.as_deref() else {
                    return Err(config_error(
                        "a subscription id needs a message type to derive the queue from",
                    ));
                };

                let mut queue =
                    QueueSpec::durable(ctx.conventions.queue_name(type_name, &subscription_id));
                if self.is_highly_available {
                    queue = queue.with_argument(HA_POLICY_ARGUMENT, serde_json::json!("all"));
                }

                let routing_keys = if self.topics.is_empty() {
                    vec![MATCH_ALL_TOPICS.to_string()]
                } else {
                    self.topics.clone()
                };

                SubscriberTopology::Declared {
                    queue,
                    exchange: ctx.conventions.exchange_name(type_name),
                    routing_keys,
                }
            }

            (0, 1) => {
                if !self.topics.is_empty() {
                    return Err(config_error(
                        "topics bind a derived queue and cannot be combined with an existing queue",
                    ));
                }
                if self.is_highly_available {
                    log_warn!("with_ha has no effect on an existing queue");
                }
                SubscriberTopology::Existing(self.queues.remove(0))
            }

            _ => {
                return Err(config_error(
                    "exactly one subscription id or queue must be supplied",
                ))
            }
        };

        let expected_type_name = match (type_checked, self.type_name) {
            (true, Some(name)) => Some(Arc::from(name)),
            _ => None,
        };

        Ok(SubscriberConfiguration {
            topology,
            topics: self.topics,
            prefetch_count,
            is_highly_available: self.is_highly_available,
            expected_type_name,
            handler,
        })
    }
}

fn config_error(message: &str) -> BusError {
    BusError::Configuration(message.to_string())
}
