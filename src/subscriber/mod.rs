// src/subscriber/mod.rs

//! Subscriber configuration.
//!
//! A subscription is described by a [`SubscriberBuilder`] and frozen into a
//! [`SubscriberConfiguration`] before anything is declared on a transport.
//! Handlers of every supported shape are erased here into one async contract
//! that the dispatcher drives.

mod builder;
mod configuration;
pub(crate) mod handler;
pub(crate) mod verifier;

pub use builder::{BuildContext, SubscriberBuilder, HA_POLICY_ARGUMENT, MATCH_ALL_TOPICS};
pub use configuration::{SubscriberConfiguration, SubscriberTopology};
pub use handler::ReceivedInfo;
