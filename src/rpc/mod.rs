// src/rpc/mod.rs

//! Request/response over the bus.
//!
//! The responder side is an ordinary subscription on a durable queue named
//! after the request type, bound to the direct RPC exchange. The caller side
//! correlates responses arriving on a private reply queue with the requests
//! waiting for them.

mod pending;
mod requester;
mod responder;

pub(crate) use requester::RpcRequester;
pub(crate) use responder::{blocking_responder, declare_request_queue, responder_subscription, ResponderContext, ResponseTasks};

/// Header marking a response as a responder failure; its value is the
/// failure message.
pub const ERROR_HEADER: &str = "x-mom-bus-error";
