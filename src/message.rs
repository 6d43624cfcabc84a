// src/message.rs

//! Typed messages and their JSON wire form.

use std::borrow::Cow;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Envelope, Result};

/// A payload type that can travel over the bus.
///
/// The type name is what subscribers compare, byte for byte, against the
/// `type_name` of each delivery. It defaults to the Rust type path; override
/// it to keep names stable across refactors or to interoperate with other
/// publishers.
///
/// ```
/// use mom_bus::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { id: u64 }
///
/// impl Message for OrderPlaced {
///     fn type_name() -> std::borrow::Cow<'static, str> {
///         "orders.OrderPlaced".into()
///     }
/// }
///
/// assert_eq!(OrderPlaced::type_name(), "orders.OrderPlaced");
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Serialized type name for this message type.
    fn type_name() -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

impl Envelope {
    /// Serialize `message` as JSON into a new envelope tagged with its type name.
    pub fn for_message<T: Message>(message: &T) -> Result<Self> {
        // ---
        let body = serde_json::to_vec(message)?;
        Ok(Envelope::new(T::type_name().as_ref(), Bytes::from(body)))
    }

    /// Decode the body as `T` without checking the type name.
    pub fn decode<T: Message>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {}

    #[test]
    fn test_default_type_name_is_type_path() {
        // ---
        assert!(Ping::type_name().ends_with("Ping"));
    }

    #[test]
    fn test_for_message_tags_and_encodes() {
        // ---
        let env = Envelope::for_message(&Ping { seq: 4 }).unwrap();
        assert_eq!(env.type_name.as_ref(), Ping::type_name());
        assert_eq!(env.decode::<Ping>().unwrap(), Ping { seq: 4 });
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // ---
        let env = Envelope::new(Ping::type_name().as_ref(), Bytes::from_static(b"not json"));
        assert!(env.decode::<Ping>().is_err());
    }
}
