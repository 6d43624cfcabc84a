// src/subscriber/verifier.rs

//! Delivery type verification.

use crate::macros::log_error;
use crate::{BusError, Envelope, Result};

/// Check that `envelope` declares exactly the `expected` type name.
///
/// Comparison is plain string equality; no structural or case-insensitive
/// matching. A mismatch is logged here and returned as
/// [`BusError::MessageTypeMismatch`], which the dispatcher then treats like
/// any other handler failure.
pub(crate) fn check_message_type(expected: &str, envelope: &Envelope) -> Result<()> {
    // ---
    if envelope.type_name.as_ref() == expected {
        return Ok(());
    }

    log_error!(
        "message type is incorrect: expected '{expected}', but was '{}'",
        envelope.type_name
    );

    Err(BusError::MessageTypeMismatch {
        expected: expected.to_string(),
        actual: envelope.type_name.to_string(),
    })
}
