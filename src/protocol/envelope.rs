//! Envelope codec.
//!
//! Every message on the wire, in either direction, is wrapped in the same
//! envelope structure. The codec is pure and stateless: encoding and decoding
//! touch no connection state.
//!
//! # Format
//!
//! ```json
//! {
//!   "type": "request_guidance",
//!   "payload": { ... },
//!   "timestamp": 1721923200123,
//!   "messageId": "uuid"
//! }
//! ```
//!
//! `messageId` is assigned by the client at send time and may be absent on
//! server-originated envelopes.

// ============================================================================
// Imports
// ============================================================================

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Envelope
// ============================================================================

/// The uniform wire structure wrapping every message.
///
/// Immutable once constructed. Client-originated envelopes get a fresh
/// `messageId` and a current epoch-millisecond timestamp via
/// [`Envelope::new`]; server-originated envelopes are taken as-is from
/// [`Envelope::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type used for routing. Never empty.
    #[serde(rename = "type")]
    pub message_type: String,

    /// Opaque payload. The client routes by type and does not interpret
    /// payload semantics.
    #[serde(default)]
    pub payload: Value,

    /// Creation time in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,

    /// Correlation identifier, absent on some server-originated envelopes.
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Envelope {
    /// Creates a client-originated envelope with a fresh message id and the
    /// current timestamp.
    #[must_use]
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
            message_id: Some(Uuid::new_v4().to_string()),
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

impl Envelope {
    /// Serializes the envelope to its wire string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a wire string into an envelope.
    ///
    /// Validates that the `type` field is present and non-empty; a frame
    /// without a type is noise from the peer, not a fatal error, and callers
    /// are expected to discard it.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the frame is not valid JSON or lacks a `type`
    /// - [`Error::Protocol`] if the `type` field is empty
    pub fn decode(wire: &str) -> Result<Self> {
        let envelope: Self = serde_json::from_str(wire)?;
        if envelope.message_type.is_empty() {
            return Err(Error::protocol("envelope has empty message type"));
        }
        Ok(envelope)
    }

    /// Deserializes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

// ============================================================================
// Tests
// ============================================================================
