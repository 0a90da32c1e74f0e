//! Listener registry.
//!
//! A fixed-size typed dispatch table from named callback slots to at most one
//! handler each. Registration is a shallow merge: [`Listeners`] carries a
//! partial set of handlers and `on` overwrites any slot it names, so the last
//! registered handler wins. There is no fan-out to multiple subscribers per
//! slot.
//!
//! Dispatch for a slot is a single direct invocation. Handlers are cloned out
//! of the table before being called, so a callback may re-enter the registry
//! (register, remove, send) without deadlocking.
//!
//! # Slots
//!
//! | Slot | Handler signature | Fired on |
//! |------|-------------------|----------|
//! | `Connect` | `Fn()` | transport open |
//! | `Disconnect` | `Fn(&str)` | transport close, with a reason |
//! | `Error` | `Fn(&Error)` | construction/transport/server errors |
//! | `Reconnect` | `Fn(u32)` | each reconnect attempt, with its number |
//! | `Message` | `Fn(&Envelope)` | every well-formed inbound envelope |
//! | `GuidanceResponse` | `Fn(&Envelope)` | `guidance_response` frames |
//! | `MessageType(t)` | `Fn(&Envelope)` | frames whose type equals `t` |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::Error;
use crate::protocol::{Envelope, message_type};

// ============================================================================
// Handler Types
// ============================================================================

/// Handler for the connect slot.
pub type ConnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Handler for the disconnect slot; receives the close reason.
pub type DisconnectHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Handler for the error slot.
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Handler for the reconnect slot; receives the attempt number.
pub type ReconnectHandler = Arc<dyn Fn(u32) + Send + Sync>;

/// Handler for envelope-carrying slots.
pub type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;

// ============================================================================
// Slot
// ============================================================================

/// A named callback position in the dispatch table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Fired when the transport opens.
    Connect,
    /// Fired when the transport closes.
    Disconnect,
    /// Fired for every externally visible failure.
    Error,
    /// Fired on each reconnect attempt.
    Reconnect,
    /// Fired for every well-formed inbound envelope.
    Message,
    /// Dedicated slot for `guidance_response` frames.
    GuidanceResponse,
    /// Dedicated slot for frames of an arbitrary message type.
    MessageType(String),
}

impl Slot {
    /// The message type a per-type slot listens for, if any.
    fn type_key(&self) -> Option<&str> {
        match self {
            Self::GuidanceResponse => Some(message_type::GUIDANCE_RESPONSE),
            Self::MessageType(name) => Some(name),
            _ => None,
        }
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// A partial set of handlers to merge into the registry.
///
/// Only the slots named here are touched; existing handlers under other
/// slots are left in place.
///
/// # Example
///
/// ```ignore
/// use guidelink::Listeners;
///
/// client.on(
///     Listeners::new()
///         .on_connect(|| println!("connected"))
///         .on_guidance_response(|envelope| println!("{envelope:?}")),
/// );
/// ```
#[derive(Default)]
pub struct Listeners {
    pub(crate) connect: Option<ConnectHandler>,
    pub(crate) disconnect: Option<DisconnectHandler>,
    pub(crate) error: Option<ErrorHandler>,
    pub(crate) reconnect: Option<ReconnectHandler>,
    pub(crate) message: Option<MessageHandler>,
    pub(crate) by_type: Vec<(String, MessageHandler)>,
}

impl Listeners {
    /// Creates an empty set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the connect handler.
    #[must_use]
    pub fn on_connect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.connect = Some(Arc::new(handler));
        self
    }

    /// Sets the disconnect handler.
    #[must_use]
    pub fn on_disconnect(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.disconnect = Some(Arc::new(handler));
        self
    }

    /// Sets the error handler.
    #[must_use]
    pub fn on_error(mut self, handler: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(handler));
        self
    }

    /// Sets the reconnect handler.
    #[must_use]
    pub fn on_reconnect(mut self, handler: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.reconnect = Some(Arc::new(handler));
        self
    }

    /// Sets the generic message handler.
    #[must_use]
    pub fn on_message(mut self, handler: impl Fn(&Envelope) + Send + Sync + 'static) -> Self {
        self.message = Some(Arc::new(handler));
        self
    }

    /// Sets the dedicated `guidance_response` handler.
    #[must_use]
    pub fn on_guidance_response(
        self,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Self {
        self.on_message_type(message_type::GUIDANCE_RESPONSE, handler)
    }

    /// Sets a dedicated handler for an arbitrary message type.
    #[must_use]
    pub fn on_message_type(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&Envelope) + Send + Sync + 'static,
    ) -> Self {
        self.by_type.push((name.into(), Arc::new(handler)));
        self
    }
}

// ============================================================================
// ListenerTable
// ============================================================================

/// The dispatch table itself.
///
/// Mutated only through `merge`/`remove`; read-only during dispatch.
#[derive(Default)]
pub(crate) struct ListenerTable {
    connect: Option<ConnectHandler>,
    disconnect: Option<DisconnectHandler>,
    error: Option<ErrorHandler>,
    reconnect: Option<ReconnectHandler>,
    message: Option<MessageHandler>,
    by_type: FxHashMap<String, MessageHandler>,
}

impl ListenerTable {
    /// Merges a partial handler set, overwriting named slots.
    pub(crate) fn merge(&mut self, listeners: Listeners) {
        if let Some(handler) = listeners.connect {
            self.connect = Some(handler);
        }
        if let Some(handler) = listeners.disconnect {
            self.disconnect = Some(handler);
        }
        if let Some(handler) = listeners.error {
            self.error = Some(handler);
        }
        if let Some(handler) = listeners.reconnect {
            self.reconnect = Some(handler);
        }
        if let Some(handler) = listeners.message {
            self.message = Some(handler);
        }
        for (name, handler) in listeners.by_type {
            self.by_type.insert(name, handler);
        }
    }

    /// Removes the handler under the given slot.
    pub(crate) fn remove(&mut self, slot: &Slot) {
        if let Some(key) = slot.type_key() {
            self.by_type.remove(key);
            return;
        }
        match slot {
            Slot::Connect => self.connect = None,
            Slot::Disconnect => self.disconnect = None,
            Slot::Error => self.error = None,
            Slot::Reconnect => self.reconnect = None,
            Slot::Message => self.message = None,
            Slot::GuidanceResponse | Slot::MessageType(_) => {}
        }
    }

    /// Returns the connect handler, if registered.
    pub(crate) fn connect(&self) -> Option<ConnectHandler> {
        self.connect.clone()
    }

    /// Returns the disconnect handler, if registered.
    pub(crate) fn disconnect(&self) -> Option<DisconnectHandler> {
        self.disconnect.clone()
    }

    /// Returns the error handler, if registered.
    pub(crate) fn error(&self) -> Option<ErrorHandler> {
        self.error.clone()
    }

    /// Returns the reconnect handler, if registered.
    pub(crate) fn reconnect(&self) -> Option<ReconnectHandler> {
        self.reconnect.clone()
    }

    /// Returns the generic message handler, if registered.
    pub(crate) fn message(&self) -> Option<MessageHandler> {
        self.message.clone()
    }

    /// Returns the dedicated handler for a message type, if registered.
    pub(crate) fn for_type(&self, name: &str) -> Option<MessageHandler> {
        self.by_type.get(name).cloned()
    }
}

// ============================================================================
// Tests
// ============================================================================
