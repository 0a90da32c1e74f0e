//! Transport layer.
//!
//! The connection manager speaks to the peer through the [`Transport`] seam:
//! dialing an endpoint yields a [`TransportLink`] carrying a frame sink, an
//! ordered event stream, and a readiness flag.
//!
//! # Event Ordering
//!
//! For a given link, events arrive in the order:
//!
//! ```text
//! (zero or more Frame) → (Error)? → Closed
//! ```
//!
//! The connection manager relies on this ordering: an error never schedules
//! reconnection on its own, the trailing close does.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `ws` | WebSocket transport (`tokio-tungstenite`) |
//! | `tcp` | Raw newline-delimited TCP transport for embedded peers |

// ============================================================================
// Imports
// ============================================================================

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use futures_util::Stream;
use url::Url;

use crate::error::Result;

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket transport.
pub mod ws;

/// Raw newline-delimited TCP transport.
pub mod tcp;

#[cfg(test)]
pub(crate) mod mock;

// ============================================================================
// Re-exports
// ============================================================================

pub use tcp::TcpTransport;
pub use ws::WebSocketTransport;

// ============================================================================
// Types
// ============================================================================

/// An event produced by an open transport link.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete inbound text frame.
    Frame(String),

    /// A transport-level failure. Expected to be followed by `Closed`.
    Error(crate::error::Error),

    /// The link closed, with a reason string.
    Closed {
        /// Why the link closed.
        reason: String,
    },
}

/// Ordered stream of events from an open link.
pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

// ============================================================================
// FrameSink
// ============================================================================

/// Write half of an open link.
#[async_trait]
pub trait FrameSink: Send {
    /// Writes one text frame.
    async fn send(&mut self, frame: String) -> Result<()>;

    /// Closes the link gracefully. Errors during close are ignored.
    async fn close(&mut self);
}

// ============================================================================
// TransportLink
// ============================================================================

/// An open bidirectional link to the peer.
pub struct TransportLink {
    /// Write half.
    pub sink: Box<dyn FrameSink>,

    /// Ordered event stream (read half).
    pub events: EventStream,

    /// Readiness flag maintained by the transport. Cleared when the link is
    /// no longer writable, independently of the manager's own state; the
    /// manager consults both.
    pub ready: Arc<AtomicBool>,
}

// ============================================================================
// Transport
// ============================================================================

/// A dialer producing open links.
///
/// Implementations must resolve the full connect sequence (TCP, upgrade,
/// whatever the flavor needs) before returning; a returned link is open.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dials the endpoint and returns an open link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`](crate::Error::Connection) or a
    /// transport-specific error when the link cannot be established.
    async fn dial(&self, endpoint: &Url) -> Result<TransportLink>;
}
