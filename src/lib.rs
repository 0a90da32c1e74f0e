//! GuideLink client - resilient envelope-based socket client.
//!
//! This library maintains the persistent bidirectional connection between a
//! mobile coordination app and the remote guidance service (or, over the raw
//! TCP variant, a constrained embedded peer). It owns connection lifecycle,
//! automatic reconnection with linear-capped backoff, outbound queueing
//! while disconnected, and dispatch of inbound envelopes to listener slots.
//!
//! # Architecture
//!
//! Every message in either direction is wrapped in the same envelope:
//!
//! ```json
//! { "type": "...", "payload": {}, "timestamp": 0, "messageId": "..." }
//! ```
//!
//! Key design principles:
//!
//! - One [`Client`] owns one active connection, driven by a single manager
//!   task (no parallel mutation of connection state)
//! - Public methods never raise transport failures; errors surface through
//!   the error listener slot, sends absorb failure into the outbound queue
//! - Collaborators (capture pipeline, audio subsystem, navigation logic)
//!   interact only through the [`Client`] surface
//!
//! # Quick Start
//!
//! ```no_run
//! use guidelink::{Client, ClientConfig, Listeners};
//! use serde_json::json;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> guidelink::Result<()> {
//!     let config = ClientConfig::new(Url::parse("wss://guidance.example.com/session")?)
//!         .with_auth_token("device-token");
//!     let client = Client::new(config);
//!
//!     client.on(
//!         Listeners::new()
//!             .on_guidance_response(|envelope| println!("guidance: {:?}", envelope.payload))
//!             .on_disconnect(|reason| println!("connection lost: {reason}")),
//!     );
//!
//!     client.connect();
//!     client.send("request_guidance", &json!({ "query": "nearest exit" }));
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Connection manager, queue, listeners, backoff |
//! | [`config`] | Client configuration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`protocol`] | Envelope codec and reserved message types |
//! | [`transport`] | Transport seam: WebSocket and raw TCP dialers |

// ============================================================================
// Modules
// ============================================================================

/// Connection core: manager, queue, listeners, reconnect policy.
pub mod client;

/// Client configuration.
///
/// Use [`ClientConfig::new`] with builder-style `with_*` methods.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Wire protocol message types.
///
/// The envelope codec and typed payloads for reserved server messages.
pub mod protocol;

/// Transport layer.
///
/// The [`Transport`](transport::Transport) seam with WebSocket and raw TCP
/// implementations.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{Client, ConnectionState, Listeners, ReconnectPolicy, Slot};

// Configuration
pub use config::ClientConfig;

// Error types
pub use error::{Error, Result};

// Protocol types
pub use protocol::{ConnectionAck, Envelope, ErrorPayload, GuidanceResponse, message_type};

// Transport types
pub use transport::{TcpTransport, Transport, WebSocketTransport};
