//! Error types for the GuideLink client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use guidelink::{Envelope, Result};
//!
//! fn example(wire: &str) -> Result<Envelope> {
//!     let envelope = Envelope::decode(wire)?;
//!     Ok(envelope)
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidEndpoint`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`] |
//! | Protocol | [`Error::Protocol`], [`Error::Server`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |
//!
//! The [`Client`](crate::Client) never returns transport failures from its
//! public methods; they surface through the registered error listener slot
//! instead.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client configuration is invalid. Configuration errors
    /// are fatal to the current connect attempt and are never retried
    /// automatically.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Endpoint address could not be parsed.
    ///
    /// Treated as a configuration error, not a transient network error.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport connection failed.
    ///
    /// Returned when the connection cannot be established or breaks
    /// mid-operation.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Transport connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or malformed envelope.
    ///
    /// Malformed inbound frames are logged and discarded; this variant
    /// surfaces only from the codec itself.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Error pushed by the remote service.
    ///
    /// Constructed from a reserved `error` frame. Authentication failures
    /// arrive through this variant; they are not structurally distinguished
    /// from other server-side errors.
    #[error("Server error {code}: {message}")]
    Server {
        /// Machine-readable error code from the service.
        code: String,
        /// Human-readable error message from the service.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a server error from a reserved `error` frame payload.
    #[inline]
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a configuration error.
    ///
    /// Configuration errors are never retried automatically.
    #[inline]
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::InvalidEndpoint(_))
    }

    /// Returns `true` if this is a connection-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_) | Self::Io(_)
        )
    }

    /// Returns `true` if this error was pushed by the remote service.
    #[inline]
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Server { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
