//! Client configuration.
//!
//! Provides a type-safe interface for configuring the client: default
//! endpoint, reconnection policy, and the optional authentication token sent
//! automatically after the transport opens.
//!
//! # Example
//!
//! ```ignore
//! use guidelink::{ClientConfig, ReconnectPolicy};
//! use url::Url;
//!
//! let config = ClientConfig::new(Url::parse("wss://guidance.example.com/session")?)
//!     .with_auth_token("device-token")
//!     .with_reconnect(ReconnectPolicy::new().with_max_attempts(10));
//! ```

// ============================================================================
// Imports
// ============================================================================

use url::Url;

use crate::client::ReconnectPolicy;

// ============================================================================
// ClientConfig
// ============================================================================

/// Client configuration.
///
/// Owned by the composition root and handed to [`Client`](crate::Client) at
/// construction; there is no ambient global instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Default endpoint dialed when `connect` is called without an address.
    pub endpoint: Url,

    /// Token sent in an `authenticate` envelope immediately after the
    /// transport opens, before the outbound queue flushes. `None` leaves the
    /// handshake to the caller.
    pub auth_token: Option<String>,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
}

// ============================================================================
// Constructors
// ============================================================================

impl ClientConfig {
    /// Creates a configuration for the given default endpoint.
    #[inline]
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            auth_token: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ClientConfig {
    /// Sets the authentication token sent after each transport open.
    #[inline]
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets the reconnection policy.
    #[inline]
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
