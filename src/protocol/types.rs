//! Reserved message types and typed server payloads.
//!
//! The envelope payload is opaque to the routing core, but the reserved
//! server-originated types carry well-known shapes. The structs here let
//! collaborators decode them without hand-parsing `serde_json::Value`.
//!
//! # Reserved Types
//!
//! | Direction | Types |
//! |-----------|-------|
//! | client → server | `authenticate`, `send_video_frame`, `send_audio`, `send_imu_data`, `request_guidance` |
//! | server → client | `connection_ack`, `guidance_response`, `error` |

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

// ============================================================================
// Message Type Constants
// ============================================================================

/// Reserved message type names.
pub mod message_type {
    /// Client → server: authentication handshake.
    pub const AUTHENTICATE: &str = "authenticate";

    /// Client → server: camera frame from the capture pipeline.
    pub const SEND_VIDEO_FRAME: &str = "send_video_frame";

    /// Client → server: audio chunk.
    pub const SEND_AUDIO: &str = "send_audio";

    /// Client → server: inertial sensor sample.
    pub const SEND_IMU_DATA: &str = "send_imu_data";

    /// Client → server: explicit guidance request.
    pub const REQUEST_GUIDANCE: &str = "request_guidance";

    /// Server → client: handshake acknowledgement, sets the authentication
    /// flag.
    pub const CONNECTION_ACK: &str = "connection_ack";

    /// Server → client: guidance result, forwarded to its dedicated listener
    /// slot.
    pub const GUIDANCE_RESPONSE: &str = "guidance_response";

    /// Server → client: error frame, forwarded to the error listener as a
    /// constructed error.
    pub const ERROR: &str = "error";
}

// ============================================================================
// ConnectionAck
// ============================================================================

/// Payload of a `connection_ack` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAck {
    /// Session identifier assigned by the service.
    #[serde(rename = "sessionId")]
    pub session_id: String,

    /// Server clock at acknowledgement time, epoch milliseconds.
    #[serde(rename = "serverTime", default)]
    pub server_time: Option<i64>,
}

// ============================================================================
// GuidanceResponse
// ============================================================================

/// Payload of a `guidance_response` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceResponse {
    /// Guidance text for the user.
    pub guidance: String,

    /// Model confidence in the guidance, when reported.
    #[serde(default)]
    pub confidence: Option<f64>,

    /// Reference to a pre-rendered audio asset, when available.
    #[serde(rename = "audioRef", default)]
    pub audio_ref: Option<String>,
}

// ============================================================================
// ErrorPayload
// ============================================================================

/// Payload of a reserved `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable error code.
    pub code: String,

    /// Human-readable error message.
    pub message: String,
}

// ============================================================================
// Tests
// ============================================================================
