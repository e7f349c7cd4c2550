//! JSON-lines wire frames.
//!
//! One JSON object per line, tagged by `type`:
//!
//! ```text
//! client  → {"type":"hello","session_id":12}
//! client  → {"type":"request","request_id":"…","payload":{…}}
//! gateway → {"type":"login_ack"} | {"type":"api_ready"}
//! gateway → {"type":"subsystem_pending","name":"hmds"} | {"type":"subsystem_ready","name":"hmds"}
//! gateway → {"type":"link_down"} | {"type":"link_restored"}
//! gateway → {"type":"response","request_id":"…","payload":{…}}
//! gateway → {"type":"error","request_id":"…","code":162,"message":"…"}
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::connection::TransportSignal;
use crate::domain::pacing::GatewayError;
use crate::domain::session::SessionId;

/// Frame codec errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Line is not a known frame.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frames sent to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Session greeting carrying the session id.
    Hello {
        /// Session id.
        session_id: SessionId,
    },
    /// Application request.
    Request {
        /// Correlation id.
        request_id: Uuid,
        /// Request body.
        payload: serde_json::Value,
    },
}

/// Frames received from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    /// Login acknowledged.
    LoginAck,
    /// API session acknowledged.
    ApiReady,
    /// Subsystem started synchronizing.
    SubsystemPending {
        /// Subsystem name.
        name: String,
    },
    /// Subsystem finished synchronizing.
    SubsystemReady {
        /// Subsystem name.
        name: String,
    },
    /// Upstream link lost.
    LinkDown,
    /// Upstream link restored.
    LinkRestored,
    /// Response to a request.
    Response {
        /// Correlation id.
        request_id: Uuid,
        /// Response body.
        payload: serde_json::Value,
    },
    /// Error, tied to a request when `request_id` is set.
    Error {
        /// Correlation id of the failed request, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        /// Gateway error code.
        code: i32,
        /// Gateway error message.
        message: String,
    },
}

impl GatewayFrame {
    /// Convert a non-response frame into the signal it represents.
    #[must_use]
    pub fn into_signal(self) -> Option<TransportSignal> {
        Some(match self {
            Self::LoginAck => TransportSignal::LoginAck,
            Self::ApiReady => TransportSignal::ApiReady,
            Self::SubsystemPending { name } => TransportSignal::SubsystemPending { name },
            Self::SubsystemReady { name } => TransportSignal::SubsystemReady { name },
            Self::LinkDown => TransportSignal::LinkDown,
            Self::LinkRestored => TransportSignal::LinkRestored,
            Self::Error { code, message, .. } => {
                TransportSignal::Error(GatewayError::new(code, message))
            }
            Self::Response { .. } => return None,
        })
    }
}

/// Encode a frame as one line, newline included.
///
/// # Errors
///
/// Returns `FrameError` if the payload cannot be serialized.
pub fn encode(frame: &ClientFrame) -> Result<Vec<u8>, FrameError> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one line.
///
/// # Errors
///
/// Returns `FrameError` if the line is not a known gateway frame.
pub fn decode(line: &str) -> Result<GatewayFrame, FrameError> {
    Ok(serde_json::from_str(line.trim())?)
}
