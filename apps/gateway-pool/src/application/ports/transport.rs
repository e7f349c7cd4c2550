//! Transport Port (Driven Port)
//!
//! The lower protocol binding. The pool treats "connect" and "send a request,
//! get a response or an error" as opaque primitives; everything else the
//! gateway reports arrives as a [`TransportSignal`] on the session's signal
//! channel.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::connection::TransportSignal;
use crate::domain::pacing::GatewayError;
use crate::domain::session::SessionId;

/// Where the gateway listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEndpoint {
    /// Gateway host.
    pub host: String,
    /// Gateway port.
    pub port: u16,
    /// Socket connect timeout.
    pub connect_timeout: Duration,
}

impl GatewayEndpoint {
    /// Create an endpoint with the default connect timeout.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Display for GatewayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opaque application request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Correlates the response and any error with this request.
    pub request_id: Uuid,
    /// Protocol-specific body.
    pub payload: serde_json::Value,
}

impl GatewayRequest {
    /// Create a request with a fresh id.
    #[must_use]
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            payload,
        }
    }
}

/// Opaque gateway response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Request this answers.
    pub request_id: Uuid,
    /// Protocol-specific body.
    pub payload: serde_json::Value,
}

/// Failure opening a session socket.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connect attempt failed.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect {
        /// Target endpoint.
        endpoint: String,
        /// Failure reason.
        reason: String,
    },

    /// Connect attempt did not finish in time.
    #[error("connect to {endpoint} timed out after {after:?}")]
    Timeout {
        /// Target endpoint.
        endpoint: String,
        /// Configured connect timeout.
        after: Duration,
    },

    /// Socket I/O failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure sending one request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Gateway answered with an error.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// Socket failure while the request was outstanding.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Session is closed.
    #[error("session closed")]
    Closed,
}

/// An open session socket.
#[async_trait]
pub trait SessionHandle: Send {
    /// Send one request and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns `SendError` if the gateway reports an error or the socket fails.
    async fn send(&mut self, request: GatewayRequest) -> Result<GatewayResponse, SendError>;

    /// Close the socket. Idempotent.
    async fn disconnect(&mut self);
}

/// Session socket plus its signal stream.
pub struct TransportSession {
    /// Request channel.
    pub handle: Box<dyn SessionHandle>,
    /// Handshake, link and unsolicited error signals, in arrival order.
    pub signals: mpsc::Receiver<TransportSignal>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession").finish_non_exhaustive()
    }
}

/// Opens session sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket presenting `session_id`.
    ///
    /// On success the first signal delivered is `Connected`.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the socket cannot be opened.
    async fn connect(
        &self,
        endpoint: &GatewayEndpoint,
        session_id: SessionId,
    ) -> Result<TransportSession, TransportError>;
}
