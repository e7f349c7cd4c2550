//! JSON-lines TCP transport.
//!
//! A reader task owns the socket's read half. It routes `response` and
//! request-bound `error` frames to the waiting request and everything else
//! to the session's signal channel. When the socket closes, every pending
//! request fails and the signal channel reports `Closed`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::frames::{self, ClientFrame, GatewayFrame};
use crate::application::ports::{
    GatewayEndpoint, GatewayRequest, GatewayResponse, SendError, SessionHandle, Transport,
    TransportError, TransportSession,
};
use crate::domain::connection::TransportSignal;
use crate::domain::pacing::GatewayError;
use crate::domain::session::SessionId;

/// Signals buffered per session before the reader applies backpressure.
const SIGNAL_BUFFER: usize = 64;

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Result<Value, SendError>>>>>;

/// [`Transport`] speaking newline-delimited JSON over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesTransport;

impl JsonLinesTransport {
    /// Create the transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for JsonLinesTransport {
    async fn connect(
        &self,
        endpoint: &GatewayEndpoint,
        session_id: SessionId,
    ) -> Result<TransportSession, TransportError> {
        let stream = tokio::time::timeout(
            endpoint.connect_timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            endpoint: endpoint.to_string(),
            after: endpoint.connect_timeout,
        })?
        .map_err(|e| TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
        stream.set_nodelay(true)?;

        let (read, mut write) = stream.into_split();
        let hello = frames::encode(&ClientFrame::Hello { session_id })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write.write_all(&hello).await?;
        write.flush().await?;

        let (signals_tx, signals_rx) = mpsc::channel(SIGNAL_BUFFER);
        // Capacity is fresh, so this cannot fail.
        let _ = signals_tx.try_send(TransportSignal::Connected);

        let pending: Pending = Arc::default();
        let reader = tokio::spawn(read_frames(read, pending.clone(), signals_tx, session_id));

        tracing::debug!(session_id = %session_id, endpoint = %endpoint, "Socket connected");
        Ok(TransportSession {
            handle: Box::new(JsonLinesHandle {
                write,
                pending,
                reader,
                closed: false,
            }),
            signals: signals_rx,
        })
    }
}

struct JsonLinesHandle {
    write: OwnedWriteHalf,
    pending: Pending,
    reader: JoinHandle<()>,
    closed: bool,
}

#[async_trait]
impl SessionHandle for JsonLinesHandle {
    async fn send(&mut self, request: GatewayRequest) -> Result<GatewayResponse, SendError> {
        if self.closed || self.reader.is_finished() {
            return Err(SendError::Closed);
        }
        let request_id = request.request_id;
        let line = frames::encode(&ClientFrame::Request {
            request_id,
            payload: request.payload,
        })
        .map_err(|e| SendError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id, tx);

        let written = async {
            self.write.write_all(&line).await?;
            self.write.flush().await
        }
        .await;
        if let Err(e) = written {
            self.pending.lock().remove(&request_id);
            return Err(SendError::Transport(e.to_string()));
        }

        let result = rx
            .await
            .unwrap_or_else(|_| Err(SendError::Transport("connection closed".to_string())));
        result.map(|payload| GatewayResponse {
            request_id,
            payload,
        })
    }

    async fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.write.shutdown().await;
        self.reader.abort();
        fail_pending(&self.pending, "session closed");
    }
}

impl Drop for JsonLinesHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_frames(
    read: OwnedReadHalf,
    pending: Pending,
    signals: mpsc::Sender<TransportSignal>,
    session_id: SessionId,
) {
    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(session_id = %session_id, "Gateway closed socket");
                break;
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Socket read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match frames::decode(&line) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Skipping malformed frame");
                continue;
            }
        };

        let signal = match frame {
            GatewayFrame::Response {
                request_id,
                payload,
            } => {
                complete(&pending, request_id, Ok(payload), session_id);
                continue;
            }
            GatewayFrame::Error {
                request_id: Some(request_id),
                code,
                message,
            } if pending.lock().contains_key(&request_id) => {
                let error = GatewayError::new(code, message);
                complete(&pending, request_id, Err(SendError::Gateway(error)), session_id);
                continue;
            }
            other => other.into_signal(),
        };
        if let Some(signal) = signal {
            if signals.send(signal).await.is_err() {
                break;
            }
        }
    }

    fail_pending(&pending, "connection closed");
    let _ = signals.send(TransportSignal::Closed).await;
}

fn complete(
    pending: &Pending,
    request_id: Uuid,
    result: Result<Value, SendError>,
    session_id: SessionId,
) {
    let waiter = pending.lock().remove(&request_id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => {
            tracing::debug!(
                session_id = %session_id,
                request_id = %request_id,
                "Dropping reply for unknown request"
            );
        }
    }
}

fn fail_pending(pending: &Pending, reason: &str) {
    let waiters: Vec<_> = pending.lock().drain().map(|(_, tx)| tx).collect();
    for tx in waiters {
        let _ = tx.send(Err(SendError::Transport(reason.to_string())));
    }
}
