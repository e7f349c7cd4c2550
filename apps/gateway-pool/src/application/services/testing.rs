//! Scripted in-process transport for service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::application::ports::{
    GatewayEndpoint, GatewayRequest, GatewayResponse, SendError, SessionHandle, Transport,
    TransportError, TransportSession,
};
use crate::domain::connection::TransportSignal;
use crate::domain::pacing::GatewayError;
use crate::domain::session::SessionId;

/// How the fake gateway behaves for one connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    /// Full handshake, one subsystem ready.
    Ready,
    /// Handshake stalls in `Synchronizing` with a subsystem pending.
    NeverSynced,
    /// Gateway reports an error code right after connect.
    Reject(i32),
    /// Socket connect fails.
    RefuseConnect,
}

type Reply = Result<serde_json::Value, SendError>;

#[derive(Debug, Default)]
struct Shared {
    replies: Mutex<VecDeque<Reply>>,
    sent: AtomicUsize,
    disconnects: AtomicUsize,
}

/// Transport whose sessions follow [`Script`]s.
#[derive(Debug)]
pub(crate) struct FakeTransport {
    default: Script,
    queued: Mutex<VecDeque<Script>>,
    connected: Mutex<Vec<SessionId>>,
    signals: Mutex<HashMap<SessionId, mpsc::Sender<TransportSignal>>>,
    shared: Arc<Shared>,
}

impl FakeTransport {
    pub(crate) fn new(default: Script) -> Self {
        Self {
            default,
            queued: Mutex::new(VecDeque::new()),
            connected: Mutex::new(Vec::new()),
            signals: Mutex::new(HashMap::new()),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Use `script` for the next connect instead of the default.
    pub(crate) fn push_script(&self, script: Script) {
        self.queued.lock().push_back(script);
    }

    /// Queue the reply for the next request on any session.
    pub(crate) fn push_reply(&self, reply: Reply) {
        self.shared.replies.lock().push_back(reply);
    }

    /// Deliver a signal to an open session.
    pub(crate) async fn signal(&self, session_id: SessionId, signal: TransportSignal) {
        let sender = self.signals.lock().get(&session_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(signal).await;
        }
    }

    pub(crate) fn connected_ids(&self) -> Vec<SessionId> {
        self.connected.lock().clone()
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> usize {
        self.shared.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        endpoint: &GatewayEndpoint,
        session_id: SessionId,
    ) -> Result<TransportSession, TransportError> {
        self.connected.lock().push(session_id);
        let script = self.queued.lock().pop_front().unwrap_or(self.default);

        if script == Script::RefuseConnect {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(32);
        let mut startup = vec![TransportSignal::Connected];
        match script {
            Script::Ready => startup.extend([
                TransportSignal::LoginAck,
                TransportSignal::ApiReady,
                TransportSignal::SubsystemReady {
                    name: "hmds".to_string(),
                },
            ]),
            Script::NeverSynced => startup.extend([
                TransportSignal::LoginAck,
                TransportSignal::ApiReady,
                TransportSignal::SubsystemPending {
                    name: "hmds".to_string(),
                },
            ]),
            Script::Reject(code) => {
                startup.push(TransportSignal::Error(GatewayError::new(code, "rejected")));
            }
            Script::RefuseConnect => {}
        }
        for signal in startup {
            let _ = tx.try_send(signal);
        }
        self.signals.lock().insert(session_id, tx.clone());

        Ok(TransportSession {
            handle: Box::new(FakeHandle {
                shared: self.shared.clone(),
                closed: false,
                _signals: tx,
            }),
            signals: rx,
        })
    }
}

struct FakeHandle {
    shared: Arc<Shared>,
    closed: bool,
    _signals: mpsc::Sender<TransportSignal>,
}

#[async_trait]
impl SessionHandle for FakeHandle {
    async fn send(&mut self, request: GatewayRequest) -> Result<GatewayResponse, SendError> {
        if self.closed {
            return Err(SendError::Closed);
        }
        self.shared.sent.fetch_add(1, Ordering::SeqCst);
        let reply = self.shared.replies.lock().pop_front();
        match reply {
            Some(Ok(payload)) => Ok(GatewayResponse {
                request_id: request.request_id,
                payload,
            }),
            Some(Err(e)) => Err(e),
            None => Ok(GatewayResponse {
                request_id: request.request_id,
                payload: request.payload,
            }),
        }
    }

    async fn disconnect(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}
