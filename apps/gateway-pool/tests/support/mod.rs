//! In-process fake gateway speaking the JSON-lines protocol over TCP.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gateway_pool::{
    AllocationStore, BackoffConfig, ClassificationTable, ConnectionPool, GatewayEndpoint,
    HandshakeConfig, HandshakeCoordinator, HandshakeTimings, JsonLinesTransport, PaceManager,
    PacingConfig, PoolConfig, Purpose, RegistryConfig, SessionId, SessionIdRegistry,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How the gateway answers a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Log on, report one subsystem ready.
    Ready,
    /// Log on, leave one subsystem pending forever.
    NeverSynced,
    /// Reply to the hello with an error code.
    Reject(i32),
}

#[derive(Debug)]
struct SessionControl {
    hang_up: CancellationToken,
    push: mpsc::UnboundedSender<Value>,
}

#[derive(Debug)]
struct GatewayState {
    behavior: Mutex<Behavior>,
    hellos: Mutex<Vec<SessionId>>,
    sessions: Mutex<HashMap<SessionId, SessionControl>>,
    requests: AtomicUsize,
}

/// A gateway listening on an ephemeral localhost port.
pub struct FakeGateway {
    endpoint: GatewayEndpoint,
    state: Arc<GatewayState>,
    accept: JoinHandle<()>,
}

impl FakeGateway {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(GatewayState {
            behavior: Mutex::new(behavior),
            hellos: Mutex::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            requests: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, accept_state.clone()));
            }
        });

        Self {
            endpoint: GatewayEndpoint::new("127.0.0.1", port),
            state,
            accept,
        }
    }

    pub fn endpoint(&self) -> GatewayEndpoint {
        self.endpoint.clone()
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock() = behavior;
    }

    /// Session ids presented so far, in connect order.
    pub fn hellos(&self) -> Vec<SessionId> {
        self.state.hellos.lock().clone()
    }

    /// Application requests received across all sessions.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Close the socket of one session.
    pub fn hang_up(&self, session_id: SessionId) {
        if let Some(control) = self.state.sessions.lock().remove(&session_id) {
            control.hang_up.cancel();
        }
    }

    /// Send an unsolicited frame on one session.
    pub fn push(&self, session_id: SessionId, frame: Value) {
        if let Some(control) = self.state.sessions.lock().get(&session_id) {
            let _ = control.push.send(frame);
        }
    }
}

impl Drop for FakeGateway {
    fn drop(&mut self) {
        self.accept.abort();
        for control in self.state.sessions.lock().values() {
            control.hang_up.cancel();
        }
    }
}

async fn serve(socket: TcpStream, state: Arc<GatewayState>) {
    let (read, mut write) = socket.into_split();
    let mut lines = BufReader::new(read).lines();

    let Ok(Some(hello)) = lines.next_line().await else {
        return;
    };
    let hello: Value = serde_json::from_str(&hello).unwrap();
    assert_eq!(hello["type"], "hello");
    let session_id = SessionId::new(u32::try_from(hello["session_id"].as_u64().unwrap()).unwrap());

    let hang_up = CancellationToken::new();
    let (push, mut pushed) = mpsc::unbounded_channel();
    state.hellos.lock().push(session_id);
    state.sessions.lock().insert(
        session_id,
        SessionControl {
            hang_up: hang_up.clone(),
            push,
        },
    );

    let behavior = *state.behavior.lock();
    let startup = match behavior {
        Behavior::Ready => vec![
            json!({"type": "login_ack"}),
            json!({"type": "api_ready"}),
            json!({"type": "subsystem_ready", "name": "hmds"}),
        ],
        Behavior::NeverSynced => vec![
            json!({"type": "login_ack"}),
            json!({"type": "api_ready"}),
            json!({"type": "subsystem_pending", "name": "hmds"}),
        ],
        Behavior::Reject(code) => vec![json!({
            "type": "error",
            "code": code,
            "message": "login failed"
        })],
    };
    for frame in startup {
        write_frame(&mut write, &frame).await;
    }

    loop {
        let line = tokio::select! {
            () = hang_up.cancelled() => return,
            Some(frame) = pushed.recv() => {
                write_frame(&mut write, &frame).await;
                continue;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => return,
            },
        };
        let request: Value = serde_json::from_str(&line).unwrap();
        state.requests.fetch_add(1, Ordering::SeqCst);

        let request_id = request["request_id"].clone();
        let payload = &request["payload"];
        let reply = match payload["fail_code"].as_i64() {
            Some(code) => json!({
                "type": "error",
                "request_id": request_id,
                "code": code,
                "message": payload["message"].as_str().unwrap_or("request failed"),
            }),
            None => json!({
                "type": "response",
                "request_id": request_id,
                "payload": {"session_id": session_id, "echo": payload},
            }),
        };
        if let Some(delay) = payload["delay_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        write_frame(&mut write, &reply).await;
    }
}

async fn write_frame(write: &mut OwnedWriteHalf, frame: &Value) {
    let mut line = frame.to_string();
    line.push('\n');
    let _ = write.write_all(line.as_bytes()).await;
}

/// Handshake settings short enough for tests.
pub fn fast_handshake() -> HandshakeConfig {
    HandshakeConfig {
        timings: HandshakeTimings {
            stage_timeout: Duration::from_secs(2),
            sync_timeout: Duration::from_secs(2),
            settle_interval: Duration::from_millis(50),
            min_ready_subsystems: 1,
        },
        retry: BackoffConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 1,
        },
    }
}

/// Pool configuration with the same capacity for every purpose.
pub fn pool_config(capacity: usize) -> PoolConfig {
    PoolConfig {
        capacity: Purpose::all().iter().map(|p| (*p, capacity)).collect(),
        acquire_timeout: Duration::from_secs(5),
        dispatch_timeout: Duration::from_secs(2),
        admit_wait: Duration::from_secs(1),
        ..PoolConfig::default()
    }
}

/// Build and start a pool talking to `gateway` through the JSON-lines binding.
pub fn start_pool(
    gateway: &FakeGateway,
    config: PoolConfig,
    pacing: PacingConfig,
    store: Arc<dyn AllocationStore>,
) -> (ConnectionPool, Vec<SessionId>) {
    let registry = Arc::new(SessionIdRegistry::open(RegistryConfig::default(), store).unwrap());
    let classifier = ClassificationTable::default();
    let coordinator = HandshakeCoordinator::new(
        Arc::new(JsonLinesTransport::new()),
        gateway.endpoint(),
        fast_handshake(),
        Arc::new(classifier.clone()),
    );
    let pace = Arc::new(PaceManager::new(pacing, classifier));
    let pool = ConnectionPool::new(config, registry, coordinator, pace);
    let reclaimed = pool.start().unwrap();
    (pool, reclaimed)
}

/// Poll `check` every 10ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
