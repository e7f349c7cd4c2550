//! Connection worker.
//!
//! One task per connection. It owns the socket for the connection's whole
//! life: handshake, request dispatch, signal handling and teardown. The pool
//! talks to it only through the command channel, the status watch and the
//! cancellation token.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ConnectionEntry, ConnectionId, CreationIds, EvictionReason, PoolInner};
use crate::application::ports::{GatewayRequest, GatewayResponse, SendError, TransportSession};
use crate::application::services::handshake::EstablishError;
use crate::domain::connection::{ConnectionState, ConnectionStatus, TransportSignal};
use crate::domain::pacing::ErrorClass;
use crate::domain::session::{Purpose, SessionId};
use crate::infrastructure::metrics;

/// Commands buffered per connection. Leases are exclusive, so this only
/// needs room for one in-flight request.
const COMMAND_BUFFER: usize = 4;

/// Requests from a lease to the worker.
#[derive(Debug)]
pub(super) enum Command {
    /// Dispatch one request and report the result.
    Send {
        request: GatewayRequest,
        reply: oneshot::Sender<Result<GatewayResponse, SendError>>,
    },
}

/// Why the serve loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Token cancelled by eviction or shutdown.
    Cancelled,
    /// Gateway closed the socket.
    Closed,
    /// Gateway reported a fatal error.
    Fatal,
}

/// Cancellation for one connection.
pub(super) struct Tokens {
    /// Ends the connection: eviction or shutdown.
    pub(super) cancel: CancellationToken,
    /// Child of `cancel` that only aborts the handshake.
    pub(super) handshake: CancellationToken,
}

pub(super) async fn run(
    inner: Arc<PoolInner>,
    connection_id: ConnectionId,
    purpose: Purpose,
    status: watch::Sender<ConnectionStatus>,
    tokens: Tokens,
    ready: oneshot::Sender<Result<(), EstablishError>>,
) {
    let Tokens { cancel, handshake } = tokens;
    let ids = CreationIds {
        inner: &inner,
        connection_id,
    };
    let established = inner
        .coordinator
        .establish(&ids, purpose, &status, &handshake)
        .await;

    let established = match established {
        Ok(established) => established,
        Err(err) => {
            inner.state.lock().creating.remove(&connection_id);
            inner.notify();
            let _ = ready.send(Err(err));
            return;
        }
    };

    let session_id = established.session_id;
    let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
    {
        let mut state = inner.state.lock();
        state.creating.remove(&connection_id);
        state.connections.insert(
            connection_id,
            ConnectionEntry {
                session_id,
                purpose,
                commands: commands_tx,
                status: status.subscribe(),
                cancel: cancel.clone(),
                leased: true,
                evicting: None,
                created_at: Utc::now(),
                last_activity: Instant::now(),
                consecutive_failures: 0,
            },
        );
        inner.publish_connections(&state, purpose);
    }

    if ready.send(Ok(())).is_err() {
        // Acquirer gave up between Ready and hand-over; keep the connection
        // for the next caller.
        inner.release_lease(connection_id);
    }

    tracing::debug!(
        connection_id = %connection_id,
        session_id = %session_id,
        purpose = %purpose,
        "Connection worker serving"
    );

    let mut session = established.session;
    let exit = serve(&inner, connection_id, &mut session, &status, commands_rx, &cancel).await;
    session.handle.disconnect().await;
    status.send_modify(|s| s.state = ConnectionState::Failed);

    teardown(&inner, connection_id, session_id, purpose, exit);
}

async fn serve(
    inner: &PoolInner,
    connection_id: ConnectionId,
    session: &mut TransportSession,
    status: &watch::Sender<ConnectionStatus>,
    mut commands: mpsc::Receiver<Command>,
    cancel: &CancellationToken,
) -> Exit {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => return Exit::Cancelled,

            signal = session.signals.recv() => {
                match signal.unwrap_or(TransportSignal::Closed) {
                    TransportSignal::Closed => {
                        tracing::warn!(connection_id = %connection_id, "Gateway closed session");
                        return Exit::Closed;
                    }
                    TransportSignal::LinkDown => {
                        tracing::warn!(connection_id = %connection_id, "Gateway upstream link down");
                        status.send_modify(|s| s.link_up = false);
                    }
                    TransportSignal::LinkRestored => {
                        tracing::info!(connection_id = %connection_id, "Gateway upstream link restored");
                        status.send_modify(|s| s.link_up = true);
                    }
                    TransportSignal::Error(error) => {
                        if inner.pace.classifier().classify(&error) == ErrorClass::Fatal {
                            tracing::error!(
                                connection_id = %connection_id,
                                code = error.code,
                                msg = %error.message,
                                "Fatal gateway error on idle session"
                            );
                            return Exit::Fatal;
                        }
                        tracing::debug!(
                            connection_id = %connection_id,
                            code = error.code,
                            msg = %error.message,
                            "Gateway notice"
                        );
                    }
                    other => {
                        tracing::trace!(connection_id = %connection_id, signal = ?other, "Ignoring late handshake signal");
                    }
                }
            }

            command = commands.recv() => {
                let Some(Command::Send { request, reply }) = command else {
                    return Exit::Cancelled;
                };
                inner.touch(connection_id);
                let result = tokio::select! {
                    () = cancel.cancelled() => Err(SendError::Closed),
                    result = session.handle.send(request) => result,
                };
                inner.touch(connection_id);
                let _ = reply.send(result);
            }
        }
    }
}

fn teardown(
    inner: &PoolInner,
    connection_id: ConnectionId,
    session_id: SessionId,
    purpose: Purpose,
    exit: Exit,
) {
    let mut state = inner.state.lock();
    let evicted = state
        .connections
        .remove(&connection_id)
        .and_then(|entry| entry.evicting);

    let detected = match exit {
        Exit::Closed => Some(EvictionReason::Closed),
        Exit::Fatal => Some(EvictionReason::Fatal),
        Exit::Cancelled => None,
    };
    if let (None, Some(reason)) = (evicted, detected) {
        inner.push_eviction(&mut state, connection_id, session_id, purpose, reason);
        metrics::record_eviction(reason.as_str());
    }

    state.returning.insert(session_id, purpose);
    inner.publish_connections(&state, purpose);
    drop(state);

    // Ids of evicted or dropped sessions go into quarantine.
    let result = if evicted.is_some() || detected.is_some() {
        inner.registry.retire(session_id)
    } else {
        inner.registry.release(session_id)
    };
    if let Err(e) = result {
        tracing::error!(session_id = %session_id, error = %e, "Failed to return session id");
    }
    inner.state.lock().returning.remove(&session_id);
    inner.notify();

    tracing::info!(
        connection_id = %connection_id,
        session_id = %session_id,
        purpose = %purpose,
        reason = evicted.or(detected).map_or("shutdown", |r| r.as_str()),
        "Connection closed"
    );
}
