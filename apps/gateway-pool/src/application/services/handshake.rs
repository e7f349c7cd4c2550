//! Handshake Coordinator
//!
//! Opens a session socket and drives it through the gateway's startup
//! sequence with a [`HandshakeMachine`]. A session is only handed back once
//! the machine reports `Ready`; any failure tears the socket down before the
//! error is returned.
//!
//! `establish` wraps single attempts in the retry policy: every attempt
//! allocates a fresh session id, a failed attempt retires its id, and the
//! next attempt waits out a backoff delay first.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::{Backoff, BackoffConfig};
use super::registry::{RegistryError, SessionIdRegistry};
use crate::application::ports::{GatewayEndpoint, Transport, TransportSession};
use crate::domain::connection::{
    ConnectionState, ConnectionStatus, HandshakeError, HandshakeMachine, HandshakeTimings,
    TransportSignal,
};
use crate::domain::pacing::{ClassificationTable, ErrorClass};
use crate::domain::session::{Purpose, SessionId};
use crate::infrastructure::metrics;

/// Handshake timing and retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandshakeConfig {
    /// Stage, synchronizing and settle timings.
    pub timings: HandshakeTimings,
    /// Delay schedule between attempts; `max_attempts` is the retry ceiling.
    pub retry: BackoffConfig,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timings: HandshakeTimings::default(),
            retry: BackoffConfig {
                max_attempts: 2,
                ..BackoffConfig::default()
            },
        }
    }
}

/// Why `establish` gave up.
#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    /// No session id could be allocated.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Every attempt failed, or the gateway rejected the session.
    #[error("handshake failed after {attempts} attempt(s): {source}")]
    Handshake {
        /// Attempts made.
        attempts: u32,
        /// Failure of the last attempt.
        source: HandshakeError,
    },

    /// Caller cancelled.
    #[error("handshake cancelled")]
    Cancelled,
}

/// Where `establish` gets session ids from and returns failed ones to.
pub trait SessionIdSource: Send + Sync {
    /// Allocate a fresh id for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if no id can be allocated.
    fn allocate(&self, purpose: Purpose) -> Result<SessionId, RegistryError>;

    /// Give back the id of a failed attempt; it must not be reused at once.
    fn retire(&self, id: SessionId);
}

impl SessionIdSource for SessionIdRegistry {
    fn allocate(&self, purpose: Purpose) -> Result<SessionId, RegistryError> {
        Self::allocate(self, purpose)
    }

    fn retire(&self, id: SessionId) {
        if let Err(e) = Self::retire(self, id) {
            tracing::error!(session_id = %id, error = %e, "Failed to retire session id");
        }
    }
}

/// A session that reached `Ready`.
#[derive(Debug)]
pub struct Established {
    /// Id the session presented.
    pub session_id: SessionId,
    /// Open socket and its signal stream.
    pub session: TransportSession,
}

/// Drives new sockets through the handshake.
pub struct HandshakeCoordinator {
    transport: Arc<dyn Transport>,
    endpoint: GatewayEndpoint,
    config: HandshakeConfig,
    classifier: Arc<ClassificationTable>,
}

impl std::fmt::Debug for HandshakeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeCoordinator")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HandshakeCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: GatewayEndpoint,
        config: HandshakeConfig,
        classifier: Arc<ClassificationTable>,
    ) -> Self {
        Self {
            transport,
            endpoint,
            config,
            classifier,
        }
    }

    /// Allocate an id and handshake, retrying with fresh ids on failure.
    ///
    /// # Errors
    ///
    /// Returns `EstablishError::Registry` if no id is free,
    /// `EstablishError::Handshake` once retries are exhausted or the gateway
    /// rejects the session, and `EstablishError::Cancelled` if `cancel` fires.
    pub async fn establish(
        &self,
        ids: &dyn SessionIdSource,
        purpose: Purpose,
        status: &watch::Sender<ConnectionStatus>,
        cancel: &CancellationToken,
    ) -> Result<Established, EstablishError> {
        let mut backoff = Backoff::new(self.config.retry);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let session_id = ids.allocate(purpose)?;
            status.send_replace(ConnectionStatus::default());

            match self.handshake(session_id, status, cancel).await {
                Ok(session) => {
                    metrics::record_handshake("ready");
                    tracing::info!(
                        session_id = %session_id,
                        purpose = %purpose,
                        attempts,
                        "Gateway session ready"
                    );
                    return Ok(Established {
                        session_id,
                        session,
                    });
                }
                Err(err) => {
                    ids.retire(session_id);
                    if err == HandshakeError::Cancelled {
                        metrics::record_handshake("cancelled");
                        return Err(EstablishError::Cancelled);
                    }
                    metrics::record_handshake(outcome_label(&err));
                    tracing::warn!(
                        session_id = %session_id,
                        purpose = %purpose,
                        attempt = attempts,
                        error = %err,
                        "Handshake failed"
                    );

                    if !err.is_retryable() {
                        return Err(EstablishError::Handshake {
                            attempts,
                            source: err,
                        });
                    }
                    let Some(delay) = backoff.next_delay() else {
                        return Err(EstablishError::Handshake {
                            attempts,
                            source: err,
                        });
                    };

                    tracing::info!(
                        purpose = %purpose,
                        delay_ms = delay.as_millis(),
                        "Retrying handshake with a fresh session id"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(EstablishError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Run one handshake attempt with the given id.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError` describing why the session never reached
    /// `Ready`. The socket is closed before returning.
    pub async fn handshake(
        &self,
        session_id: SessionId,
        status: &watch::Sender<ConnectionStatus>,
        cancel: &CancellationToken,
    ) -> Result<TransportSession, HandshakeError> {
        let timings = self.config.timings;
        let mut machine = HandshakeMachine::new(timings, Instant::now().into_std());
        publish(status, ConnectionState::Dialing);

        tracing::debug!(session_id = %session_id, endpoint = %self.endpoint, "Dialing gateway");
        let mut session = tokio::select! {
            () = cancel.cancelled() => return Err(HandshakeError::Cancelled),
            result = tokio::time::timeout(
                timings.stage_timeout,
                self.transport.connect(&self.endpoint, session_id),
            ) => match result {
                Err(_) => {
                    publish(status, ConnectionState::Failed);
                    return Err(HandshakeError::Timeout {
                        state: ConnectionState::Dialing,
                        after: timings.stage_timeout,
                    });
                }
                Ok(Err(e)) => {
                    publish(status, ConnectionState::Failed);
                    return Err(HandshakeError::Connect(e.to_string()));
                }
                Ok(Ok(session)) => session,
            },
        };

        match self.drive(&mut machine, &mut session, status, cancel).await {
            Ok(()) => Ok(session),
            Err(err) => {
                machine.fail(Instant::now().into_std());
                publish(status, ConnectionState::Failed);
                session.handle.disconnect().await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        machine: &mut HandshakeMachine,
        session: &mut TransportSession,
        status: &watch::Sender<ConnectionStatus>,
        cancel: &CancellationToken,
    ) -> Result<(), HandshakeError> {
        loop {
            let deadline = machine
                .next_deadline()
                .map_or_else(Instant::now, Instant::from_std);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(HandshakeError::Cancelled),
                signal = session.signals.recv() => {
                    let signal = signal.unwrap_or(TransportSignal::Closed);
                    self.apply_signal(machine, &signal, status)?;
                }
                () = tokio::time::sleep_until(deadline) => {}
            }

            let state = machine.poll(Instant::now().into_std())?;
            publish(status, state);
            if state.is_ready() {
                return Ok(());
            }
        }
    }

    fn apply_signal(
        &self,
        machine: &mut HandshakeMachine,
        signal: &TransportSignal,
        status: &watch::Sender<ConnectionStatus>,
    ) -> Result<(), HandshakeError> {
        match signal {
            TransportSignal::Error(error) => {
                if self.classifier.classify(error) == ErrorClass::Fatal {
                    return Err(HandshakeError::Rejected {
                        code: error.code,
                        message: error.message.clone(),
                    });
                }
                tracing::debug!(code = error.code, msg = %error.message, "Gateway notice during handshake");
            }
            TransportSignal::LinkDown => status.send_modify(|s| s.link_up = false),
            TransportSignal::LinkRestored => status.send_modify(|s| s.link_up = true),
            _ => {}
        }

        let state = machine.on_signal(signal, Instant::now().into_std())?;
        publish(status, state);
        Ok(())
    }
}

fn publish(status: &watch::Sender<ConnectionStatus>, state: ConnectionState) {
    status.send_if_modified(|current| {
        if current.state == state {
            false
        } else {
            current.state = state;
            true
        }
    });
}

const fn outcome_label(err: &HandshakeError) -> &'static str {
    match err {
        HandshakeError::Timeout { .. } => "timeout",
        HandshakeError::Rejected { .. } => "rejected",
        HandshakeError::UnexpectedSignal { .. } => "protocol_error",
        HandshakeError::Closed { .. } => "closed",
        HandshakeError::Connect(_) => "connect_failed",
        HandshakeError::Cancelled => "cancelled",
    }
}
