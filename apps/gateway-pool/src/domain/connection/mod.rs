//! Connection Lifecycle and Handshake State Machine
//!
//! The gateway must see a strict startup sequence before it is safe to use:
//!
//! ```text
//! Dialing ──Connected──► LinkUp ──LoginAck──► LoggedOn ──ApiReady──► ApiReady
//!                                                                       │
//!                                                                       ▼
//!               Ready ◄──(settle interval, nothing outstanding)── Synchronizing
//!
//! any state ──(timeout / close / unexpected signal)──► Failed
//! ```
//!
//! `Ready` is inferred, never signalled: the gateway has acknowledged the API,
//! at least the configured number of subsystems reported ready, none are
//! still pending, and no readiness signal arrived for a full settle interval.
//! Requests issued before that point corrupt gateway state, so nothing in the
//! crate can dispatch on a connection that has not reached `Ready`.

use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::pacing::GatewayError;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Socket connect in progress.
    Dialing,
    /// Raw socket established.
    LinkUp,
    /// Gateway acknowledged the login.
    LoggedOn,
    /// Gateway acknowledged the API session.
    ApiReady,
    /// Waiting for subsystems to settle.
    Synchronizing,
    /// Safe to send application requests.
    Ready,
    /// Terminal failure; the session is being or has been torn down.
    Failed,
}

impl ConnectionState {
    /// Get all states in lifecycle order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Dialing,
            Self::LinkUp,
            Self::LoggedOn,
            Self::ApiReady,
            Self::Synchronizing,
            Self::Ready,
            Self::Failed,
        ]
    }

    /// Get the state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dialing => "dialing",
            Self::LinkUp => "link_up",
            Self::LoggedOn => "logged_on",
            Self::ApiReady => "api_ready",
            Self::Synchronizing => "synchronizing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    /// Check if requests may be sent.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if the handshake has finished, successfully or not.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cached session status, readable without touching the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Lifecycle state.
    pub state: ConnectionState,
    /// False between `LinkDown` and `LinkRestored`.
    pub link_up: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Dialing,
            link_up: true,
        }
    }
}

impl ConnectionStatus {
    /// Check if the session can serve requests right now.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.state.is_ready() && self.link_up
    }
}

// =============================================================================
// Transport Signals
// =============================================================================

/// Discrete event reported by the transport for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    /// Raw socket connected.
    Connected,
    /// Login acknowledged.
    LoginAck,
    /// API session acknowledged.
    ApiReady,
    /// A gateway subsystem started synchronizing.
    SubsystemPending {
        /// Subsystem name as reported by the gateway.
        name: String,
    },
    /// A gateway subsystem finished synchronizing.
    SubsystemReady {
        /// Subsystem name as reported by the gateway.
        name: String,
    },
    /// Gateway lost its upstream link; the socket is still open.
    LinkDown,
    /// Gateway upstream link restored.
    LinkRestored,
    /// Unsolicited gateway error or notice.
    Error(GatewayError),
    /// Socket closed.
    Closed,
}

impl TransportSignal {
    const fn stage(&self) -> Option<ConnectionState> {
        match self {
            Self::Connected => Some(ConnectionState::LinkUp),
            Self::LoginAck => Some(ConnectionState::LoggedOn),
            Self::ApiReady => Some(ConnectionState::ApiReady),
            _ => None,
        }
    }
}

// =============================================================================
// Handshake Errors
// =============================================================================

/// Reasons a connection never reached `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// A stage did not complete in time.
    #[error("handshake timed out in state {state} after {after:?}")]
    Timeout {
        /// State the connection was stuck in.
        state: ConnectionState,
        /// Time spent in that state.
        after: Duration,
    },

    /// Gateway refused the session (authentication or permanent rejection).
    #[error("gateway rejected session ({code}): {message}")]
    Rejected {
        /// Gateway error code.
        code: i32,
        /// Gateway error message.
        message: String,
    },

    /// Signal arrived out of order.
    #[error("unexpected signal {signal} in state {state}")]
    UnexpectedSignal {
        /// State when the signal arrived.
        state: ConnectionState,
        /// Signal description.
        signal: String,
    },

    /// Socket closed before the handshake finished.
    #[error("connection closed during handshake in state {state}")]
    Closed {
        /// State when the socket closed.
        state: ConnectionState,
    },

    /// Socket could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Caller gave up before the handshake finished.
    #[error("handshake cancelled")]
    Cancelled,
}

impl HandshakeError {
    /// Check if retrying with a fresh session id could succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Rejected { .. } | Self::Cancelled)
    }
}

// =============================================================================
// Handshake Machine
// =============================================================================

/// Timing knobs for the handshake. Tuned against one gateway version; keep
/// them configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimings {
    /// Maximum time in each of `Dialing`, `LinkUp` and `LoggedOn`.
    pub stage_timeout: Duration,
    /// Maximum time in `Synchronizing`.
    pub sync_timeout: Duration,
    /// Quiet period after the last readiness signal before `Ready`.
    pub settle_interval: Duration,
    /// Subsystems that must report ready before `Ready`.
    pub min_ready_subsystems: usize,
}

impl Default for HandshakeTimings {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(30),
            settle_interval: Duration::from_secs(2),
            min_ready_subsystems: 1,
        }
    }
}

/// Pure handshake state machine. Callers feed it signals and clock ticks;
/// it never performs I/O.
#[derive(Debug)]
pub struct HandshakeMachine {
    timings: HandshakeTimings,
    state: ConnectionState,
    entered_at: Instant,
    last_sync_signal: Instant,
    pending: BTreeSet<String>,
    ready: BTreeSet<String>,
}

impl HandshakeMachine {
    /// Start a handshake in `Dialing`.
    #[must_use]
    pub const fn new(timings: HandshakeTimings, now: Instant) -> Self {
        Self {
            timings,
            state: ConnectionState::Dialing,
            entered_at: now,
            last_sync_signal: now,
            pending: BTreeSet::new(),
            ready: BTreeSet::new(),
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Subsystems still synchronizing.
    #[must_use]
    pub fn pending_subsystems(&self) -> Vec<String> {
        self.pending.iter().cloned().collect()
    }

    /// Apply a transport signal.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError` and moves to `Failed` when the socket closes
    /// or a stage signal arrives out of order.
    pub fn on_signal(
        &mut self,
        signal: &TransportSignal,
        now: Instant,
    ) -> Result<ConnectionState, HandshakeError> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }

        match signal {
            TransportSignal::Closed => {
                let state = self.state;
                self.enter(ConnectionState::Failed, now);
                return Err(HandshakeError::Closed { state });
            }
            TransportSignal::SubsystemPending { name } if self.accepts_subsystems() => {
                self.ready.remove(name);
                self.pending.insert(name.clone());
                self.last_sync_signal = now;
            }
            TransportSignal::SubsystemReady { name } if self.accepts_subsystems() => {
                self.pending.remove(name);
                self.ready.insert(name.clone());
                self.last_sync_signal = now;
            }
            TransportSignal::SubsystemPending { .. } | TransportSignal::SubsystemReady { .. } => {
                return self.unexpected(signal, now);
            }
            TransportSignal::LinkDown
            | TransportSignal::LinkRestored
            | TransportSignal::Error(_) => {}
            stage_signal => {
                let Some(target) = stage_signal.stage() else {
                    return Ok(self.state);
                };
                if target <= self.state {
                    // Duplicate of a stage already passed.
                    return Ok(self.state);
                }
                if Some(target) != self.next_stage() {
                    return self.unexpected(signal, now);
                }
                self.enter(target, now);
                if target == ConnectionState::ApiReady {
                    self.last_sync_signal = now;
                }
            }
        }

        Ok(self.state)
    }

    /// Advance on the clock: start synchronizing, declare `Ready`, or time out.
    ///
    /// # Errors
    ///
    /// Returns `HandshakeError::Timeout` and moves to `Failed` when the
    /// current stage overran its budget.
    pub fn poll(&mut self, now: Instant) -> Result<ConnectionState, HandshakeError> {
        match self.state {
            ConnectionState::Ready | ConnectionState::Failed => Ok(self.state),
            ConnectionState::ApiReady => {
                self.enter(ConnectionState::Synchronizing, now);
                Ok(self.state)
            }
            ConnectionState::Synchronizing => {
                if self.is_settled(now) {
                    self.enter(ConnectionState::Ready, now);
                    return Ok(self.state);
                }
                self.check_timeout(self.timings.sync_timeout, now)
            }
            ConnectionState::Dialing | ConnectionState::LinkUp | ConnectionState::LoggedOn => {
                self.check_timeout(self.timings.stage_timeout, now)
            }
        }
    }

    /// Earliest instant at which `poll` could change the state.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Ready | ConnectionState::Failed => None,
            ConnectionState::ApiReady => Some(self.entered_at),
            ConnectionState::Synchronizing => {
                let timeout = self.entered_at + self.timings.sync_timeout;
                if self.can_settle() {
                    Some(timeout.min(self.last_sync_signal + self.timings.settle_interval))
                } else {
                    Some(timeout)
                }
            }
            ConnectionState::Dialing | ConnectionState::LinkUp | ConnectionState::LoggedOn => {
                Some(self.entered_at + self.timings.stage_timeout)
            }
        }
    }

    /// Force the machine into `Failed`.
    pub fn fail(&mut self, now: Instant) {
        self.enter(ConnectionState::Failed, now);
    }

    const fn next_stage(&self) -> Option<ConnectionState> {
        match self.state {
            ConnectionState::Dialing => Some(ConnectionState::LinkUp),
            ConnectionState::LinkUp => Some(ConnectionState::LoggedOn),
            ConnectionState::LoggedOn => Some(ConnectionState::ApiReady),
            _ => None,
        }
    }

    const fn accepts_subsystems(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::LinkUp
                | ConnectionState::LoggedOn
                | ConnectionState::ApiReady
                | ConnectionState::Synchronizing
        )
    }

    fn can_settle(&self) -> bool {
        self.pending.is_empty() && self.ready.len() >= self.timings.min_ready_subsystems
    }

    fn is_settled(&self, now: Instant) -> bool {
        self.can_settle()
            && now.saturating_duration_since(self.last_sync_signal) >= self.timings.settle_interval
    }

    fn check_timeout(
        &mut self,
        limit: Duration,
        now: Instant,
    ) -> Result<ConnectionState, HandshakeError> {
        let after = now.saturating_duration_since(self.entered_at);
        if after < limit {
            return Ok(self.state);
        }
        let state = self.state;
        self.enter(ConnectionState::Failed, now);
        Err(HandshakeError::Timeout { state, after })
    }

    fn unexpected(
        &mut self,
        signal: &TransportSignal,
        now: Instant,
    ) -> Result<ConnectionState, HandshakeError> {
        let state = self.state;
        self.enter(ConnectionState::Failed, now);
        Err(HandshakeError::UnexpectedSignal {
            state,
            signal: format!("{signal:?}"),
        })
    }

    const fn enter(&mut self, state: ConnectionState, now: Instant) {
        self.state = state;
        self.entered_at = now;
    }
}
