//! Scoped connection lease and paced dispatch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::worker::Command;
use super::{ConnectionEntry, ConnectionId, EvictionReason, PoolInner};
use crate::application::ports::{GatewayRequest, GatewayResponse, SendError};
use crate::application::services::backoff::Backoff;
use crate::application::services::pacing::{Outcome, PaceManager, Permit, WaitHint, WaitReason};
use crate::domain::connection::{ConnectionState, ConnectionStatus};
use crate::domain::pacing::{ErrorClass, RequestCategory};
use crate::domain::session::{Purpose, SessionId};
use crate::infrastructure::metrics;

/// Dispatch failures a caller can branch on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// Category is cooling down after a pacing violation.
    #[error("pacing violation for {category}, retry after {retry_after:?}")]
    PacingViolation {
        /// Category.
        category: RequestCategory,
        /// Remaining cooldown.
        retry_after: Duration,
    },

    /// Budget stayed exhausted for the whole admission wait.
    #[error("pace budget for {category} exhausted, retry after {retry_after:?}")]
    BudgetExhausted {
        /// Category.
        category: RequestCategory,
        /// Time until a slot frees up.
        retry_after: Duration,
    },

    /// Transient failures persisted through every retry.
    #[error("transient failure after {attempts} attempt(s): {message}")]
    TransientTransport {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        message: String,
    },

    /// Gateway reported a permanent error; the connection was torn down.
    #[error("fatal gateway error {code}: {message}")]
    FatalProtocol {
        /// Gateway error code.
        code: i32,
        /// Gateway error message.
        message: String,
    },

    /// No response within the dispatch timeout; the connection was evicted.
    #[error("no response after {after:?}")]
    Timeout {
        /// Dispatch timeout.
        after: Duration,
    },

    /// Connection went away while leased.
    #[error("connection lost")]
    ConnectionLost,

    /// Connection is not `Ready` or its upstream link is down.
    #[error("connection not ready ({state})")]
    NotReady {
        /// Current state.
        state: ConnectionState,
    },
}

/// Exclusive loan of one `Ready` connection.
///
/// Dropping the lease hands the connection back to the pool on every exit
/// path. Requests are paced and retried per the `PaceManager` policy.
pub struct Lease {
    inner: Arc<PoolInner>,
    connection_id: ConnectionId,
    session_id: SessionId,
    purpose: Purpose,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("connection_id", &self.connection_id)
            .field("session_id", &self.session_id)
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl Lease {
    pub(super) fn new(
        inner: Arc<PoolInner>,
        connection_id: ConnectionId,
        entry: &ConnectionEntry,
    ) -> Self {
        Self {
            inner,
            connection_id,
            session_id: entry.session_id,
            purpose: entry.purpose,
            commands: entry.commands.clone(),
            status: entry.status.clone(),
        }
    }

    /// Leased connection.
    #[must_use]
    pub const fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Session id the connection presented to the gateway.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Purpose the connection serves.
    #[must_use]
    pub const fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Send a payload and return the response payload.
    ///
    /// # Errors
    ///
    /// See [`Lease::send_request`].
    pub async fn send(
        &self,
        category: RequestCategory,
        payload: Value,
    ) -> Result<Value, DispatchError> {
        self.send_request(category, GatewayRequest::new(payload))
            .await
            .map(|response| response.payload)
    }

    /// Send a request under the category's pace budget.
    ///
    /// Transient failures and pacing violations are retried on the pace
    /// manager's backoff schedule; fatal errors evict the connection.
    ///
    /// # Errors
    ///
    /// Returns a `DispatchError` describing the final failure.
    pub async fn send_request(
        &self,
        category: RequestCategory,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, DispatchError> {
        let pace = &self.inner.pace;
        let mut backoff = Backoff::new(pace.retry_policy());
        let mut attempts = 0;

        loop {
            attempts += 1;
            let status = self.status();
            if !status.is_healthy() {
                return Err(DispatchError::NotReady {
                    state: status.state,
                });
            }

            let admit_deadline = Instant::now() + self.inner.config.admit_wait;
            let permit = pace
                .admit_wait(category, admit_deadline)
                .await
                .map_err(|hint| wait_error(category, hint))?;
            let mut outcome = OutcomeGuard::new(pace, permit.for_request(request.request_id));

            let class = match self.dispatch(request.clone(), &mut outcome).await? {
                Ok(response) => return Ok(response),
                Err(class) => class,
            };

            let Some(delay) = backoff.next_delay() else {
                return Err(match class {
                    Failure::Pacing => DispatchError::PacingViolation {
                        category,
                        retry_after: pace.cooldown_remaining(category).unwrap_or_default(),
                    },
                    Failure::Transient(message) => {
                        DispatchError::TransientTransport { attempts, message }
                    }
                });
            };

            let class_label = match class {
                Failure::Pacing => ErrorClass::PacingViolation,
                Failure::Transient(_) => ErrorClass::Transient,
            };
            metrics::record_dispatch_retry(category, class_label);
            tracing::debug!(
                connection_id = %self.connection_id,
                category = %category,
                class = class_label.as_str(),
                attempt = attempts,
                delay_ms = delay.as_millis(),
                "Retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// One attempt. `Ok(Err(_))` is a retryable failure.
    async fn dispatch(
        &self,
        request: GatewayRequest,
        outcome: &mut OutcomeGuard<'_>,
    ) -> Result<Result<GatewayResponse, Failure>, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Send {
            request,
            reply: reply_tx,
        };
        if self.commands.send(command).await.is_err() {
            outcome.finish(&Outcome::NotSent);
            return Err(DispatchError::ConnectionLost);
        }

        let after = self.inner.config.dispatch_timeout;
        let reply = match tokio::time::timeout(after, reply_rx).await {
            Err(_) => {
                outcome.finish(&Outcome::TransportFailure("response timed out".to_string()));
                self.inner
                    .evict(self.connection_id, EvictionReason::Unresponsive);
                return Err(DispatchError::Timeout { after });
            }
            Ok(Err(_)) => {
                outcome.finish(&Outcome::TransportFailure("worker exited".to_string()));
                return Err(DispatchError::ConnectionLost);
            }
            Ok(Ok(reply)) => reply,
        };

        match reply {
            Ok(response) => {
                outcome.finish(&Outcome::Success);
                Ok(Ok(response))
            }
            Err(SendError::Closed) => {
                outcome.finish(&Outcome::TransportFailure("session closed".to_string()));
                Err(DispatchError::ConnectionLost)
            }
            Err(SendError::Transport(reason)) => {
                outcome.finish(&Outcome::TransportFailure(reason.clone()));
                Ok(Err(Failure::Transient(reason)))
            }
            Err(SendError::Gateway(error)) => {
                match outcome.finish(&Outcome::Failure(error.clone())) {
                    Some(ErrorClass::Fatal) => {
                        self.inner.evict(self.connection_id, EvictionReason::Fatal);
                        Err(DispatchError::FatalProtocol {
                            code: error.code,
                            message: error.message,
                        })
                    }
                    Some(ErrorClass::PacingViolation) => Ok(Err(Failure::Pacing)),
                    _ => Ok(Err(Failure::Transient(error.to_string()))),
                }
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.release_lease(self.connection_id);
    }
}

#[derive(Debug)]
enum Failure {
    Pacing,
    Transient(String),
}

fn wait_error(category: RequestCategory, hint: WaitHint) -> DispatchError {
    match hint.reason {
        WaitReason::Cooldown => DispatchError::PacingViolation {
            category,
            retry_after: hint.retry_after,
        },
        WaitReason::Budget => DispatchError::BudgetExhausted {
            category,
            retry_after: hint.retry_after,
        },
    }
}

/// Records `Cancelled` for a permit whose attempt was dropped mid-flight.
struct OutcomeGuard<'a> {
    pace: &'a PaceManager,
    permit: Option<Permit>,
}

impl<'a> OutcomeGuard<'a> {
    const fn new(pace: &'a PaceManager, permit: Permit) -> Self {
        Self {
            pace,
            permit: Some(permit),
        }
    }

    fn finish(&mut self, outcome: &Outcome) -> Option<ErrorClass> {
        self.permit
            .take()
            .and_then(|permit| self.pace.record_outcome(permit, outcome))
    }
}

impl Drop for OutcomeGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.pace.record_outcome(permit, &Outcome::Cancelled);
        }
    }
}
