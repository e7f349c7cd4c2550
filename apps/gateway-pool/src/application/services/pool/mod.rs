//! Connection Pool
//!
//! Owns every live gateway session and lends them out as scoped [`Lease`]s.
//!
//! # Ownership
//!
//! Each connection runs on its own worker task (see `worker`) that holds the
//! socket. The pool only keeps a command channel and a cached status per
//! connection and never touches a socket directly.
//!
//! # Acquire
//!
//! ```text
//! idle Ready healthy connection? ──yes──► lease it
//!        │ no
//!        ▼
//! below capacity? ──yes──► spawn worker, wait for Ready (bounded, cancellable)
//!        │ no
//!        ▼
//! wait for a release (bounded) and start over
//! ```
//!
//! Capacity per purpose is small and fixed; creation is never eager.
//! Evicted connections are replaced only when a later `acquire` needs one.

mod lease;
mod stats;
mod worker;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

pub use lease::{DispatchError, Lease};
pub use stats::{ConnectionInfo, EvictionRecord, PoolStats, PurposeStats, StatusReport};

use self::worker::Command;
use super::handshake::{EstablishError, HandshakeCoordinator, SessionIdSource};
use super::monitor::HealthMonitor;
use super::pacing::PaceManager;
use super::registry::{RegistryError, SessionIdRegistry};
use crate::domain::connection::{ConnectionState, ConnectionStatus, HandshakeError};
use crate::domain::session::{IdRange, Purpose, SessionId};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum live connections per purpose.
    pub capacity: BTreeMap<Purpose, usize>,
    /// Acquire timeout used by `acquire_default`.
    pub acquire_timeout: Duration,
    /// Maximum wait for one gateway response.
    pub dispatch_timeout: Duration,
    /// Maximum wait for a pace budget slot before dispatch fails.
    pub admit_wait: Duration,
    /// Evictions kept for diagnostics.
    pub eviction_history: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: [
                (Purpose::Interactive, 2),
                (Purpose::Backfill, 2),
                (Purpose::Streaming, 1),
            ]
            .into_iter()
            .collect(),
            acquire_timeout: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(60),
            admit_wait: Duration::from_secs(30),
            eviction_history: 50,
        }
    }
}

impl PoolConfig {
    /// Capacity for a purpose (zero if unconfigured).
    #[must_use]
    pub fn capacity(&self, purpose: Purpose) -> usize {
        self.capacity.get(&purpose).copied().unwrap_or(0)
    }
}

// =============================================================================
// Identifiers and Reasons
// =============================================================================

/// Pool-internal identifier of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Consecutive health probes failed.
    ProbeFailed,
    /// Host suspend/resume detected; all connections are suspect.
    HostResumed,
    /// Idle longer than the staleness limit.
    Stale,
    /// Gateway stopped answering a dispatched request.
    Unresponsive,
    /// Gateway reported a fatal protocol error.
    Fatal,
    /// Socket closed by the gateway.
    Closed,
    /// Operator or caller request.
    Manual,
}

impl EvictionReason {
    /// Get the reason label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ProbeFailed => "probe_failed",
            Self::HostResumed => "host_resumed",
            Self::Stale => "stale",
            Self::Unresponsive => "unresponsive",
            Self::Fatal => "fatal",
            Self::Closed => "closed",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Failures surfaced by `acquire`.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// `start` has not been called.
    #[error("pool is not running")]
    NotRunning,

    /// Pool is shutting down.
    #[error("pool is shutting down")]
    ShuttingDown,

    /// No capacity is configured for the purpose.
    #[error("no pool capacity configured for {0}")]
    NoCapacity(Purpose),

    /// No connection became available in time.
    #[error("timed out after {waited:?} waiting for a {purpose} connection")]
    AcquireTimeout {
        /// Purpose requested.
        purpose: Purpose,
        /// Time spent waiting.
        waited: Duration,
    },

    /// No free session id in the purpose's range.
    #[error("no free session id for {purpose} in range {range}")]
    ExhaustedRange {
        /// Purpose requested.
        purpose: Purpose,
        /// Its configured range.
        range: IdRange,
    },

    /// Every handshake attempt timed out.
    #[error("handshake timed out in state {state} after {attempts} attempt(s)")]
    HandshakeTimeout {
        /// Attempts made.
        attempts: u32,
        /// State the last attempt was stuck in.
        state: ConnectionState,
    },

    /// Gateway rejected the session.
    #[error("gateway rejected session ({code}): {message}")]
    Fatal {
        /// Gateway error code.
        code: i32,
        /// Gateway error message.
        message: String,
    },

    /// Handshake failed for another reason after all retries.
    #[error("handshake failed after {attempts} attempt(s): {source}")]
    Handshake {
        /// Attempts made.
        attempts: u32,
        /// Last failure.
        source: HandshakeError,
    },

    /// Registry failure other than exhaustion.
    #[error(transparent)]
    Registry(RegistryError),

    /// Connection worker stopped without reporting.
    #[error("connection worker exited unexpectedly")]
    WorkerLost,
}

impl PoolError {
    fn from_establish(err: EstablishError, shutting_down: bool) -> Self {
        match err {
            EstablishError::Registry(RegistryError::ExhaustedRange { purpose, range }) => {
                Self::ExhaustedRange { purpose, range }
            }
            EstablishError::Registry(e) => Self::Registry(e),
            EstablishError::Handshake {
                attempts,
                source: HandshakeError::Timeout { state, .. },
            } => Self::HandshakeTimeout { attempts, state },
            EstablishError::Handshake {
                source: HandshakeError::Rejected { code, message },
                ..
            } => Self::Fatal { code, message },
            EstablishError::Handshake { attempts, source } => Self::Handshake { attempts, source },
            EstablishError::Cancelled if shutting_down => Self::ShuttingDown,
            EstablishError::Cancelled => Self::WorkerLost,
        }
    }

    const fn outcome_label(&self) -> &'static str {
        match self {
            Self::NotRunning | Self::ShuttingDown => "closed",
            Self::NoCapacity(_) => "no_capacity",
            Self::AcquireTimeout { .. } => "timeout",
            Self::ExhaustedRange { .. } => "exhausted_range",
            Self::HandshakeTimeout { .. } => "handshake_timeout",
            Self::Fatal { .. } => "fatal",
            Self::Handshake { .. } | Self::WorkerLost => "handshake_failed",
            Self::Registry(_) => "registry_error",
        }
    }
}

/// Result of `shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Leases still outstanding when the grace period ended.
    pub outstanding_leases: usize,
    /// Connections (including unfinished handshakes) torn down.
    pub connections_closed: usize,
}

// =============================================================================
// Pool State
// =============================================================================

#[derive(Debug)]
struct ConnectionEntry {
    session_id: SessionId,
    purpose: Purpose,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
    leased: bool,
    evicting: Option<EvictionReason>,
    created_at: DateTime<Utc>,
    last_activity: Instant,
    consecutive_failures: u32,
}

impl ConnectionEntry {
    fn is_available(&self) -> bool {
        !self.leased
            && self.evicting.is_none()
            && self.consecutive_failures == 0
            && !self.commands.is_closed()
            && self.status.borrow().is_healthy()
    }
}

#[derive(Debug)]
struct Creating {
    purpose: Purpose,
    session_id: Option<SessionId>,
    /// Registry allocation in flight; its id is not known yet.
    allocating: bool,
    status: watch::Receiver<ConnectionStatus>,
}

#[derive(Debug, Default)]
struct PoolState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    creating: HashMap<ConnectionId, Creating>,
    /// Ids of torn-down connections on their way back to the registry.
    returning: HashMap<SessionId, Purpose>,
    accepting: bool,
    evictions: VecDeque<EvictionRecord>,
}

impl PoolState {
    fn live(&self, purpose: Purpose) -> usize {
        self.connections
            .values()
            .filter(|e| e.purpose == purpose)
            .count()
            + self
                .creating
                .values()
                .filter(|c| c.purpose == purpose)
                .count()
            + self.returning.values().filter(|p| **p == purpose).count()
    }

    fn live_session_ids(&self) -> HashSet<SessionId> {
        self.connections
            .values()
            .map(|e| e.session_id)
            .chain(self.creating.values().filter_map(|c| c.session_id))
            .chain(self.returning.keys().copied())
            .collect()
    }

    fn allocation_in_flight(&self) -> bool {
        self.creating.values().any(|c| c.allocating)
    }

    fn leased(&self) -> usize {
        self.connections.values().filter(|e| e.leased).count()
    }
}

struct PoolInner {
    config: PoolConfig,
    registry: Arc<SessionIdRegistry>,
    coordinator: HandshakeCoordinator,
    pace: Arc<PaceManager>,
    state: Mutex<PoolState>,
    released: Notify,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl PoolInner {
    fn notify(&self) {
        self.released.notify_waiters();
    }

    fn release_lease(&self, id: ConnectionId) {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.connections.get_mut(&id) {
                entry.leased = false;
                entry.last_activity = Instant::now();
            }
        }
        self.notify();
    }

    fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.state.lock().connections.get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    fn evict(&self, id: ConnectionId, reason: EvictionReason) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.connections.get_mut(&id) else {
            return false;
        };
        if entry.evicting.is_some() {
            return false;
        }
        entry.evicting = Some(reason);
        entry.cancel.cancel();
        let session_id = entry.session_id;
        let purpose = entry.purpose;
        self.push_eviction(&mut state, id, session_id, purpose, reason);
        drop(state);

        metrics::record_eviction(reason.as_str());
        tracing::info!(
            connection_id = %id,
            session_id = %session_id,
            purpose = %purpose,
            reason = %reason,
            "Evicting connection"
        );
        true
    }

    fn push_eviction(
        &self,
        state: &mut PoolState,
        connection_id: ConnectionId,
        session_id: SessionId,
        purpose: Purpose,
        reason: EvictionReason,
    ) {
        if self.config.eviction_history == 0 {
            return;
        }
        if state.evictions.len() >= self.config.eviction_history {
            state.evictions.pop_front();
        }
        state.evictions.push_back(EvictionRecord {
            connection_id,
            session_id,
            purpose,
            reason,
            at: Utc::now(),
        });
    }

    fn publish_connections(&self, state: &PoolState, purpose: Purpose) {
        metrics::set_connections(
            purpose,
            state
                .connections
                .values()
                .filter(|e| e.purpose == purpose)
                .count(),
        );
    }
}

/// Acquirer's end of a worker hand-over.
///
/// If the acquirer goes away after the worker reported Ready, the connection
/// is marked idle for the next caller instead of staying leased forever.
struct Handover {
    inner: Arc<PoolInner>,
    connection_id: ConnectionId,
    ready: oneshot::Receiver<Result<(), EstablishError>>,
    taken: bool,
}

impl Drop for Handover {
    fn drop(&mut self) {
        if self.taken {
            return;
        }
        // After close the worker's send fails and it releases the lease
        // itself, so at most one side does.
        self.ready.close();
        if let Ok(Ok(())) = self.ready.try_recv() {
            self.inner.release_lease(self.connection_id);
        }
    }
}

/// Session id source for one creating worker.
///
/// The registry persists outside the pool lock. While the allocation is in
/// flight the creation is flagged so reclaim skips its round instead of
/// freeing an id the pool has not recorded yet.
struct CreationIds<'a> {
    inner: &'a PoolInner,
    connection_id: ConnectionId,
}

impl CreationIds<'_> {
    fn with_creating(&self, f: impl FnOnce(&mut Creating)) {
        if let Some(creating) = self.inner.state.lock().creating.get_mut(&self.connection_id) {
            f(creating);
        }
    }
}

impl SessionIdSource for CreationIds<'_> {
    fn allocate(&self, purpose: Purpose) -> Result<SessionId, RegistryError> {
        self.with_creating(|c| c.allocating = true);
        let result = self.inner.registry.allocate(purpose);
        self.with_creating(|c| {
            c.allocating = false;
            c.session_id = result.as_ref().ok().copied();
        });
        result
    }

    fn retire(&self, id: SessionId) {
        // Retired before the pool forgets it, so reclaim never sees it unowned.
        if let Err(e) = self.inner.registry.retire(id) {
            tracing::error!(session_id = %id, error = %e, "Failed to retire session id");
        }
        self.with_creating(|c| c.session_id = None);
    }
}

// =============================================================================
// Connection Pool
// =============================================================================

/// Monitor-facing view of one pooled connection.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    /// Connection.
    pub connection_id: ConnectionId,
    /// Cached session status.
    pub status: ConnectionStatus,
    /// Whether the worker task is still running.
    pub worker_alive: bool,
    /// Idle time, `None` while leased.
    pub idle_for: Option<Duration>,
}

/// Pool of gateway sessions. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ConnectionPool {
    /// Create a stopped pool.
    #[must_use]
    pub fn new(
        config: PoolConfig,
        registry: Arc<SessionIdRegistry>,
        coordinator: HandshakeCoordinator,
        pace: Arc<PaceManager>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                registry,
                coordinator,
                pace,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Open the pool for `acquire`.
    ///
    /// Reclaims ids left allocated by a previous run first. Returns the
    /// reclaimed ids.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Registry` if the reclaim could not be persisted,
    /// or `PoolError::ShuttingDown` after `shutdown`.
    pub fn start(&self) -> Result<Vec<SessionId>, PoolError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown);
        }
        let mut state = self.inner.state.lock();
        let reclaimed = self
            .inner
            .registry
            .reclaim_stale(&state.live_session_ids())
            .map_err(PoolError::Registry)?;
        state.accepting = true;
        drop(state);

        tracing::info!(reclaimed = reclaimed.len(), "Connection pool started");
        Ok(reclaimed)
    }

    /// Run a health monitor until shutdown.
    pub fn spawn_monitor(&self, monitor: HealthMonitor) {
        let cancel = self.inner.shutdown.child_token();
        self.inner.tracker.spawn(monitor.run(cancel));
    }

    /// Lease a `Ready` connection for `purpose`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AcquireTimeout` when nothing became available in
    /// time, or the handshake failure when a new connection could not be
    /// created.
    pub async fn acquire(&self, purpose: Purpose, timeout: Duration) -> Result<Lease, PoolError> {
        let started = Instant::now();
        let result = self.acquire_until(purpose, started + timeout).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome_label(),
        };
        metrics::record_acquire(purpose, outcome, started.elapsed());
        if let Err(e) = &result {
            tracing::debug!(purpose = %purpose, error = %e, "Acquire failed");
        }
        result
    }

    /// `acquire` with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::acquire`].
    pub async fn acquire_default(&self, purpose: Purpose) -> Result<Lease, PoolError> {
        self.acquire(purpose, self.inner.config.acquire_timeout)
            .await
    }

    async fn acquire_until(&self, purpose: Purpose, deadline: Instant) -> Result<Lease, PoolError> {
        let capacity = self.inner.config.capacity(purpose);
        if capacity == 0 {
            return Err(PoolError::NoCapacity(purpose));
        }
        let started = Instant::now();

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let creation = {
                let mut state = self.inner.state.lock();
                if !state.accepting {
                    return Err(if self.inner.shutdown.is_cancelled() {
                        PoolError::ShuttingDown
                    } else {
                        PoolError::NotRunning
                    });
                }

                let idle = state
                    .connections
                    .iter_mut()
                    .find(|(_, e)| e.purpose == purpose && e.is_available());
                if let Some((id, entry)) = idle {
                    entry.leased = true;
                    entry.last_activity = Instant::now();
                    return Ok(Lease::new(self.inner.clone(), *id, entry));
                }

                if state.live(purpose) < capacity {
                    let connection_id = ConnectionId::new();
                    let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
                    state.creating.insert(
                        connection_id,
                        Creating {
                            purpose,
                            session_id: None,
                            allocating: false,
                            status: status_rx,
                        },
                    );
                    Some((connection_id, status_tx))
                } else {
                    None
                }
            };

            if let Some((connection_id, status_tx)) = creation {
                return self
                    .create(purpose, connection_id, status_tx, deadline)
                    .await;
            }

            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Err(PoolError::AcquireTimeout {
                        purpose,
                        waited: started.elapsed(),
                    });
                }
            }
        }
    }

    async fn create(
        &self,
        purpose: Purpose,
        connection_id: ConnectionId,
        status: watch::Sender<ConnectionStatus>,
        deadline: Instant,
    ) -> Result<Lease, PoolError> {
        let started = Instant::now();
        let cancel = self.inner.shutdown.child_token();
        let handshake = cancel.child_token();
        // Dropping the guard (timeout or caller cancellation) aborts the
        // handshake. A connection that already reached Ready stays pooled.
        let guard = handshake.clone().drop_guard();
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut handover = Handover {
            inner: self.inner.clone(),
            connection_id,
            ready: ready_rx,
            taken: false,
        };

        self.inner.tracker.spawn(worker::run(
            self.inner.clone(),
            connection_id,
            purpose,
            status,
            worker::Tokens { cancel, handshake },
            ready_tx,
        ));

        match tokio::time::timeout_at(deadline, &mut handover.ready).await {
            Ok(Ok(Ok(()))) => {
                let _ = guard.disarm();
                handover.taken = true;
                let state = self.inner.state.lock();
                let entry = state
                    .connections
                    .get(&connection_id)
                    .ok_or(PoolError::WorkerLost)?;
                Ok(Lease::new(self.inner.clone(), connection_id, entry))
            }
            Ok(Ok(Err(err))) => Err(PoolError::from_establish(
                err,
                self.inner.shutdown.is_cancelled(),
            )),
            Ok(Err(_)) => Err(PoolError::WorkerLost),
            Err(_) => {
                drop(guard);
                tracing::warn!(
                    purpose = %purpose,
                    connection_id = %connection_id,
                    "Acquire timed out during connection setup, cancelling handshake"
                );
                Err(PoolError::AcquireTimeout {
                    purpose,
                    waited: started.elapsed(),
                })
            }
        }
    }

    /// Tear down a connection. Returns `false` if it is unknown or already
    /// being evicted. A replacement is created only by a later `acquire`.
    pub fn evict(&self, connection_id: ConnectionId) -> bool {
        self.inner.evict(connection_id, EvictionReason::Manual)
    }

    /// Tear down a connection, recording why.
    pub fn evict_with_reason(&self, connection_id: ConnectionId, reason: EvictionReason) -> bool {
        self.inner.evict(connection_id, reason)
    }

    /// Tear down every pooled connection. Returns the ones this call evicted.
    pub fn evict_all(&self, reason: EvictionReason) -> Vec<ConnectionId> {
        let ids: Vec<ConnectionId> = self.inner.state.lock().connections.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.inner.evict(*id, reason))
            .collect()
    }

    /// Connections the health monitor should probe (evicting ones excluded).
    #[must_use]
    pub fn probe_targets(&self) -> Vec<ProbeTarget> {
        let now = Instant::now();
        let state = self.inner.state.lock();
        state
            .connections
            .iter()
            .filter(|(_, e)| e.evicting.is_none())
            .map(|(id, e)| ProbeTarget {
                connection_id: *id,
                status: *e.status.borrow(),
                worker_alive: !e.commands.is_closed(),
                idle_for: (!e.leased).then(|| now.saturating_duration_since(e.last_activity)),
            })
            .collect()
    }

    /// Record a probe result. Returns the consecutive failure count.
    pub fn record_probe(&self, connection_id: ConnectionId, healthy: bool) -> u32 {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.connections.get_mut(&connection_id) else {
            return 0;
        };
        if healthy {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
        }
        entry.consecutive_failures
    }

    /// Free registry ids whose connection no longer exists.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the result could not be persisted.
    pub fn reclaim_stale(&self) -> Result<Vec<SessionId>, RegistryError> {
        let state = self.inner.state.lock();
        if state.allocation_in_flight() {
            tracing::debug!("Session id allocation in flight, skipping reclaim");
            return Ok(Vec::new());
        }
        // Holds the pool lock through the registry so no id changes hands
        // mid-reclaim. The registry only writes when something is stale.
        let reclaimed = self.inner.registry.reclaim_stale(&state.live_session_ids());
        drop(state);
        reclaimed
    }

    /// Check whether the pool accepts `acquire` calls.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner.state.lock().accepting
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Session id registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionIdRegistry> {
        &self.inner.registry
    }

    /// Pace manager, for callers that pre-check budgets with `admit`.
    #[must_use]
    pub fn pace(&self) -> &Arc<PaceManager> {
        &self.inner.pace
    }

    /// Connection counts, utilization and recent evictions.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.inner.state.lock();
        stats::collect(&self.inner.config, &state, now)
    }

    /// Pool stats plus registry contents and pace state.
    #[must_use]
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            pool: self.stats(),
            registry: self.inner.registry.snapshot(),
            pacing: self.inner.pace.snapshot(),
        }
    }

    /// Stop accepting, wait up to `grace` for leases, tear everything down
    /// and persist the registry.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        {
            self.inner.state.lock().accepting = false;
        }
        self.inner.notify();
        tracing::info!(grace_secs = grace.as_secs(), "Connection pool shutting down");

        let deadline = Instant::now() + grace;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().leased() == 0 {
                break;
            }
            tokio::select! {
                () = &mut notified => {}
                () = tokio::time::sleep_until(deadline) => break,
            }
        }

        let (outstanding_leases, connections_closed) = {
            let state = self.inner.state.lock();
            (state.leased(), state.connections.len() + state.creating.len())
        };
        if outstanding_leases > 0 {
            tracing::warn!(outstanding_leases, "Grace period ended with leases outstanding");
        }

        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        if let Err(e) = self.inner.registry.persist() {
            tracing::error!(error = %e, "Failed to persist session id registry on shutdown");
        }
        tracing::info!(connections_closed, "Connection pool stopped");

        ShutdownReport {
            outstanding_leases,
            connections_closed,
        }
    }
}
