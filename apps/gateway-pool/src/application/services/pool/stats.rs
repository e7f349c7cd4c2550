//! Pool statistics and status report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use super::{ConnectionId, EvictionReason, PoolConfig, PoolState};
use crate::application::services::pacing::PaceSnapshot;
use crate::application::services::registry::RegistrySnapshot;
use crate::domain::connection::ConnectionState;
use crate::domain::session::{Purpose, SessionId};

/// One eviction, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictionRecord {
    /// Evicted connection.
    pub connection_id: ConnectionId,
    /// Its session id.
    pub session_id: SessionId,
    /// Its purpose.
    pub purpose: Purpose,
    /// Why it was evicted.
    pub reason: EvictionReason,
    /// When.
    pub at: DateTime<Utc>,
}

/// Per-purpose utilization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurposeStats {
    /// Purpose.
    pub purpose: Purpose,
    /// Configured ceiling.
    pub capacity: usize,
    /// Established connections.
    pub live: usize,
    /// Connections currently leased.
    pub leased: usize,
    /// Connections available for lease.
    pub idle: usize,
    /// Handshakes in progress.
    pub creating: usize,
}

/// One established connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    /// Connection.
    pub connection_id: ConnectionId,
    /// Session id.
    pub session_id: SessionId,
    /// Purpose.
    pub purpose: Purpose,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Upstream link status.
    pub link_up: bool,
    /// Whether a lease is outstanding.
    pub leased: bool,
    /// Set once eviction has started.
    pub evicting: Option<EvictionReason>,
    /// When the connection reached `Ready`.
    pub created_at: DateTime<Utc>,
    /// Milliseconds since the last request or release.
    pub idle_ms: u64,
    /// Failed health probes in a row.
    pub consecutive_failures: u32,
}

/// Snapshot returned by `ConnectionPool::stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Whether `acquire` is accepted.
    pub accepting: bool,
    /// Connection count per lifecycle state, handshakes included.
    pub by_state: BTreeMap<ConnectionState, usize>,
    /// Per-purpose utilization.
    pub purposes: Vec<PurposeStats>,
    /// Established connections.
    pub connections: Vec<ConnectionInfo>,
    /// Most recent evictions, oldest first.
    pub recent_evictions: Vec<EvictionRecord>,
}

impl PoolStats {
    /// Established connections plus handshakes in progress.
    #[must_use]
    pub fn total_connections(&self) -> usize {
        self.by_state.values().sum()
    }

    /// Connections in `Ready`.
    #[must_use]
    pub fn ready_connections(&self) -> usize {
        self.by_state
            .get(&ConnectionState::Ready)
            .copied()
            .unwrap_or(0)
    }

    /// Whether any purpose could create another connection.
    #[must_use]
    pub fn has_spare_capacity(&self) -> bool {
        self.purposes
            .iter()
            .any(|p| p.live + p.creating < p.capacity)
    }
}

/// Everything the status endpoint reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Pool state.
    pub pool: PoolStats,
    /// Session id allocations.
    pub registry: RegistrySnapshot,
    /// Pace budgets and violations.
    pub pacing: PaceSnapshot,
}

pub(super) fn collect(config: &PoolConfig, state: &PoolState, now: Instant) -> PoolStats {
    let mut by_state = BTreeMap::new();
    for entry in state.connections.values() {
        *by_state.entry(entry.status.borrow().state).or_insert(0) += 1;
    }
    for creating in state.creating.values() {
        *by_state.entry(creating.status.borrow().state).or_insert(0) += 1;
    }

    let purposes = config
        .capacity
        .iter()
        .map(|(&purpose, &capacity)| {
            let (live, leased) = state
                .connections
                .values()
                .filter(|e| e.purpose == purpose)
                .fold((0, 0), |(live, leased), e| (live + 1, leased + usize::from(e.leased)));
            PurposeStats {
                purpose,
                capacity,
                live,
                leased,
                idle: live - leased,
                creating: state
                    .creating
                    .values()
                    .filter(|c| c.purpose == purpose)
                    .count(),
            }
        })
        .collect();

    let mut connections: Vec<ConnectionInfo> = state
        .connections
        .iter()
        .map(|(id, e)| {
            let status = *e.status.borrow();
            ConnectionInfo {
                connection_id: *id,
                session_id: e.session_id,
                purpose: e.purpose,
                state: status.state,
                link_up: status.link_up,
                leased: e.leased,
                evicting: e.evicting,
                created_at: e.created_at,
                idle_ms: u64::try_from(now.saturating_duration_since(e.last_activity).as_millis())
                    .unwrap_or(u64::MAX),
                consecutive_failures: e.consecutive_failures,
            }
        })
        .collect();
    connections.sort_by_key(|c| (c.purpose, c.session_id));

    PoolStats {
        accepting: state.accepting,
        by_state,
        purposes,
        connections,
        recent_evictions: state.evictions.iter().cloned().collect(),
    }
}
