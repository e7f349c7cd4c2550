//! Health Monitor
//!
//! Periodically probes every pooled connection and evicts the ones that stop
//! looking healthy. Probes only read the cached status each worker keeps
//! current, so a check never touches the gateway.
//!
//! Also watches the wall clock: if it jumps much further than the probe
//! interval between two checks, the host was most likely suspended and every
//! connection is assumed dead.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::pool::{ConnectionId, ConnectionPool, EvictionReason};
use crate::domain::session::SessionId;
use crate::infrastructure::metrics;

/// Source of wall-clock time.
pub trait WallClock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Probe cadence and eviction thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between checks.
    pub probe_interval: Duration,
    /// Consecutive failed probes before eviction.
    pub failure_threshold: u32,
    /// Wall-clock gap between checks treated as a host suspend.
    pub suspend_gap: Duration,
    /// Idle time after which a connection is evicted.
    pub stale_after: Duration,
    /// Time between registry reclaims.
    pub reclaim_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(15),
            failure_threshold: 3,
            suspend_gap: Duration::from_secs(120),
            stale_after: Duration::from_secs(30 * 60),
            reclaim_interval: Duration::from_secs(300),
        }
    }
}

/// What one check did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Connections probed.
    pub probed: usize,
    /// Connections whose probe failed.
    pub unhealthy: Vec<ConnectionId>,
    /// Evictions started by this check.
    pub evicted: Vec<(ConnectionId, EvictionReason)>,
    /// Wall-clock gap that triggered suspend handling.
    pub suspend_gap: Option<Duration>,
    /// Ids freed by the registry reclaim.
    pub reclaimed: Vec<SessionId>,
}

/// Background health checker for a [`ConnectionPool`].
pub struct HealthMonitor {
    pool: ConnectionPool,
    config: MonitorConfig,
    clock: Arc<dyn WallClock>,
    last_check: Mutex<Option<DateTime<Utc>>>,
    last_reclaim: Mutex<Instant>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Create a monitor using the system clock.
    #[must_use]
    pub fn new(pool: ConnectionPool, config: MonitorConfig) -> Self {
        Self::with_clock(pool, config, Arc::new(SystemClock))
    }

    /// Create a monitor with a custom wall clock.
    #[must_use]
    pub fn with_clock(
        pool: ConnectionPool,
        config: MonitorConfig,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        Self {
            pool,
            config,
            clock,
            last_check: Mutex::new(None),
            last_reclaim: Mutex::new(Instant::now()),
        }
    }

    /// Monitor configuration.
    #[must_use]
    pub const fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run checks every `probe_interval` until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.probe_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::debug!("Health monitor cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.check_once();
                    if !report.evicted.is_empty() {
                        tracing::info!(
                            probed = report.probed,
                            evicted = report.evicted.len(),
                            "Health check evicted connections"
                        );
                    }
                }
            }
        }
    }

    /// Run one check.
    pub fn check_once(&self) -> CheckReport {
        let mut report = CheckReport::default();

        if let Some(gap) = self.wall_gap() {
            report.suspend_gap = Some(gap);
            metrics::record_suspend_detected();
            tracing::warn!(
                gap_secs = gap.as_secs(),
                "Wall clock jumped, assuming host resumed from suspend"
            );
            report.evicted.extend(
                self.pool
                    .evict_all(EvictionReason::HostResumed)
                    .into_iter()
                    .map(|id| (id, EvictionReason::HostResumed)),
            );
        } else {
            self.probe(&mut report);
        }

        self.maybe_reclaim(&mut report);
        report
    }

    fn wall_gap(&self) -> Option<Duration> {
        let now = self.clock.now();
        let previous = self.last_check.lock().replace(now)?;
        let gap = (now - previous).to_std().ok()?;
        (gap > self.config.suspend_gap).then_some(gap)
    }

    fn probe(&self, report: &mut CheckReport) {
        for target in self.pool.probe_targets() {
            report.probed += 1;
            let id = target.connection_id;
            let healthy = target.worker_alive && target.status.is_healthy();
            let failures = self.pool.record_probe(id, healthy);

            if !healthy {
                report.unhealthy.push(id);
                tracing::debug!(
                    connection_id = %id,
                    state = %target.status.state,
                    link_up = target.status.link_up,
                    failures,
                    "Health probe failed"
                );
                if failures >= self.config.failure_threshold
                    && self.pool.evict_with_reason(id, EvictionReason::ProbeFailed)
                {
                    report.evicted.push((id, EvictionReason::ProbeFailed));
                }
                continue;
            }

            if target
                .idle_for
                .is_some_and(|idle| idle > self.config.stale_after)
                && self.pool.evict_with_reason(id, EvictionReason::Stale)
            {
                report.evicted.push((id, EvictionReason::Stale));
            }
        }
    }

    fn maybe_reclaim(&self, report: &mut CheckReport) {
        {
            let mut last = self.last_reclaim.lock();
            if last.elapsed() < self.config.reclaim_interval {
                return;
            }
            *last = Instant::now();
        }
        match self.pool.reclaim_stale() {
            Ok(reclaimed) => report.reclaimed = reclaimed,
            Err(e) => tracing::error!(error = %e, "Periodic session id reclaim failed"),
        }
    }
}
