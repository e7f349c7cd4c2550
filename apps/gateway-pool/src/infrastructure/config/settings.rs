//! Pool Configuration Settings
//!
//! Configuration for the gateway pool, loaded from environment variables.
//! Every knob has a default, so an empty environment yields a working
//! configuration for a gateway on `127.0.0.1:4002`.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::ports::GatewayEndpoint;
use crate::application::services::{
    BackoffConfig, HandshakeConfig, MonitorConfig, PaceBudget, PacingConfig, PoolConfig,
    RegistryConfig,
};
use crate::domain::connection::HandshakeTimings;
use crate::domain::pacing::RequestCategory;
use crate::domain::session::{IdRange, Purpose};

/// Allocation table storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    /// JSON file holding the allocation table.
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gateway-pool-sessions.json"),
        }
    }
}

/// Status server settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Status/health/metrics HTTP port.
    pub status_port: u16,
    /// Time granted to outstanding leases on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            status_port: 8090,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Complete pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Gateway address.
    pub gateway: GatewayEndpoint,
    /// Handshake timings and retry policy.
    pub handshake: HandshakeConfig,
    /// Pool capacity and timeouts.
    pub pool: PoolConfig,
    /// Session id ranges and quarantine.
    pub registry: RegistryConfig,
    /// Allocation table location.
    pub store: StoreSettings,
    /// Pace budgets and dispatch retry schedule.
    pub pacing: PacingConfig,
    /// Health probe cadence and thresholds.
    pub monitor: MonitorConfig,
    /// Status server.
    pub server: ServerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway: GatewayEndpoint::new("127.0.0.1", 4002),
            handshake: HandshakeConfig::default(),
            pool: PoolConfig::default(),
            registry: RegistryConfig::default(),
            store: StoreSettings::default(),
            pacing: PacingConfig::default(),
            monitor: MonitorConfig::default(),
            server: ServerSettings::default(),
        }
    }
}

impl Settings {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the resulting
    /// configuration is inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`Settings::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = Self::default();

        let gateway = GatewayEndpoint {
            host: env.string("GATEWAY_HOST", &defaults.gateway.host),
            port: env.parse("GATEWAY_PORT", defaults.gateway.port)?,
            connect_timeout: env.millis(
                "GATEWAY_CONNECT_TIMEOUT_MS",
                defaults.gateway.connect_timeout,
            )?,
        };

        let timings = defaults.handshake.timings;
        let retry = defaults.handshake.retry;
        let handshake = HandshakeConfig {
            timings: HandshakeTimings {
                stage_timeout: env.secs("HANDSHAKE_STAGE_TIMEOUT_SECS", timings.stage_timeout)?,
                sync_timeout: env.secs("HANDSHAKE_SYNC_TIMEOUT_SECS", timings.sync_timeout)?,
                settle_interval: env.millis("HANDSHAKE_SETTLE_MS", timings.settle_interval)?,
                min_ready_subsystems: env.parse(
                    "HANDSHAKE_MIN_READY_SUBSYSTEMS",
                    timings.min_ready_subsystems,
                )?,
            },
            retry: env.backoff("HANDSHAKE_RETRY", retry)?,
        };

        let mut pool = PoolConfig {
            acquire_timeout: env.secs("POOL_ACQUIRE_TIMEOUT_SECS", defaults.pool.acquire_timeout)?,
            dispatch_timeout: env.secs(
                "POOL_DISPATCH_TIMEOUT_SECS",
                defaults.pool.dispatch_timeout,
            )?,
            admit_wait: env.secs("POOL_ADMIT_WAIT_SECS", defaults.pool.admit_wait)?,
            eviction_history: env.parse("POOL_EVICTION_HISTORY", defaults.pool.eviction_history)?,
            ..defaults.pool.clone()
        };
        let mut registry = RegistryConfig {
            quarantine: env.secs("REGISTRY_QUARANTINE_SECS", defaults.registry.quarantine)?,
            ..defaults.registry.clone()
        };
        for &purpose in Purpose::all() {
            let suffix = purpose.as_str().to_uppercase();
            let capacity_key = format!("POOL_CAPACITY_{suffix}");
            pool.capacity.insert(
                purpose,
                env.parse(&capacity_key, defaults.pool.capacity(purpose))?,
            );
            let range_key = format!("REGISTRY_RANGE_{suffix}");
            if let Some(range) = env.range(&range_key)? {
                registry.ranges.insert(purpose, range);
            }
        }

        let mut pacing = PacingConfig {
            retry: env.backoff("PACE_RETRY", defaults.pacing.retry)?,
            history_limit: env.parse("PACE_HISTORY_LIMIT", defaults.pacing.history_limit)?,
            ..defaults.pacing.clone()
        };
        for &category in RequestCategory::all() {
            let prefix = format!("PACE_{}", category.as_str().to_uppercase());
            let current = defaults.pacing.budgets.get(&category).copied().unwrap_or(
                PaceBudget::new(50, Duration::from_secs(1), Duration::from_secs(10)),
            );
            pacing.budgets.insert(
                category,
                PaceBudget {
                    max_requests: env
                        .parse(&format!("{prefix}_MAX_REQUESTS"), current.max_requests)?,
                    window: env.millis(&format!("{prefix}_WINDOW_MS"), current.window)?,
                    violation_cooldown: env.millis(
                        &format!("{prefix}_COOLDOWN_MS"),
                        current.violation_cooldown,
                    )?,
                },
            );
        }

        let monitor = MonitorConfig {
            probe_interval: env.secs(
                "MONITOR_PROBE_INTERVAL_SECS",
                defaults.monitor.probe_interval,
            )?,
            failure_threshold: env.parse(
                "MONITOR_FAILURE_THRESHOLD",
                defaults.monitor.failure_threshold,
            )?,
            suspend_gap: env.secs("MONITOR_SUSPEND_GAP_SECS", defaults.monitor.suspend_gap)?,
            stale_after: env.secs("MONITOR_STALE_AFTER_SECS", defaults.monitor.stale_after)?,
            reclaim_interval: env.secs(
                "REGISTRY_RECLAIM_INTERVAL_SECS",
                defaults.monitor.reclaim_interval,
            )?,
        };

        let settings = Self {
            gateway,
            handshake,
            pool,
            registry,
            store: StoreSettings {
                path: env
                    .raw("REGISTRY_STATE_FILE")
                    .map_or(defaults.store.path, PathBuf::from),
            },
            pacing,
            monitor,
            server: ServerSettings {
                status_port: env.parse("STATUS_PORT", defaults.server.status_port)?,
                shutdown_grace: env.secs(
                    "POOL_SHUTDOWN_GRACE_SECS",
                    defaults.server.shutdown_grace,
                )?,
            },
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ranges: Vec<(Purpose, IdRange)> =
            self.registry.ranges.iter().map(|(p, r)| (*p, *r)).collect();
        for (i, (a, range_a)) in ranges.iter().enumerate() {
            for (b, range_b) in &ranges[i + 1..] {
                if range_a.overlaps(range_b) {
                    return Err(ConfigError::OverlappingRanges { a: *a, b: *b });
                }
            }
        }

        for &purpose in Purpose::all() {
            let capacity = self.pool.capacity(purpose);
            if capacity == 0 {
                return Err(ConfigError::ZeroCapacity(purpose));
            }
            let range = self
                .registry
                .ranges
                .get(&purpose)
                .ok_or(ConfigError::MissingRange(purpose))?;
            if capacity > range.len() {
                return Err(ConfigError::CapacityExceedsRange {
                    purpose,
                    capacity,
                    range: *range,
                });
            }
        }

        for (prefix, retry) in [
            ("HANDSHAKE_RETRY", &self.handshake.retry),
            ("PACE_RETRY", &self.pacing.retry),
        ] {
            if retry.max_delay < retry.initial_delay {
                return Err(ConfigError::InvertedBackoff {
                    prefix: prefix.to_string(),
                    initial: retry.initial_delay,
                    max: retry.max_delay,
                });
            }
        }

        let transient_ceiling = self.pacing.retry.longest_delay();
        for (&category, budget) in &self.pacing.budgets {
            if budget.max_requests == 0 || budget.window.is_zero() {
                return Err(ConfigError::ZeroBudget(category));
            }
            if budget.violation_cooldown <= budget.window {
                return Err(ConfigError::CooldownTooShort {
                    category,
                    cooldown: budget.violation_cooldown,
                    window: budget.window,
                });
            }
            if budget.violation_cooldown <= transient_ceiling {
                return Err(ConfigError::CooldownWithinRetry {
                    category,
                    cooldown: budget.violation_cooldown,
                    retry: transient_ceiling,
                });
            }
        }

        if self.monitor.probe_interval.is_zero() {
            return Err(ConfigError::invalid(
                "MONITOR_PROBE_INTERVAL_SECS",
                "0",
                "probe interval must be positive",
            ));
        }
        if self.monitor.suspend_gap <= self.monitor.probe_interval {
            return Err(ConfigError::SuspendGapTooShort {
                gap: self.monitor.suspend_gap,
                probe_interval: self.monitor.probe_interval,
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable could not be parsed.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// What was expected.
        reason: String,
    },

    /// Two purposes share session ids.
    #[error("session id ranges for {a} and {b} overlap")]
    OverlappingRanges {
        /// First purpose.
        a: Purpose,
        /// Second purpose.
        b: Purpose,
    },

    /// A purpose has no session id range.
    #[error("no session id range configured for {0}")]
    MissingRange(Purpose),

    /// A purpose has zero pool capacity.
    #[error("pool capacity for {0} must be at least 1")]
    ZeroCapacity(Purpose),

    /// Capacity cannot be met by the id range.
    #[error("pool capacity {capacity} for {purpose} exceeds its id range {range}")]
    CapacityExceedsRange {
        /// Purpose.
        purpose: Purpose,
        /// Configured capacity.
        capacity: usize,
        /// Configured range.
        range: IdRange,
    },

    /// A pace budget admits nothing.
    #[error("pace budget for {0} must allow at least one request per non-empty window")]
    ZeroBudget(RequestCategory),

    /// Violation cooldown must outlast the window.
    #[error("violation cooldown {cooldown:?} for {category} must exceed its window {window:?}")]
    CooldownTooShort {
        /// Category.
        category: RequestCategory,
        /// Configured cooldown.
        cooldown: Duration,
        /// Configured window.
        window: Duration,
    },

    /// Violation cooldown must outlast every transient retry delay.
    #[error(
        "violation cooldown {cooldown:?} for {category} must exceed the longest retry delay {retry:?}"
    )]
    CooldownWithinRetry {
        /// Category.
        category: RequestCategory,
        /// Configured cooldown.
        cooldown: Duration,
        /// Longest transient retry delay, jitter included.
        retry: Duration,
    },

    /// Retry schedule whose cap is below its first delay.
    #[error("{prefix} max delay {max:?} is below its initial delay {initial:?}")]
    InvertedBackoff {
        /// Variable prefix of the schedule.
        prefix: String,
        /// Configured initial delay.
        initial: Duration,
        /// Configured max delay.
        max: Duration,
    },

    /// Suspend detection would fire on ordinary probe ticks.
    #[error("suspend gap {gap:?} must exceed the probe interval {probe_interval:?}")]
    SuspendGapTooShort {
        /// Configured gap.
        gap: Duration,
        /// Configured probe interval.
        probe_interval: Duration,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: &str) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

// =============================================================================
// Parse Helpers
// =============================================================================

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        self.raw(key).map_or(Ok(default), |v| {
            v.parse()
                .map_err(|_| ConfigError::invalid(key, &v, "not a valid number"))
        })
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.raw(key).map_or(Ok(default), |v| {
            v.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::invalid(key, &v, "expected whole seconds"))
        })
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.raw(key).map_or(Ok(default), |v| {
            v.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::invalid(key, &v, "expected whole milliseconds"))
        })
    }

    fn fraction(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        self.raw(key).map_or(Ok(default), |v| match v.parse::<f64>() {
            Ok(f) if (0.0..=1.0).contains(&f) => Ok(f),
            _ => Err(ConfigError::invalid(key, &v, "expected a fraction in 0..=1")),
        })
    }

    fn range(&self, key: &str) -> Result<Option<IdRange>, ConfigError> {
        let Some(v) = self.raw(key) else {
            return Ok(None);
        };
        let parsed = v.split_once('-').and_then(|(first, last)| {
            let first = first.trim().parse().ok()?;
            let last = last.trim().parse().ok()?;
            IdRange::new(first, last)
        });
        parsed
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(key, &v, "expected FIRST-LAST with FIRST <= LAST"))
    }

    fn backoff(&self, prefix: &str, default: BackoffConfig) -> Result<BackoffConfig, ConfigError> {
        let multiplier_key = format!("{prefix}_MULTIPLIER");
        let multiplier = self.parse(&multiplier_key, default.multiplier)?;
        if multiplier < 1.0 {
            return Err(ConfigError::invalid(
                &multiplier_key,
                &multiplier.to_string(),
                "multiplier must be at least 1.0",
            ));
        }
        Ok(BackoffConfig {
            initial_delay: self.millis(&format!("{prefix}_INITIAL_MS"), default.initial_delay)?,
            max_delay: self.millis(&format!("{prefix}_MAX_MS"), default.max_delay)?,
            multiplier,
            jitter_factor: self.fraction(&format!("{prefix}_JITTER"), default.jitter_factor)?,
            max_attempts: self.parse(&format!("{prefix}_MAX_ATTEMPTS"), default.max_attempts)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.gateway.to_string(), "127.0.0.1:4002");
        assert_eq!(settings.server.status_port, 8090);
    }

    #[test]
    fn overrides_are_applied() {
        let settings = settings(&[
            ("GATEWAY_HOST", "gw.internal"),
            ("GATEWAY_PORT", "7497"),
            ("HANDSHAKE_SETTLE_MS", "3500"),
            ("HANDSHAKE_RETRY_MAX_ATTEMPTS", "5"),
            ("POOL_CAPACITY_BACKFILL", "4"),
            ("REGISTRY_RANGE_BACKFILL", "100-119"),
            ("PACE_HISTORICAL_MAX_REQUESTS", "30"),
            ("PACE_HISTORICAL_COOLDOWN_MS", "1200000"),
            ("MONITOR_SUSPEND_GAP_SECS", "300"),
            ("REGISTRY_STATE_FILE", "/var/lib/gateway-pool/ids.json"),
        ])
        .unwrap();

        assert_eq!(settings.gateway.host, "gw.internal");
        assert_eq!(settings.gateway.port, 7497);
        assert_eq!(
            settings.handshake.timings.settle_interval,
            Duration::from_millis(3500)
        );
        assert_eq!(settings.handshake.retry.max_attempts, 5);
        assert_eq!(settings.pool.capacity(Purpose::Backfill), 4);
        assert_eq!(
            settings.registry.ranges[&Purpose::Backfill],
            IdRange::new(100, 119).unwrap()
        );
        let historical = settings.pacing.budgets[&RequestCategory::Historical];
        assert_eq!(historical.max_requests, 30);
        assert_eq!(historical.violation_cooldown, Duration::from_secs(1200));
        assert_eq!(settings.monitor.suspend_gap, Duration::from_secs(300));
        assert_eq!(
            settings.store.path,
            PathBuf::from("/var/lib/gateway-pool/ids.json")
        );
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let err = settings(&[("GATEWAY_PORT", "port")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "GATEWAY_PORT"));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let err = settings(&[("REGISTRY_RANGE_STREAMING", "5-12")]).unwrap_err();
        assert!(matches!(err, ConfigError::OverlappingRanges { .. }));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let err = settings(&[("REGISTRY_RANGE_STREAMING", "40-30")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn capacity_larger_than_range_is_rejected() {
        let err = settings(&[("POOL_CAPACITY_STREAMING", "11")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CapacityExceedsRange {
                purpose: Purpose::Streaming,
                capacity: 11,
                ..
            }
        ));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = settings(&[("POOL_CAPACITY_INTERACTIVE", "0")]).unwrap_err();
        assert_eq!(err, ConfigError::ZeroCapacity(Purpose::Interactive));
    }

    #[test]
    fn cooldown_must_exceed_window() {
        let err = settings(&[("PACE_MARKET_DATA_COOLDOWN_MS", "1000")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CooldownTooShort {
                category: RequestCategory::MarketData,
                ..
            }
        ));
    }

    #[test]
    fn cooldown_must_exceed_longest_retry_delay() {
        let err = settings(&[
            ("PACE_GENERAL_WINDOW_MS", "1000"),
            ("PACE_GENERAL_COOLDOWN_MS", "1500"),
            ("PACE_RETRY_INITIAL_MS", "5000"),
            ("PACE_RETRY_MAX_MS", "8000"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::CooldownWithinRetry {
                category: RequestCategory::General,
                ..
            }
        ));

        let err = settings(&[("PACE_RETRY_JITTER", "0.3")]).unwrap_err();
        assert!(
            matches!(err, ConfigError::CooldownWithinRetry { retry, .. } if retry > Duration::from_secs(10))
        );
    }

    #[test]
    fn retry_cap_below_initial_delay_is_rejected() {
        let err = settings(&[("PACE_RETRY_INITIAL_MS", "9000"), ("PACE_RETRY_MAX_MS", "4000")])
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvertedBackoff { prefix, .. } if prefix == "PACE_RETRY"));
    }

    #[test]
    fn accepted_settings_keep_violation_cooldown_above_transient() {
        let settings = settings(&[
            ("PACE_GENERAL_COOLDOWN_MS", "3000"),
            ("PACE_RETRY_MAX_MS", "2000"),
        ])
        .unwrap();
        let pace = crate::PaceManager::new(
            settings.pacing.clone(),
            crate::ClassificationTable::default(),
        );
        for category in RequestCategory::all() {
            let pacing = pace
                .cooldown_for(*category, crate::ErrorClass::PacingViolation)
                .unwrap();
            let transient = pace
                .cooldown_for(*category, crate::ErrorClass::Transient)
                .unwrap();
            assert!(pacing > transient, "{category}: {pacing:?} <= {transient:?}");
        }
    }

    #[test]
    fn zero_budget_is_rejected() {
        let err = settings(&[("PACE_GENERAL_MAX_REQUESTS", "0")]).unwrap_err();
        assert_eq!(err, ConfigError::ZeroBudget(RequestCategory::General));
    }

    #[test]
    fn suspend_gap_must_exceed_probe_interval() {
        let err = settings(&[("MONITOR_SUSPEND_GAP_SECS", "10")]).unwrap_err();
        assert!(matches!(err, ConfigError::SuspendGapTooShort { .. }));
    }

    #[test]
    fn jitter_outside_unit_interval_is_rejected() {
        let err = settings(&[("PACE_RETRY_JITTER", "1.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "PACE_RETRY_JITTER"));
    }
}
