//! Pace Manager
//!
//! Per-category request budgets enforced before dispatch.
//!
//! # Budget Model
//!
//! Each category has a sliding window of admitted requests: a request is
//! admitted only while fewer than `max_requests` were admitted during the
//! last `window`. Slots free up one by one as old admissions age out, so
//! there is no burst at a window boundary.
//!
//! A pacing violation reported by the gateway means the model
//! under-estimated the real ceiling. It puts the whole category into a
//! cooldown longer than the window; nothing in that category is admitted
//! until the cooldown ends.
//!
//! `admit` never blocks. It returns a [`WaitHint`] when the budget is spent
//! and the caller decides whether to wait (`admit_wait`) or fail fast.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use super::backoff::BackoffConfig;
use crate::domain::pacing::{
    ClassificationTable, ErrorClass, ErrorRecord, GatewayError, RequestCategory,
};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Request budget for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaceBudget {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Sliding window length.
    pub window: Duration,
    /// Category-wide pause after a pacing violation.
    pub violation_cooldown: Duration,
}

impl PaceBudget {
    /// Create a budget.
    #[must_use]
    pub const fn new(max_requests: u32, window: Duration, violation_cooldown: Duration) -> Self {
        Self {
            max_requests,
            window,
            violation_cooldown,
        }
    }
}

/// Budgets and retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct PacingConfig {
    /// Budget per category.
    pub budgets: BTreeMap<RequestCategory, PaceBudget>,
    /// Dispatch retry schedule for transient errors and post-cooldown retries.
    pub retry: BackoffConfig,
    /// Pacing violations kept for diagnostics.
    pub history_limit: usize,
}

impl Default for PacingConfig {
    fn default() -> Self {
        let budgets = [
            (
                RequestCategory::Historical,
                PaceBudget::new(60, Duration::from_secs(600), Duration::from_secs(900)),
            ),
            (
                RequestCategory::MarketData,
                PaceBudget::new(50, Duration::from_secs(1), Duration::from_secs(10)),
            ),
            (
                RequestCategory::ContractDetails,
                PaceBudget::new(40, Duration::from_secs(1), Duration::from_secs(10)),
            ),
            (
                RequestCategory::General,
                PaceBudget::new(50, Duration::from_secs(1), Duration::from_secs(10)),
            ),
        ]
        .into_iter()
        .collect();

        Self {
            budgets,
            retry: BackoffConfig::new(
                Duration::from_millis(250),
                Duration::from_secs(8),
                2.0,
                0.2,
                4,
            ),
            history_limit: 50,
        }
    }
}

impl PacingConfig {
    fn budget(&self, category: RequestCategory) -> PaceBudget {
        self.budgets.get(&category).copied().unwrap_or(PaceBudget::new(
            50,
            Duration::from_secs(1),
            Duration::from_secs(10),
        ))
    }
}

// =============================================================================
// Admission Types
// =============================================================================

/// Right to dispatch one request. Must be handed back to `record_outcome`.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a permit holds a budget slot until its outcome is recorded"]
pub struct Permit {
    id: u64,
    category: RequestCategory,
    request_id: Option<Uuid>,
}

impl Permit {
    /// Category the permit was charged to.
    #[must_use]
    pub const fn category(&self) -> RequestCategory {
        self.category
    }

    /// Tag the permit with the request it is spent on.
    pub const fn for_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitReason {
    /// Window budget spent.
    Budget,
    /// Category cooling down after a pacing violation.
    Cooldown,
}

impl WaitReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Budget => "budget",
            Self::Cooldown => "cooldown",
        }
    }
}

/// How long until admission could succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitHint {
    /// Earliest time worth retrying `admit`.
    pub retry_after: Duration,
    /// What is blocking admission.
    pub reason: WaitReason,
}

/// Result of an admission check.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// Dispatch may proceed.
    Permit(Permit),
    /// Budget exhausted; try again later.
    Wait(WaitHint),
}

/// What happened to an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Gateway answered.
    Success,
    /// Gateway reported an error.
    Failure(GatewayError),
    /// Socket failed while the request was outstanding.
    TransportFailure(String),
    /// Caller gave up after the request was on the wire; the slot stays spent.
    Cancelled,
    /// Request never reached the wire; the slot is refunded.
    NotSent,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Budget usage of one category, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryPaceState {
    /// Category.
    pub category: RequestCategory,
    /// Requests admitted in the current window.
    pub in_window: usize,
    /// Budget per window.
    pub max_requests: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Remaining cooldown in milliseconds, zero when not cooling down.
    pub cooldown_remaining_ms: u64,
}

/// Pace state, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaceSnapshot {
    /// Per-category usage.
    pub categories: Vec<CategoryPaceState>,
    /// Recent pacing violations, oldest first.
    pub violations: Vec<ErrorRecord>,
}

// =============================================================================
// Pace Manager
// =============================================================================

#[derive(Debug, Default)]
struct CategoryState {
    admitted: VecDeque<(u64, Instant)>,
    cooldown_until: Option<Instant>,
}

impl CategoryState {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some((_, at)) = self.admitted.front() {
            if now.saturating_duration_since(*at) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
        if self.cooldown_until.is_some_and(|until| until <= now) {
            self.cooldown_until = None;
        }
    }
}

#[derive(Debug, Default)]
struct PaceState {
    categories: HashMap<RequestCategory, CategoryState>,
    violations: VecDeque<ErrorRecord>,
}

/// Enforces per-category budgets and classifies outcomes.
#[derive(Debug)]
pub struct PaceManager {
    config: PacingConfig,
    classifier: ClassificationTable,
    state: Mutex<PaceState>,
    next_permit: AtomicU64,
}

impl PaceManager {
    /// Create a manager.
    #[must_use]
    pub fn new(config: PacingConfig, classifier: ClassificationTable) -> Self {
        Self {
            config,
            classifier,
            state: Mutex::new(PaceState::default()),
            next_permit: AtomicU64::new(1),
        }
    }

    /// Error classification table in use.
    #[must_use]
    pub const fn classifier(&self) -> &ClassificationTable {
        &self.classifier
    }

    /// Dispatch retry schedule.
    #[must_use]
    pub const fn retry_policy(&self) -> BackoffConfig {
        self.config.retry
    }

    /// Check the budget and take a slot if one is free.
    pub fn admit(&self, category: RequestCategory) -> Admission {
        let budget = self.config.budget(category);
        let now = Instant::now();

        let mut state = self.state.lock();
        let entry = state.categories.entry(category).or_default();
        entry.prune(budget.window, now);

        if let Some(until) = entry.cooldown_until {
            drop(state);
            metrics::record_pace_wait(category, WaitReason::Cooldown.as_str());
            return Admission::Wait(WaitHint {
                retry_after: until.saturating_duration_since(now),
                reason: WaitReason::Cooldown,
            });
        }

        let max = usize::try_from(budget.max_requests).unwrap_or(usize::MAX);
        if entry.admitted.len() >= max {
            let retry_after = entry.admitted.front().map_or(budget.window, |(_, at)| {
                (*at + budget.window).saturating_duration_since(now)
            });
            drop(state);
            metrics::record_pace_wait(category, WaitReason::Budget.as_str());
            return Admission::Wait(WaitHint {
                retry_after,
                reason: WaitReason::Budget,
            });
        }

        let id = self.next_permit.fetch_add(1, Ordering::Relaxed);
        entry.admitted.push_back((id, now));
        drop(state);

        metrics::record_pace_admitted(category);
        Admission::Permit(Permit {
            id,
            category,
            request_id: None,
        })
    }

    /// Wait for a slot until `deadline`.
    ///
    /// # Errors
    ///
    /// Returns the last `WaitHint` when no slot frees up before `deadline`.
    pub async fn admit_wait(
        &self,
        category: RequestCategory,
        deadline: Instant,
    ) -> Result<Permit, WaitHint> {
        loop {
            match self.admit(category) {
                Admission::Permit(permit) => return Ok(permit),
                Admission::Wait(hint) => {
                    // Zero hints come from slots expiring right now.
                    let wake = Instant::now() + hint.retry_after.max(Duration::from_millis(1));
                    if wake > deadline {
                        return Err(hint);
                    }
                    tokio::time::sleep_until(wake).await;
                }
            }
        }
    }

    /// Record what happened to an admitted request.
    ///
    /// Returns the error class for failures and `None` otherwise. A pacing
    /// violation starts the category cooldown and is kept in the history.
    pub fn record_outcome(&self, permit: Permit, outcome: &Outcome) -> Option<ErrorClass> {
        let category = permit.category;
        match outcome {
            Outcome::Success | Outcome::Cancelled => None,
            Outcome::NotSent => {
                let mut state = self.state.lock();
                if let Some(entry) = state.categories.get_mut(&category) {
                    entry.admitted.retain(|(id, _)| *id != permit.id);
                }
                None
            }
            Outcome::TransportFailure(reason) => {
                tracing::debug!(category = %category, reason = %reason, "Transient transport failure");
                Some(ErrorClass::Transient)
            }
            Outcome::Failure(error) => {
                let class = self.classifier.classify(error);
                if class == ErrorClass::PacingViolation {
                    self.start_cooldown(&permit, error);
                }
                Some(class)
            }
        }
    }

    /// Pause before retrying a request that failed with `class`.
    ///
    /// `None` for fatal errors. A pacing violation always waits longer than
    /// a transient error in the same category.
    #[must_use]
    pub fn cooldown_for(&self, category: RequestCategory, class: ErrorClass) -> Option<Duration> {
        match class {
            ErrorClass::Fatal => None,
            ErrorClass::Transient => Some(self.config.retry.longest_delay()),
            ErrorClass::PacingViolation => Some(self.config.budget(category).violation_cooldown),
        }
    }

    /// Remaining cooldown for a category.
    #[must_use]
    pub fn cooldown_remaining(&self, category: RequestCategory) -> Option<Duration> {
        let now = Instant::now();
        self.state
            .lock()
            .categories
            .get(&category)
            .and_then(|entry| entry.cooldown_until)
            .map(|until| until.saturating_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Current budgets and violation history.
    #[must_use]
    pub fn snapshot(&self) -> PaceSnapshot {
        let now = Instant::now();
        let mut state = self.state.lock();

        let categories = RequestCategory::all()
            .iter()
            .map(|category| {
                let budget = self.config.budget(*category);
                let entry = state.categories.entry(*category).or_default();
                entry.prune(budget.window, now);
                CategoryPaceState {
                    category: *category,
                    in_window: entry.admitted.len(),
                    max_requests: budget.max_requests,
                    window_ms: duration_ms(budget.window),
                    cooldown_remaining_ms: entry
                        .cooldown_until
                        .map_or(0, |until| duration_ms(until.saturating_duration_since(now))),
                }
            })
            .collect();
        let violations = state.violations.iter().cloned().collect();
        drop(state);

        PaceSnapshot {
            categories,
            violations,
        }
    }

    fn start_cooldown(&self, permit: &Permit, error: &GatewayError) {
        let budget = self.config.budget(permit.category);
        let now = Instant::now();
        let until = now + budget.violation_cooldown;

        let mut state = self.state.lock();
        let entry = state.categories.entry(permit.category).or_default();
        entry.cooldown_until = Some(entry.cooldown_until.map_or(until, |current| current.max(until)));

        if self.config.history_limit > 0 {
            if state.violations.len() >= self.config.history_limit {
                state.violations.pop_front();
            }
            state.violations.push_back(ErrorRecord {
                request_id: permit.request_id,
                category: permit.category,
                code: error.code,
                message: error.message.clone(),
                class: ErrorClass::PacingViolation,
                at: Utc::now(),
            });
        }
        drop(state);

        metrics::record_pacing_violation(permit.category);
        tracing::warn!(
            category = %permit.category,
            code = error.code,
            msg = %error.message,
            cooldown_secs = budget.violation_cooldown.as_secs(),
            "Pacing violation, category cooling down"
        );
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
