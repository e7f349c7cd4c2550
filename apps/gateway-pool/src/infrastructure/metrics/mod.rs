//! Prometheus Metrics Module
//!
//! Exposes pool, handshake and pacing metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Acquire**: lease acquisition latency and outcomes per purpose
//! - **Connections**: handshake outcomes and live connections per purpose
//! - **Pacing**: admissions, waits, violations and dispatch retries per category
//! - **Health**: evictions by reason and detected host suspensions
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the status server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::pacing::{ErrorClass, RequestCategory};
use crate::domain::session::Purpose;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns `BuildError` if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Acquire
    describe_histogram!(
        "gateway_pool_acquire_seconds",
        "Time spent in acquire, by purpose and outcome"
    );
    describe_counter!(
        "gateway_pool_acquire_total",
        "Acquire calls by purpose and outcome"
    );

    // Connections
    describe_counter!(
        "gateway_pool_handshakes_total",
        "Handshake attempts by outcome"
    );
    describe_gauge!(
        "gateway_pool_connections",
        "Live pooled connections by purpose"
    );
    describe_gauge!(
        "gateway_pool_session_ids_allocated",
        "Session ids currently marked in use"
    );

    // Pacing
    describe_counter!(
        "gateway_pool_pace_admitted_total",
        "Requests admitted by category"
    );
    describe_counter!(
        "gateway_pool_pace_waits_total",
        "Admission checks answered with a wait hint, by category"
    );
    describe_counter!(
        "gateway_pool_pacing_violations_total",
        "Pacing violations reported by the gateway, by category"
    );
    describe_counter!(
        "gateway_pool_dispatch_retries_total",
        "Dispatch retries by category and error class"
    );

    // Health
    describe_counter!(
        "gateway_pool_evictions_total",
        "Connection evictions by reason"
    );
    describe_counter!(
        "gateway_pool_suspend_detected_total",
        "Host suspend/resume gaps detected by the health monitor"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record one finished acquire call.
pub fn record_acquire(purpose: Purpose, outcome: &'static str, elapsed: Duration) {
    counter!(
        "gateway_pool_acquire_total",
        "purpose" => purpose.as_str(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "gateway_pool_acquire_seconds",
        "purpose" => purpose.as_str(),
        "outcome" => outcome
    )
    .record(elapsed.as_secs_f64());
}

/// Record one handshake attempt.
pub fn record_handshake(outcome: &'static str) {
    counter!("gateway_pool_handshakes_total", "outcome" => outcome).increment(1);
}

/// Update the live connection count for a purpose.
#[allow(clippy::cast_precision_loss)]
pub fn set_connections(purpose: Purpose, count: usize) {
    gauge!("gateway_pool_connections", "purpose" => purpose.as_str()).set(count as f64);
}

/// Update the allocated session id count.
#[allow(clippy::cast_precision_loss)]
pub fn set_allocated_ids(count: usize) {
    gauge!("gateway_pool_session_ids_allocated").set(count as f64);
}

/// Record an admitted request.
pub fn record_pace_admitted(category: RequestCategory) {
    counter!("gateway_pool_pace_admitted_total", "category" => category.as_str()).increment(1);
}

/// Record an admission check answered with a wait hint.
pub fn record_pace_wait(category: RequestCategory, reason: &'static str) {
    counter!(
        "gateway_pool_pace_waits_total",
        "category" => category.as_str(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a pacing violation.
pub fn record_pacing_violation(category: RequestCategory) {
    counter!("gateway_pool_pacing_violations_total", "category" => category.as_str())
        .increment(1);
}

/// Record a dispatch retry.
pub fn record_dispatch_retry(category: RequestCategory, class: ErrorClass) {
    counter!(
        "gateway_pool_dispatch_retries_total",
        "category" => category.as_str(),
        "class" => class.as_str()
    )
    .increment(1);
}

/// Record a connection eviction.
pub fn record_eviction(reason: &'static str) {
    counter!("gateway_pool_evictions_total", "reason" => reason).increment(1);
}

/// Record a detected host suspension.
pub fn record_suspend_detected() {
    counter!("gateway_pool_suspend_detected_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_noop() {
        record_acquire(Purpose::Backfill, "ok", Duration::from_millis(5));
        record_eviction("probe_failed");
        record_dispatch_retry(RequestCategory::Historical, ErrorClass::Transient);
        set_connections(Purpose::Interactive, 2);
    }
}
