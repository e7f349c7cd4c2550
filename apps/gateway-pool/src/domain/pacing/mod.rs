//! Request Categories and Error Classification
//!
//! The gateway enforces separate, undocumented request ceilings per kind of
//! request, so budgets are kept per [`RequestCategory`]. Every failure the
//! gateway reports is tagged with an [`ErrorClass`] that decides what happens
//! next:
//!
//! | Class | Examples | Action |
//! |-------|----------|--------|
//! | `PacingViolation` | 100, 162, 420 | category cooldown, then retry |
//! | `Transient` | 502, 504, 1100, timeouts | exponential backoff + jitter |
//! | `Fatal` | 200, 321, auth failures | never retried |
//!
//! Unknown errors are treated as transient so that a new gateway message
//! never silently turns into a permanent failure.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Request Category
// =============================================================================

/// Kind of request, each with its own pace budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCategory {
    /// Historical bars and ticks.
    Historical,
    /// Market data subscriptions and snapshots.
    MarketData,
    /// Contract and symbol lookups.
    ContractDetails,
    /// Everything else.
    General,
}

impl RequestCategory {
    /// Get all categories.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Historical,
            Self::MarketData,
            Self::ContractDetails,
            Self::General,
        ]
    }

    /// Parse a category from a string, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "historical" => Some(Self::Historical),
            "market_data" | "marketdata" => Some(Self::MarketData),
            "contract_details" | "contractdetails" => Some(Self::ContractDetails),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    /// Get the category label used in logs, metrics and env var names.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Historical => "historical",
            Self::MarketData => "market_data",
            Self::ContractDetails => "contract_details",
            Self::General => "general",
        }
    }
}

impl fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Gateway Error
// =============================================================================

/// Error or notice reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("gateway error {code}: {message}")]
pub struct GatewayError {
    /// Gateway error code.
    pub code: i32,
    /// Gateway error text.
    pub message: String,
}

impl GatewayError {
    /// Create a gateway error.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

// =============================================================================
// Error Class
// =============================================================================

/// Retry disposition of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Socket or generic error; safe to retry quickly.
    Transient,
    /// Rate ceiling breached; retry only after the category cooldown.
    PacingViolation,
    /// Authentication failure or permanent rejection; never retried.
    Fatal,
}

impl ErrorClass {
    /// Get the class label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::PacingViolation => "pacing_violation",
            Self::Fatal => "fatal",
        }
    }

    /// Check if the failure may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure kept for retry decisions and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    /// Request that failed, when known.
    pub request_id: Option<Uuid>,
    /// Category the request was charged to.
    pub category: RequestCategory,
    /// Gateway error code.
    pub code: i32,
    /// Gateway error text.
    pub message: String,
    /// Assigned class.
    pub class: ErrorClass,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

// =============================================================================
// Classification Table
// =============================================================================

const PACING_CODES: &[i32] = &[
    100, // Max rate of messages per second exceeded
    162, // Historical data service error (pacing violation)
    420, // Invalid real-time query (pacing)
];

const TRANSIENT_CODES: &[i32] = &[
    502,  // Couldn't connect
    504,  // Not connected
    1100, // Connectivity lost
    1102, // Connectivity restored, data maintained
    2103, // Market data farm connection broken
    2105, // Historical data farm connection broken
    2110, // Connectivity between gateway and server broken
];

const FATAL_CODES: &[i32] = &[
    200, // No security definition found
    203, // Security not available for this account
    321, // Error validating request
    354, // Requested market data not subscribed
];

/// Maps gateway errors onto an [`ErrorClass`].
///
/// Lookup order: explicit code, then message substrings, then the default
/// (`Transient`).
#[derive(Debug, Clone)]
pub struct ClassificationTable {
    codes: HashMap<i32, ErrorClass>,
    patterns: Vec<(String, ErrorClass)>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        let mut codes = HashMap::new();
        for code in TRANSIENT_CODES {
            codes.insert(*code, ErrorClass::Transient);
        }
        for code in FATAL_CODES {
            codes.insert(*code, ErrorClass::Fatal);
        }
        for code in PACING_CODES {
            codes.insert(*code, ErrorClass::PacingViolation);
        }

        let patterns = [
            ("pacing violation", ErrorClass::PacingViolation),
            ("max rate of messages", ErrorClass::PacingViolation),
            ("too many requests", ErrorClass::PacingViolation),
            ("not authenticated", ErrorClass::Fatal),
            ("login failed", ErrorClass::Fatal),
            ("permission denied", ErrorClass::Fatal),
            ("no security definition", ErrorClass::Fatal),
            ("connection reset", ErrorClass::Transient),
            ("timeout", ErrorClass::Transient),
        ]
        .into_iter()
        .map(|(pattern, class)| (pattern.to_string(), class))
        .collect();

        Self { codes, patterns }
    }
}

impl ClassificationTable {
    /// Create an empty table where everything is transient.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            codes: HashMap::new(),
            patterns: Vec::new(),
        }
    }

    /// Override the class for one error code.
    #[must_use]
    pub fn with_code(mut self, code: i32, class: ErrorClass) -> Self {
        self.codes.insert(code, class);
        self
    }

    /// Add a case-insensitive message pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: &str, class: ErrorClass) -> Self {
        self.patterns.push((pattern.to_lowercase(), class));
        self
    }

    /// Classify a gateway error.
    #[must_use]
    pub fn classify(&self, error: &GatewayError) -> ErrorClass {
        if let Some(class) = self.codes.get(&error.code) {
            return *class;
        }

        let lower = error.message.to_lowercase();
        self.patterns
            .iter()
            .find(|(pattern, _)| lower.contains(pattern.as_str()))
            .map_or(ErrorClass::Transient, |(_, class)| *class)
    }
}
