//! Session Identity Types
//!
//! A session id (the gateway calls it a client id) distinguishes one
//! concurrent API session from another. Ids are carved into disjoint,
//! purpose-labelled ranges so interactive, backfill and streaming work never
//! compete for the same identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Purpose
// =============================================================================

/// Caller-declared category partitioning id ranges and pool capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Low-latency requests issued on behalf of a user.
    Interactive,
    /// Bulk historical backfill.
    Backfill,
    /// Long-lived streaming subscriptions.
    Streaming,
}

impl Purpose {
    /// Get all purposes.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Interactive, Self::Backfill, Self::Streaming]
    }

    /// Parse a purpose from a string, ignoring case.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "interactive" => Some(Self::Interactive),
            "backfill" => Some(Self::Backfill),
            "streaming" => Some(Self::Streaming),
            _ => None,
        }
    }

    /// Get the purpose label used in logs, metrics and env var names.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Interactive => "interactive",
            Self::Backfill => "backfill",
            Self::Streaming => "streaming",
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Session Id
// =============================================================================

/// Identifier a connection presents to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u32);

impl SessionId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Id Range
// =============================================================================

/// Inclusive range of session ids reserved for one purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    first: u32,
    last: u32,
}

impl IdRange {
    /// Create a range covering `first..=last`.
    ///
    /// Returns `None` when `last < first`.
    #[must_use]
    pub const fn new(first: u32, last: u32) -> Option<Self> {
        if last < first {
            None
        } else {
            Some(Self { first, last })
        }
    }

    /// Lowest id in the range.
    #[must_use]
    pub const fn first(&self) -> u32 {
        self.first
    }

    /// Highest id in the range.
    #[must_use]
    pub const fn last(&self) -> u32 {
        self.last
    }

    /// Number of ids in the range.
    #[must_use]
    pub const fn len(&self) -> usize {
        (self.last - self.first) as usize + 1
    }

    /// A range always holds at least one id.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Check whether the id falls inside this range.
    #[must_use]
    pub const fn contains(&self, id: SessionId) -> bool {
        id.0 >= self.first && id.0 <= self.last
    }

    /// Check whether two ranges share any id.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    /// Iterate ids in ascending order.
    pub fn ids(self) -> impl Iterator<Item = SessionId> {
        (self.first..=self.last).map(SessionId)
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.first, self.last)
    }
}
