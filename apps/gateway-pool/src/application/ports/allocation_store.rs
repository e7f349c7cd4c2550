//! Allocation Store Port (Driven Port)
//!
//! Durable key-value storage for the session id allocation table. Reads
//! happen once at startup; every allocate and release writes synchronously.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::{Purpose, SessionId};

/// One allocated session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    /// Purpose the id was allocated for.
    pub purpose: Purpose,
    /// When the id was handed out.
    pub allocated_at: DateTime<Utc>,
}

/// Persisted allocation table: every id currently marked in use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationTable {
    /// Allocated ids.
    pub allocations: BTreeMap<SessionId, AllocationRecord>,
}

impl AllocationTable {
    /// Check whether an id is marked in use.
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.allocations.contains_key(&id)
    }

    /// Number of ids in use.
    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    /// Check whether no id is in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying file or device error.
    #[error("allocation store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored table could not be encoded or decoded.
    #[error("allocation store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// Store rejected the operation.
    #[error("allocation store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for the allocation table.
///
/// Implementations must have persisted the table when `save` returns.
#[cfg_attr(test, mockall::automock)]
pub trait AllocationStore: Send + Sync {
    /// Load the last saved table, or an empty one if nothing was saved.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the table exists but cannot be read.
    fn load(&self) -> Result<AllocationTable, StoreError>;

    /// Replace the saved table.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the table could not be made durable.
    fn save(&self, table: &AllocationTable) -> Result<(), StoreError>;
}
