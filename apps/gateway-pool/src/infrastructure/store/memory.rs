//! In-memory allocation store.

use parking_lot::RwLock;

use crate::application::ports::{AllocationStore, AllocationTable, StoreError};

/// Allocation store that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryAllocationStore {
    table: RwLock<AllocationTable>,
    saves: RwLock<usize>,
}

impl MemoryAllocationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with a table, as if left by a previous run.
    #[must_use]
    pub fn with_table(table: AllocationTable) -> Self {
        Self {
            table: RwLock::new(table),
            saves: RwLock::new(0),
        }
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> usize {
        *self.saves.read()
    }
}

impl AllocationStore for MemoryAllocationStore {
    fn load(&self) -> Result<AllocationTable, StoreError> {
        Ok(self.table.read().clone())
    }

    fn save(&self, table: &AllocationTable) -> Result<(), StoreError> {
        *self.table.write() = table.clone();
        *self.saves.write() += 1;
        Ok(())
    }
}
