//! Session Id Registry
//!
//! Hands out session ids from purpose-scoped ranges and keeps the allocation
//! table durable. Every mutation is saved through the [`AllocationStore`]
//! before it returns; a failed save rolls the in-memory table back so memory
//! and storage never disagree.
//!
//! Ids retired after a failed handshake or an eviction sit in a short
//! quarantine before they are handed out again, so a retry always presents a
//! fresh id to the gateway.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::application::ports::{AllocationRecord, AllocationStore, AllocationTable, StoreError};
use crate::domain::session::{IdRange, Purpose, SessionId};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Id ranges and quarantine policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Id range per purpose.
    pub ranges: BTreeMap<Purpose, IdRange>,
    /// How long a retired id is skipped by `allocate`.
    pub quarantine: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let ranges = [
            (Purpose::Interactive, IdRange::new(1, 9)),
            (Purpose::Backfill, IdRange::new(10, 29)),
            (Purpose::Streaming, IdRange::new(30, 39)),
        ]
        .into_iter()
        .filter_map(|(purpose, range)| range.map(|range| (purpose, range)))
        .collect();

        Self {
            ranges,
            quarantine: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Registry failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Every id in the purpose's range is in use.
    #[error("no free session id for {purpose} in range {range}")]
    ExhaustedRange {
        /// Purpose that asked.
        purpose: Purpose,
        /// Its configured range.
        range: IdRange,
    },

    /// No range is configured for the purpose.
    #[error("no session id range configured for {0}")]
    NoRange(Purpose),

    /// The allocation table could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Snapshot
// =============================================================================

/// One allocated id, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationEntry {
    /// The id.
    pub session_id: SessionId,
    /// Purpose it was allocated for.
    pub purpose: Purpose,
    /// When it was allocated.
    pub allocated_at: DateTime<Utc>,
}

/// Registry contents, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    /// Configured ranges.
    pub ranges: BTreeMap<Purpose, String>,
    /// Ids marked in use, ascending.
    pub allocations: Vec<AllocationEntry>,
    /// Ids currently quarantined, ascending.
    pub quarantined: Vec<SessionId>,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    table: AllocationTable,
    quarantine: HashMap<SessionId, Instant>,
}

/// Allocates and tracks session ids.
pub struct SessionIdRegistry {
    config: RegistryConfig,
    store: Arc<dyn AllocationStore>,
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for SessionIdRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIdRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionIdRegistry {
    /// Open the registry, loading the last persisted table.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Store` if the table cannot be loaded.
    pub fn open(
        config: RegistryConfig,
        store: Arc<dyn AllocationStore>,
    ) -> Result<Self, RegistryError> {
        let table = store.load()?;
        if !table.is_empty() {
            tracing::info!(
                allocated = table.len(),
                "Loaded session id allocations from previous run"
            );
        }
        metrics::set_allocated_ids(table.len());

        Ok(Self {
            config,
            store,
            state: Mutex::new(RegistryState {
                table,
                quarantine: HashMap::new(),
            }),
        })
    }

    /// Configured range for a purpose.
    #[must_use]
    pub fn range(&self, purpose: Purpose) -> Option<IdRange> {
        self.config.ranges.get(&purpose).copied()
    }

    /// Allocate the lowest free id in the purpose's range.
    ///
    /// Quarantined ids are skipped while any other id is free; if only
    /// quarantined ids remain, the one retired longest ago is reused.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::ExhaustedRange` when every id is in use, or
    /// `RegistryError::Store` if the allocation could not be persisted.
    pub fn allocate(&self, purpose: Purpose) -> Result<SessionId, RegistryError> {
        let range = self.range(purpose).ok_or(RegistryError::NoRange(purpose))?;
        let now = Instant::now();

        let mut state = self.state.lock();
        let quarantine = self.config.quarantine;
        state
            .quarantine
            .retain(|_, retired_at| now.saturating_duration_since(*retired_at) < quarantine);

        let free: Vec<SessionId> = range.ids().filter(|id| !state.table.contains(*id)).collect();
        let id = free
            .iter()
            .copied()
            .find(|id| !state.quarantine.contains_key(id))
            .or_else(|| {
                free.iter()
                    .copied()
                    .min_by_key(|id| state.quarantine.get(id).copied())
            })
            .ok_or(RegistryError::ExhaustedRange { purpose, range })?;

        state.table.allocations.insert(
            id,
            AllocationRecord {
                purpose,
                allocated_at: Utc::now(),
            },
        );
        if let Err(e) = self.store.save(&state.table) {
            state.table.allocations.remove(&id);
            return Err(e.into());
        }
        state.quarantine.remove(&id);
        metrics::set_allocated_ids(state.table.len());
        drop(state);

        tracing::debug!(session_id = %id, purpose = %purpose, "Session id allocated");
        Ok(id)
    }

    /// Return an id to the free pool.
    ///
    /// Releasing an id that is not allocated is a no-op and returns `false`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Store` if the release could not be persisted;
    /// the id stays allocated.
    pub fn release(&self, id: SessionId) -> Result<bool, RegistryError> {
        self.remove(id, false)
    }

    /// Return an id to the free pool and quarantine it.
    ///
    /// Used after a failed handshake or an eviction so the next attempt
    /// presents a different id.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Store` if the release could not be persisted.
    pub fn retire(&self, id: SessionId) -> Result<bool, RegistryError> {
        self.remove(id, true)
    }

    /// Free every allocated id that is not in `active`.
    ///
    /// Returns the reclaimed ids in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Store` if the result could not be persisted;
    /// nothing is reclaimed in that case.
    pub fn reclaim_stale(
        &self,
        active: &HashSet<SessionId>,
    ) -> Result<Vec<SessionId>, RegistryError> {
        let mut state = self.state.lock();
        let stale: Vec<SessionId> = state
            .table
            .allocations
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        let previous = state.table.clone();
        for id in &stale {
            state.table.allocations.remove(id);
        }
        if let Err(e) = self.store.save(&state.table) {
            state.table = previous;
            return Err(e.into());
        }
        metrics::set_allocated_ids(state.table.len());
        drop(state);

        tracing::info!(reclaimed = ?stale, "Reclaimed stale session ids");
        Ok(stale)
    }

    /// Write the current table again.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Store` if the table could not be persisted.
    pub fn persist(&self) -> Result<(), RegistryError> {
        let state = self.state.lock();
        self.store.save(&state.table)?;
        Ok(())
    }

    /// Check whether an id is marked in use.
    #[must_use]
    pub fn is_allocated(&self, id: SessionId) -> bool {
        self.state.lock().table.contains(id)
    }

    /// Ids marked in use, ascending.
    #[must_use]
    pub fn allocated(&self) -> Vec<SessionId> {
        self.state.lock().table.allocations.keys().copied().collect()
    }

    /// Registry contents for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        let allocations = state
            .table
            .allocations
            .iter()
            .map(|(id, record)| AllocationEntry {
                session_id: *id,
                purpose: record.purpose,
                allocated_at: record.allocated_at,
            })
            .collect();
        let mut quarantined: Vec<SessionId> = state.quarantine.keys().copied().collect();
        drop(state);
        quarantined.sort_unstable();

        RegistrySnapshot {
            ranges: self
                .config
                .ranges
                .iter()
                .map(|(purpose, range)| (*purpose, range.to_string()))
                .collect(),
            allocations,
            quarantined,
        }
    }

    fn remove(&self, id: SessionId, quarantine: bool) -> Result<bool, RegistryError> {
        let mut state = self.state.lock();
        let Some(record) = state.table.allocations.remove(&id) else {
            return Ok(false);
        };
        if let Err(e) = self.store.save(&state.table) {
            state.table.allocations.insert(id, record);
            return Err(e.into());
        }
        if quarantine && !self.config.quarantine.is_zero() {
            state.quarantine.insert(id, Instant::now());
        }
        metrics::set_allocated_ids(state.table.len());
        drop(state);

        tracing::debug!(session_id = %id, quarantine, "Session id released");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::application::ports::MockAllocationStore;
    use crate::infrastructure::store::MemoryAllocationStore;

    fn config(quarantine: Duration) -> RegistryConfig {
        let mut ranges = BTreeMap::new();
        ranges.insert(Purpose::Interactive, IdRange::new(1, 3).unwrap());
        ranges.insert(Purpose::Backfill, IdRange::new(10, 11).unwrap());
        RegistryConfig { ranges, quarantine }
    }

    fn registry() -> (SessionIdRegistry, Arc<MemoryAllocationStore>) {
        let store = Arc::new(MemoryAllocationStore::new());
        let registry = SessionIdRegistry::open(config(Duration::ZERO), store.clone()).unwrap();
        (registry, store)
    }

    #[test]
    fn allocates_lowest_free_id_in_range() {
        let (registry, _) = registry();
        assert_eq!(registry.allocate(Purpose::Backfill).unwrap(), SessionId::new(10));
        assert_eq!(registry.allocate(Purpose::Backfill).unwrap(), SessionId::new(11));
        assert_eq!(
            registry.allocate(Purpose::Interactive).unwrap(),
            SessionId::new(1)
        );

        registry.release(SessionId::new(10)).unwrap();
        assert_eq!(registry.allocate(Purpose::Backfill).unwrap(), SessionId::new(10));
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let (registry, _) = registry();
        registry.allocate(Purpose::Backfill).unwrap();
        registry.allocate(Purpose::Backfill).unwrap();

        let err = registry.allocate(Purpose::Backfill).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::ExhaustedRange {
                purpose: Purpose::Backfill,
                ..
            }
        ));
    }

    #[test]
    fn missing_range_is_an_error() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.allocate(Purpose::Streaming),
            Err(RegistryError::NoRange(Purpose::Streaming))
        ));
    }

    #[test]
    fn double_release_is_a_noop() {
        let (registry, _) = registry();
        let id = registry.allocate(Purpose::Interactive).unwrap();
        assert!(registry.release(id).unwrap());
        assert!(!registry.release(id).unwrap());
        assert!(!registry.release(SessionId::new(999)).unwrap());
    }

    #[test]
    fn mutations_are_persisted_before_returning() {
        let (registry, store) = registry();
        let id = registry.allocate(Purpose::Interactive).unwrap();
        assert!(store.load().unwrap().contains(id));

        registry.release(id).unwrap();
        assert!(!store.load().unwrap().contains(id));
    }

    #[test]
    fn reopen_restores_allocations_and_reclaim_frees_dead_ids() {
        let store = Arc::new(MemoryAllocationStore::new());
        let first = SessionIdRegistry::open(config(Duration::ZERO), store.clone()).unwrap();
        let a = first.allocate(Purpose::Interactive).unwrap();
        let b = first.allocate(Purpose::Interactive).unwrap();
        drop(first);

        let second = SessionIdRegistry::open(config(Duration::ZERO), store.clone()).unwrap();
        assert_eq!(second.allocated(), vec![a, b]);

        let active: HashSet<SessionId> = [b].into_iter().collect();
        assert_eq!(second.reclaim_stale(&active).unwrap(), vec![a]);
        assert_eq!(second.allocated(), vec![b]);

        // The live id is never handed out again; the reclaimed one is.
        let next = second.allocate(Purpose::Interactive).unwrap();
        assert_eq!(next, a);
        assert!(store.load().unwrap().contains(b));
    }

    #[test]
    fn failed_save_rolls_back_allocation() {
        let mut store = MockAllocationStore::new();
        store.expect_load().returning(|| Ok(AllocationTable::default()));
        store
            .expect_save()
            .returning(|_| Err(StoreError::Unavailable("disk full".to_string())));

        let registry = SessionIdRegistry::open(config(Duration::ZERO), Arc::new(store)).unwrap();
        let err = registry.allocate(Purpose::Interactive).unwrap_err();

        assert!(matches!(err, RegistryError::Store(StoreError::Unavailable(_))));
        assert!(registry.allocated().is_empty());
    }

    #[test]
    fn failed_save_keeps_released_id_allocated() {
        let mut store = MockAllocationStore::new();
        store.expect_load().returning(|| Ok(AllocationTable::default()));
        let mut saves = 0;
        store.expect_save().returning(move |_| {
            saves += 1;
            if saves == 1 {
                Ok(())
            } else {
                Err(StoreError::Unavailable("read-only".to_string()))
            }
        });

        let registry = SessionIdRegistry::open(config(Duration::ZERO), Arc::new(store)).unwrap();
        let id = registry.allocate(Purpose::Interactive).unwrap();

        assert!(registry.release(id).is_err());
        assert!(registry.is_allocated(id));
    }

    #[tokio::test(start_paused = true)]
    async fn retired_ids_are_quarantined() {
        let store = Arc::new(MemoryAllocationStore::new());
        let registry =
            SessionIdRegistry::open(config(Duration::from_secs(30)), store).unwrap();

        let first = registry.allocate(Purpose::Interactive).unwrap();
        assert_eq!(first, SessionId::new(1));
        registry.retire(first).unwrap();

        let second = registry.allocate(Purpose::Interactive).unwrap();
        assert_eq!(second, SessionId::new(2));
        assert_eq!(registry.snapshot().quarantined, vec![first]);

        tokio::time::advance(Duration::from_secs(31)).await;
        registry.release(second).unwrap();
        assert_eq!(registry.allocate(Purpose::Interactive).unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn quarantined_id_is_reused_when_nothing_else_is_free() {
        let store = Arc::new(MemoryAllocationStore::new());
        let registry =
            SessionIdRegistry::open(config(Duration::from_secs(30)), store).unwrap();

        let a = registry.allocate(Purpose::Backfill).unwrap();
        let b = registry.allocate(Purpose::Backfill).unwrap();
        registry.retire(a).unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        registry.retire(b).unwrap();

        assert_eq!(registry.allocate(Purpose::Backfill).unwrap(), a);
    }

    #[test]
    fn snapshot_lists_ranges_and_allocations() {
        let (registry, _) = registry();
        registry.allocate(Purpose::Backfill).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.ranges[&Purpose::Backfill], "10..=11");
        assert_eq!(snapshot.allocations.len(), 1);
        assert_eq!(snapshot.allocations[0].purpose, Purpose::Backfill);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(Purpose),
        Release(u32),
        Retire(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop_oneof![Just(Purpose::Interactive), Just(Purpose::Backfill)].prop_map(Op::Allocate),
            (0u32..12).prop_map(Op::Release),
            (0u32..12).prop_map(Op::Retire),
        ]
    }

    proptest! {
        #[test]
        fn no_id_is_held_twice(ops in prop::collection::vec(op(), 1..64)) {
            let (registry, _) = registry();
            let mut live: HashSet<SessionId> = HashSet::new();

            for op in ops {
                match op {
                    Op::Allocate(purpose) => {
                        if let Ok(id) = registry.allocate(purpose) {
                            prop_assert!(live.insert(id), "id {} handed out twice", id);
                            prop_assert!(registry.range(purpose).unwrap().contains(id));
                        }
                    }
                    Op::Release(raw) => {
                        let id = SessionId::new(raw);
                        let released = registry.release(id).unwrap();
                        prop_assert_eq!(released, live.remove(&id));
                    }
                    Op::Retire(raw) => {
                        let id = SessionId::new(raw);
                        let released = registry.retire(id).unwrap();
                        prop_assert_eq!(released, live.remove(&id));
                    }
                }
            }

            let mut expected: Vec<SessionId> = live.into_iter().collect();
            expected.sort_unstable();
            prop_assert_eq!(registry.allocated(), expected);
        }
    }
}
