//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SessionIdRegistry`: Allocates and persists gateway session ids
//! - `HandshakeCoordinator`: Drives new sessions to `Ready`
//! - `PaceManager`: Per-category request budgets and error classification
//! - `ConnectionPool`: Pooled sessions lent out as scoped leases
//! - `HealthMonitor`: Probes pooled sessions and evicts dead ones

pub mod backoff;
pub mod handshake;
pub mod monitor;
pub mod pacing;
pub mod pool;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{Backoff, BackoffConfig};
pub use handshake::{
    EstablishError, Established, HandshakeConfig, HandshakeCoordinator, SessionIdSource,
};
pub use monitor::{CheckReport, HealthMonitor, MonitorConfig, SystemClock, WallClock};
pub use pacing::{
    Admission, Outcome, PaceBudget, PaceManager, PaceSnapshot, PacingConfig, Permit, WaitHint,
    WaitReason,
};
pub use pool::{
    ConnectionId, ConnectionInfo, ConnectionPool, DispatchError, EvictionReason, EvictionRecord,
    Lease, PoolConfig, PoolError, PoolStats, ProbeTarget, PurposeStats, ShutdownReport,
    StatusReport,
};
pub use registry::{
    AllocationEntry, RegistryConfig, RegistryError, RegistrySnapshot, SessionIdRegistry,
};
