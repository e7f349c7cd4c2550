#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Gateway Pool - Session Pool and Request Pacing
//!
//! Sits in front of a stateful brokerage/market-data gateway that accepts a
//! small number of concurrent sessions, each identified by a numeric session
//! id, and that punishes request bursts with pacing violations. The crate
//! owns those sessions: it allocates ids, drives each new session through the
//! multi-stage handshake, lends ready sessions out as scoped leases, paces
//! requests per category, and evicts sessions that stop answering.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and state machines
//!   - `session`: Session ids, purposes and id ranges
//!   - `connection`: Connection states and the handshake machine
//!   - `pacing`: Request categories and error classification
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport and allocation store interfaces
//!   - `services`: Registry, handshake, pacing, pool, health monitor
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `transport`: JSON-lines TCP binding
//!   - `store`: File and in-memory allocation stores
//!   - `config`: Environment configuration
//!   - `status`: Health, status and metrics HTTP endpoint
//!
//! # Request Flow
//!
//! ```text
//! caller ── acquire(purpose) ──► ConnectionPool ──► Lease
//!                                     │               │
//!                     HandshakeCoordinator      send(category, payload)
//!                                     │               │
//!                             SessionIdRegistry   PaceManager ── admit
//!                                                     │
//!                                              worker task ──► gateway
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Session, handshake and pacing types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{ConnectionState, ConnectionStatus, HandshakeTimings, TransportSignal};
pub use domain::pacing::{ClassificationTable, ErrorClass, GatewayError, RequestCategory};
pub use domain::session::{IdRange, Purpose, SessionId};

// Ports
pub use application::ports::{
    AllocationRecord, AllocationStore, AllocationTable, GatewayEndpoint, GatewayRequest,
    GatewayResponse, SendError, SessionHandle, Transport, TransportError, TransportSession,
};

// Services
pub use application::services::{
    BackoffConfig, CheckReport, ConnectionId, ConnectionPool, DispatchError, EvictionReason,
    HandshakeConfig, HandshakeCoordinator, HealthMonitor, Lease, MonitorConfig, PaceBudget,
    PaceManager, PacingConfig, PoolConfig, PoolError, PoolStats, RegistryConfig, RegistryError,
    SessionIdRegistry, ShutdownReport, StatusReport, WallClock,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ServerSettings, Settings, StoreSettings};

// Status server
pub use infrastructure::status::{StatusServer, StatusServerError, StatusServerState, router};

// Adapters
pub use infrastructure::store::{FileAllocationStore, MemoryAllocationStore};
pub use infrastructure::transport::JsonLinesTransport;

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
