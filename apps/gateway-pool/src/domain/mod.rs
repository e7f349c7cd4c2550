//! Domain Layer - Core session, handshake and pacing types.
//!
//! Pure types with no I/O. Everything here is driven by the application
//! services and can be exercised without a runtime.

/// Session identifiers, purposes and id ranges.
pub mod session;

/// Connection lifecycle and the handshake state machine.
pub mod connection;

/// Request categories and gateway error classification.
pub mod pacing;
