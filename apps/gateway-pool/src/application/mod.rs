//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the pool services and the port interfaces they use
//! to reach the gateway socket and the durable allocation store.

/// Port interfaces for external systems (gateway transport, allocation store).
pub mod ports;

/// Registry, handshake, pacing, pool and health monitor services.
pub mod services;
