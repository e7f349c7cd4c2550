//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus process wiring (configuration,
//! telemetry, the status endpoint).

/// Configuration loading and validation.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Status, health check and metrics HTTP endpoint.
pub mod status;

/// Allocation table stores (JSON file, in-memory).
pub mod store;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// JSON-lines TCP binding for the gateway protocol.
pub mod transport;
