//! Configuration Module
//!
//! Environment-driven configuration for the gateway pool.

mod settings;

pub use settings::{ConfigError, ServerSettings, Settings, StoreSettings};
