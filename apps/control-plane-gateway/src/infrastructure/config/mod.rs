//! Configuration Module
//!
//! Environment-driven configuration for the gateway listeners.

mod settings;

pub use settings::{ConfigError, GatewayConfig, GatewaySettings, ServerEndpoint};
