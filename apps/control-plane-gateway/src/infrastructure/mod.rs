//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete transport, TLS, configuration and observability code built
//! around the domain and application layers.

/// Environment configuration.
pub mod config;

/// gRPC listeners, token gate and controller services.
pub mod grpc;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Mutual-TLS material and credentials.
pub mod tls;
