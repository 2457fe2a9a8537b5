#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Control-Plane Gateway - Secure gRPC Front-Door
//!
//! Mutually-authenticated gRPC listeners for the node-control plane. Nodes
//! enroll on the bootstrap listener with a bootstrap token and receive a
//! node token; every later call on the peer listener carries that node
//! token.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure policy
//!   - `auth`: Method classification and token requirements
//!   - `lifecycle`: Listener state machine
//!
//! - **Application**: Token validation
//!   - `ports`: `TokenValidationPort`
//!   - `services`: In-memory `TokenRegistry`
//!
//! - **Infrastructure**: Adapters
//!   - `tls`: mTLS material loading and server credentials
//!   - `grpc`: Token gate, listener lifecycle, instance, controller services
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!   - `metrics` / `telemetry`: Prometheus and OpenTelemetry
//!
//! # Call Path
//!
//! ```text
//! node ──TLS(client cert)──► listener ──► TokenGate ──► handler ──► TokenRegistry
//!                            (mTLS)       (presence)              (value)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Authentication policy and lifecycle rules.
pub mod domain;

/// Application layer - Ports and token bookkeeping.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::auth::{
    Admission, AuthRejection, CredentialKind, EnrollmentPolicy, MethodClass, PresentedCredential,
};
pub use domain::lifecycle::ServerState;

// Application
pub use application::ports::{NodeRecord, RegistryError, TokenValidationPort};
pub use application::services::TokenRegistry;

// Infrastructure config
pub use infrastructure::config::{ConfigError, GatewayConfig, GatewaySettings, ServerEndpoint};

// TLS
pub use infrastructure::tls::{MtlsCredential, TlsError, TlsMaterial};

// gRPC (for integration tests)
pub use infrastructure::grpc::{
    AdvertisedEndpoint, GatewayInstance, GatewayServer, InstanceHandle, ListenerSettings,
    NodeControlService, ServerError, ServerHandle, ServiceSet, TokenInterceptor,
    proto::controller::v1 as proto,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
