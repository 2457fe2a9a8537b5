//! Domain Layer - Call authentication policy and listener lifecycle.
//!
//! Pure types with no transport dependencies. The infrastructure layer
//! adapts tonic requests and tokio tasks onto these rules.

/// Token classification and rejection taxonomy.
pub mod auth;

/// Listener lifecycle state machine.
pub mod lifecycle;
