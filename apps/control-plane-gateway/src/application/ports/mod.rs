//! Port Interfaces
//!
//! Contracts between the gRPC handlers and whatever owns token state.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TokenValidationPort`: value checks for bootstrap and node tokens.
//!   The transport gate only checks that a token is *present*; handlers
//!   must call through this port before acting on a request.

use chrono::{DateTime, Utc};

/// Enrollment record for one node token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRecord {
    /// When the token was issued.
    pub enrolled_at: DateTime<Utc>,
    /// Last successful validation.
    pub last_seen: DateTime<Utc>,
}

/// Token value checks performed after the transport gate admits a call.
#[cfg_attr(test, mockall::automock)]
pub trait TokenValidationPort: Send + Sync {
    /// Exchange a bootstrap token for a freshly issued node token.
    ///
    /// A non-empty `node_name` that already holds a token has that token
    /// revoked in favour of the new one.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownBootstrapToken`] if the value was never accepted.
    fn enroll(&self, bootstrap_token: &str, node_name: &str) -> Result<String, RegistryError>;

    /// Validate a node token and refresh its last-seen time.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownNodeToken`] if the token was never issued or
    /// has been revoked.
    fn verify_node(&self, node_token: &str) -> Result<NodeRecord, RegistryError>;

    /// Revoke a node token.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownNodeToken`] if the token is not active.
    fn revoke(&self, node_token: &str) -> Result<NodeRecord, RegistryError>;
}

/// Token registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Bootstrap token not in the accepted set.
    #[error("unknown bootstrap token")]
    UnknownBootstrapToken,
    /// Node token not issued or already revoked.
    #[error("unknown node token")]
    UnknownNodeToken,
}
