//! Application Layer - Ports and token bookkeeping.
//!
//! Holds the downstream half of authentication: the transport gate admits
//! calls that carry a token, and the services here decide whether that
//! token is actually valid.

/// Port definitions for token validation.
pub mod ports;

/// Token registry service.
pub mod services;
