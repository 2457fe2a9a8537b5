//! Application Services
//!
//! - `TokenRegistry`: in-memory bootstrap/node token bookkeeping.

mod token_registry;

pub use token_registry::TokenRegistry;
