//! Listener Lifecycle
//!
//! State machine for one gRPC listener:
//!
//! ```text
//! Created ──► Starting ──► Serving ──► Draining ──► Stopped
//!                │            │                        ▲
//!                └────────────┴────────────────────────┘
//! ```
//!
//! `Starting → Stopped` happens when credential construction or bind fails.
//! `Serving → Stopped` happens only when the transport fails on its own;
//! an explicit stop always passes through `Draining`. `Stopped` is terminal.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Constructed, not yet started.
    Created,
    /// Loading credentials and binding.
    Starting,
    /// Accepting connections.
    Serving,
    /// No new calls; in-flight calls finishing.
    Draining,
    /// Listener released. Terminal.
    Stopped,
}

impl ServerState {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Starting)
                | (Self::Starting, Self::Serving | Self::Stopped)
                | (Self::Serving, Self::Draining | Self::Stopped)
                | (Self::Draining, Self::Stopped)
        )
    }

    /// Apply a transition.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when `next` is not reachable from `self`.
    pub const fn transition(self, next: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// True once the listener can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Numeric encoding for the state gauge.
    #[must_use]
    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Starting => 1,
            Self::Serving => 2,
            Self::Draining => 3,
            Self::Stopped => 4,
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid listener transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State before the attempted transition.
    pub from: ServerState,
    /// Requested state.
    pub to: ServerState,
}

// =============================================================================
// Tests
// =============================================================================
