//! Error types for the constrained solver.
//!
//! Configuration problems (`NotInitialized`, `InvalidBody`, ...) are fatal for
//! the caller. Numerical trouble is reported separately: degenerate solves only
//! show up in [`Diagnostics`](crate::simulation::snapshot::Diagnostics), and
//! divergence surfaces as [`SimError::Diverged`] after the offending step has
//! been rolled back.

use thiserror::Error;

use crate::simulation::states::ObjectHandle;

/// Errors that can occur while building or running a physics system.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SimError {
    /// The system was started or stepped before `initialize`.
    #[error("physics system not initialized")]
    NotInitialized,

    /// `initialize` (or a registration call) on an already sealed system.
    #[error("physics system already initialized")]
    AlreadyInitialized,

    /// Body registration rejected.
    #[error("invalid body {handle}: {reason}")]
    InvalidBody {
        /// The offending external object.
        handle: ObjectHandle,
        /// What is wrong with it.
        reason: String,
    },

    /// A constraint refers to an object that was never registered as a body.
    #[error("constraint references unregistered object {handle}")]
    UnknownBody {
        /// The missing object.
        handle: ObjectHandle,
    },

    /// Two bodies were registered for the same external object.
    #[error("object {handle} registered twice")]
    DuplicateBody {
        /// The duplicated object.
        handle: ObjectHandle,
    },

    /// Invalid driver or solver configuration.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// State became non-finite during integration.
    #[error("simulation diverged: {reason}")]
    Diverged {
        /// Description of what went wrong.
        reason: String,
    },

    /// The producer thread panicked before it could be joined.
    #[error("simulation thread panicked")]
    ProducerPanicked,
}

impl SimError {
    /// Create a diverged error.
    #[must_use]
    pub fn diverged(reason: impl Into<String>) -> Self {
        Self::Diverged {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an invalid body error.
    #[must_use]
    pub fn invalid_body(handle: ObjectHandle, reason: impl Into<String>) -> Self {
        Self::InvalidBody {
            handle,
            reason: reason.into(),
        }
    }

    /// Check if this is a divergence error.
    #[must_use]
    pub fn is_diverged(&self) -> bool {
        matches!(self, Self::Diverged { .. })
    }

    /// Configuration errors cannot be recovered from by stepping further.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized
                | Self::AlreadyInitialized
                | Self::InvalidBody { .. }
                | Self::UnknownBody { .. }
                | Self::DuplicateBody { .. }
                | Self::InvalidConfig { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_mentions_handle() {
        let err = SimError::UnknownBody {
            handle: ObjectHandle(42),
        };
        assert!(err.to_string().contains("42"));

        let err = SimError::diverged("NaN in velocity");
        assert!(err.to_string().contains("NaN"));
    }

    #[test]
    fn error_predicates() {
        assert!(SimError::diverged("x").is_diverged());
        assert!(!SimError::diverged("x").is_config_error());
        assert!(SimError::NotInitialized.is_config_error());
        assert!(SimError::invalid_config("bad").is_config_error());
    }
}
