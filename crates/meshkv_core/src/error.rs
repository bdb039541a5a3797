//! Error types for MeshKV core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in MeshKV core operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Bad caller input. Never retried.
    #[error("invalid arguments: {message}")]
    InvalidArgs {
        /// Description of what was invalid.
        message: String,
    },

    /// The event type was never registered.
    #[error("event type {event_type} is not registered")]
    NotRegistered {
        /// The unknown event type.
        event_type: u32,
    },

    /// The referenced object does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// The event type is already registered.
    #[error("event type {event_type} is already registered")]
    AlreadyRegistered {
        /// The duplicate event type.
        event_type: u32,
    },

    /// A one-shot setting was applied twice.
    #[error("already set: {what}")]
    AlreadySet {
        /// What was already set.
        what: String,
    },

    /// The reference count already reached zero.
    #[error("object already released")]
    AlreadyReleased,

    /// The resource is temporarily unavailable.
    #[error("resource busy: {message}")]
    Busy {
        /// Why the resource is busy.
        message: String,
    },

    /// The operation is not permitted in the current state
    /// (e.g. scheduling on a pool that was never started).
    #[error("operation not permitted: {message}")]
    NotPermit {
        /// Why the operation is not permitted.
        message: String,
    },

    /// The target is being torn down. Callers must stop, never retry.
    #[error("stale: {message}")]
    Stale {
        /// What is being torn down.
        message: String,
    },

    /// The object was killed.
    #[error("object is killed")]
    ObjIsKilled,

    /// Resource allocation failed (thread spawn, queue growth).
    #[error("out of resources: {message}")]
    OutOfMemory {
        /// What could not be allocated.
        message: String,
    },

    /// A programming invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an already set error.
    pub fn already_set(what: impl Into<String>) -> Self {
        Self::AlreadySet { what: what.into() }
    }

    /// Creates a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy {
            message: message.into(),
        }
    }

    /// Creates a not permitted error.
    pub fn not_permit(message: impl Into<String>) -> Self {
        Self::NotPermit {
            message: message.into(),
        }
    }

    /// Creates a stale error.
    pub fn stale(message: impl Into<String>) -> Self {
        Self::Stale {
            message: message.into(),
        }
    }

    /// Creates an out of resources error.
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::OutOfMemory {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if the caller may retry the operation later.
    ///
    /// `NotPermit` and `Stale` mean the target is not started or is
    /// shutting down, so they are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Busy { .. } | CoreError::OutOfMemory { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(CoreError::busy("rekey in progress").is_retryable());
        assert!(!CoreError::not_permit("pool not started").is_retryable());
        assert!(!CoreError::stale("pool stopping").is_retryable());
        assert!(!CoreError::ObjIsKilled.is_retryable());
    }

    #[test]
    fn error_display() {
        let err = CoreError::AlreadyRegistered { event_type: 7 };
        assert_eq!(err.to_string(), "event type 7 is already registered");

        let err = CoreError::invalid_args("max threads must be positive");
        assert!(err.to_string().contains("max threads"));
    }
}
