//! Error types for the sync engine.

use meshkv_core::CoreError;
use meshkv_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Error from the core primitives (pool, bus, lifecycle).
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Error from the storage contract.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Bad caller input.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The syncer was not initialized, or was already closed.
    #[error("syncer is not initialized")]
    NotInit,

    /// The request cannot be accepted right now.
    #[error("busy: {0}")]
    Busy(String),

    /// Clock reconciliation is impossible.
    #[error("invalid time: {0}")]
    InvalidTime(String),

    /// Platform access to the storage keys was revoked.
    #[error("storage key revoked")]
    EKeyRevoked,

    /// The target object was killed.
    #[error("object is killed")]
    ObjIsKilled,

    /// Metadata encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Internal invariant violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        if err.is_key_revoked() {
            SyncError::EKeyRevoked
        } else {
            SyncError::Storage(err)
        }
    }
}

impl SyncError {
    /// Creates an invalid-arguments error.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }

    /// Creates a busy error.
    pub fn busy(message: impl Into<String>) -> Self {
        Self::Busy(message.into())
    }

    /// Returns true if platform access to the storage keys was revoked.
    pub fn is_key_revoked(&self) -> bool {
        matches!(self, SyncError::EKeyRevoked)
    }

    /// Returns true if an auto sync may retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Busy(_) | SyncError::Timeout => true,
            SyncError::Core(err) => err.is_retryable(),
            SyncError::Storage(StorageError::Io(_)) => true,
            _ => false,
        }
    }

    /// The error code recorded on a task context for this error.
    pub fn task_error(&self) -> TaskError {
        match self {
            SyncError::EKeyRevoked => TaskError::KeyRevoked,
            SyncError::Busy(_) => TaskError::Busy,
            SyncError::Timeout => TaskError::Timeout,
            _ => TaskError::Other,
        }
    }
}

/// Last error recorded on a sync task, used when promoting statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskError {
    /// No error recorded.
    #[default]
    None,
    /// Storage keys were revoked.
    KeyRevoked,
    /// The remote or local side was busy.
    Busy,
    /// The session timed out.
    Timeout,
    /// Any other failure.
    Other,
}
