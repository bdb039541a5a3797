//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The snapshot could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The store file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store's exclusive lock.
    #[error("storage locked: another process has exclusive access")]
    Locked,

    /// The platform revoked access to the encrypted store.
    #[error("access to the key store was revoked")]
    KeyRevoked,

    /// `begin_transaction` was called while a transaction is open.
    #[error("a transaction is already active")]
    TransactionActive,

    /// `commit` or `rollback` was called without an open transaction.
    #[error("no active transaction")]
    NoTransaction,
}

impl StorageError {
    /// Returns true if the platform revoked access to the store.
    pub fn is_key_revoked(&self) -> bool {
        matches!(self, StorageError::KeyRevoked)
    }
}
