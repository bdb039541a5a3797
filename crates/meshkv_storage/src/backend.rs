//! Storage contract definition.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};

/// Logical timestamp in 100 ns units.
pub type Timestamp = u64;

/// Which key space a data record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataKind {
    /// Device-local data that never leaves this device.
    Local,
    /// Data that participates in synchronization.
    Synced,
}

/// The storage contract the sync core consumes.
///
/// Implementations are **opaque byte stores**. The sync core owns the
/// interpretation of every key and value it writes.
///
/// # Invariants
///
/// - `get_*` returns exactly the bytes previously stored under that key
/// - kv writes made between `begin_transaction` and `commit` become
///   visible atomically; `rollback` discards them
/// - metadata writes are never part of a transaction
/// - `set_max_timestamp` never lowers the stored maximum
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryStorage`] - For testing
/// - [`super::FileStorage`] - For persistent storage
pub trait KvStorage: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable or access was revoked.
    fn get_kv_data(&self, kind: DataKind, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`.
    ///
    /// Inside a transaction the write is staged until `commit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn put_kv_data(&self, kind: DataKind, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete cannot be made durable.
    fn delete_kv_data(&self, kind: DataKind, key: &[u8]) -> StorageResult<()>;

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::TransactionActive`] if one is already open.
    fn begin_transaction(&self) -> StorageResult<()>;

    /// Applies every staged write atomically.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::NoTransaction`] if none is open.
    fn commit(&self) -> StorageResult<()>;

    /// Discards every staged write.
    ///
    /// # Errors
    ///
    /// Returns [`super::StorageError::NoTransaction`] if none is open.
    fn rollback(&self) -> StorageResult<()>;

    /// Returns the largest timestamp of any stored data item.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn get_max_timestamp(&self) -> StorageResult<Timestamp>;

    /// Raises the stored maximum timestamp to `timestamp` if it is larger.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn set_max_timestamp(&self, timestamp: Timestamp) -> StorageResult<()>;

    /// Reads an opaque metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn get_meta_data(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Writes an opaque metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Removes the metadata values stored under `keys`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete cannot be made durable.
    fn delete_meta_data(&self, keys: &[Vec<u8>]) -> StorageResult<()>;

    /// Lists every metadata key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreadable.
    fn get_all_meta_keys(&self) -> StorageResult<Vec<Vec<u8>>>;
}
