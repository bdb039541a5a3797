//! In-memory store for testing.

use crate::backend::{DataKind, KvStorage, Timestamp};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A staged kv write inside an open transaction.
#[derive(Debug, Clone)]
enum StagedWrite {
    Put(DataKind, Vec<u8>, Vec<u8>),
    Delete(DataKind, Vec<u8>),
}

/// The complete logical content of a store.
///
/// Shared by [`MemoryStorage`] and [`super::FileStorage`]; the latter
/// persists it as a CBOR snapshot.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreState {
    kv: BTreeMap<(DataKind, Vec<u8>), Vec<u8>>,
    meta: BTreeMap<Vec<u8>, Vec<u8>>,
    max_timestamp: Timestamp,
    #[serde(skip)]
    staged: Option<Vec<StagedWrite>>,
}

impl StoreState {
    pub(crate) fn get_kv(&self, kind: DataKind, key: &[u8]) -> Option<Vec<u8>> {
        // Read-your-writes inside an open transaction.
        if let Some(staged) = &self.staged {
            for write in staged.iter().rev() {
                match write {
                    StagedWrite::Put(k, stored_key, value) if *k == kind && stored_key == key => {
                        return Some(value.clone());
                    }
                    StagedWrite::Delete(k, stored_key) if *k == kind && stored_key == key => {
                        return None;
                    }
                    _ => {}
                }
            }
        }
        self.kv.get(&(kind, key.to_vec())).cloned()
    }

    /// Applies a kv write. Returns true if the write reached the
    /// committed state (and therefore needs persisting).
    pub(crate) fn put_kv(&mut self, kind: DataKind, key: &[u8], value: &[u8]) -> bool {
        match &mut self.staged {
            Some(staged) => {
                staged.push(StagedWrite::Put(kind, key.to_vec(), value.to_vec()));
                false
            }
            None => {
                self.kv.insert((kind, key.to_vec()), value.to_vec());
                true
            }
        }
    }

    pub(crate) fn delete_kv(&mut self, kind: DataKind, key: &[u8]) -> bool {
        match &mut self.staged {
            Some(staged) => {
                staged.push(StagedWrite::Delete(kind, key.to_vec()));
                false
            }
            None => {
                self.kv.remove(&(kind, key.to_vec()));
                true
            }
        }
    }

    pub(crate) fn begin(&mut self) -> StorageResult<()> {
        if self.staged.is_some() {
            return Err(StorageError::TransactionActive);
        }
        self.staged = Some(Vec::new());
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> StorageResult<()> {
        let staged = self.staged.take().ok_or(StorageError::NoTransaction)?;
        for write in staged {
            match write {
                StagedWrite::Put(kind, key, value) => {
                    self.kv.insert((kind, key), value);
                }
                StagedWrite::Delete(kind, key) => {
                    self.kv.remove(&(kind, key));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn rollback(&mut self) -> StorageResult<()> {
        self.staged
            .take()
            .map(|_| ())
            .ok_or(StorageError::NoTransaction)
    }

    pub(crate) fn max_timestamp(&self) -> Timestamp {
        self.max_timestamp
    }

    pub(crate) fn raise_max_timestamp(&mut self, timestamp: Timestamp) -> bool {
        if timestamp > self.max_timestamp {
            self.max_timestamp = timestamp;
            return true;
        }
        false
    }

    pub(crate) fn get_meta(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.meta.get(key).cloned()
    }

    pub(crate) fn put_meta(&mut self, key: &[u8], value: &[u8]) {
        self.meta.insert(key.to_vec(), value.to_vec());
    }

    pub(crate) fn delete_meta(&mut self, keys: &[Vec<u8>]) {
        for key in keys {
            self.meta.remove(key);
        }
    }

    pub(crate) fn meta_keys(&self) -> Vec<Vec<u8>> {
        self.meta.keys().cloned().collect()
    }
}

/// An in-memory store.
///
/// This store keeps all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral databases that don't need persistence
///
/// Sharing one `Arc<MemoryStorage>` between two sync cores simulates a
/// process restart over the same persisted state.
///
/// # Example
///
/// ```rust
/// use meshkv_storage::{KvStorage, MemoryStorage};
///
/// let storage = MemoryStorage::new();
/// storage.put_meta_data(b"k", b"v").unwrap();
/// assert_eq!(storage.get_all_meta_keys().unwrap(), vec![b"k".to_vec()]);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<StoreState>,
    revoked: AtomicBool,
}

impl MemoryStorage {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose max timestamp is already `timestamp`.
    ///
    /// Useful for testing clock reconciliation.
    #[must_use]
    pub fn with_max_timestamp(timestamp: Timestamp) -> Self {
        let storage = Self::default();
        storage.state.write().raise_max_timestamp(timestamp);
        storage
    }

    /// Simulates the platform revoking (or restoring) access to the
    /// encrypted store. While revoked every call fails with
    /// [`StorageError::KeyRevoked`].
    pub fn set_access_revoked(&self, revoked: bool) {
        self.revoked.store(revoked, Ordering::SeqCst);
    }

    /// Returns true while a transaction is open.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.state.read().staged.is_some()
    }

    fn check_access(&self) -> StorageResult<()> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(StorageError::KeyRevoked);
        }
        Ok(())
    }
}

impl KvStorage for MemoryStorage {
    fn get_kv_data(&self, kind: DataKind, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.check_access()?;
        Ok(self.state.read().get_kv(kind, key))
    }

    fn put_kv_data(&self, kind: DataKind, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.check_access()?;
        self.state.write().put_kv(kind, key, value);
        Ok(())
    }

    fn delete_kv_data(&self, kind: DataKind, key: &[u8]) -> StorageResult<()> {
        self.check_access()?;
        self.state.write().delete_kv(kind, key);
        Ok(())
    }

    fn begin_transaction(&self) -> StorageResult<()> {
        self.check_access()?;
        self.state.write().begin()
    }

    fn commit(&self) -> StorageResult<()> {
        self.check_access()?;
        self.state.write().commit()
    }

    fn rollback(&self) -> StorageResult<()> {
        // Rollback must succeed even after revocation so callers can unwind.
        self.state.write().rollback()
    }

    fn get_max_timestamp(&self) -> StorageResult<Timestamp> {
        self.check_access()?;
        Ok(self.state.read().max_timestamp())
    }

    fn set_max_timestamp(&self, timestamp: Timestamp) -> StorageResult<()> {
        self.check_access()?;
        self.state.write().raise_max_timestamp(timestamp);
        Ok(())
    }

    fn get_meta_data(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        self.check_access()?;
        Ok(self.state.read().get_meta(key))
    }

    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        self.check_access()?;
        self.state.write().put_meta(key, value);
        Ok(())
    }

    fn delete_meta_data(&self, keys: &[Vec<u8>]) -> StorageResult<()> {
        self.check_access()?;
        self.state.write().delete_meta(keys);
        Ok(())
    }

    fn get_all_meta_keys(&self) -> StorageResult<Vec<Vec<u8>>> {
        self.check_access()?;
        Ok(self.state.read().meta_keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn memory_new_is_empty() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_max_timestamp().unwrap(), 0);
        assert!(storage.get_all_meta_keys().unwrap().is_empty());
        assert!(storage.get_kv_data(DataKind::Local, b"k").unwrap().is_none());
    }

    #[test]
    fn kind_separates_key_spaces() {
        let storage = MemoryStorage::new();
        storage.put_kv_data(DataKind::Local, b"k", b"local").unwrap();
        storage.put_kv_data(DataKind::Synced, b"k", b"synced").unwrap();

        assert_eq!(
            storage.get_kv_data(DataKind::Local, b"k").unwrap(),
            Some(b"local".to_vec())
        );
        assert_eq!(
            storage.get_kv_data(DataKind::Synced, b"k").unwrap(),
            Some(b"synced".to_vec())
        );
    }

    #[test]
    fn transaction_commit_applies_staged_writes() {
        let storage = MemoryStorage::new();
        storage.put_kv_data(DataKind::Synced, b"gone", b"x").unwrap();

        storage.begin_transaction().unwrap();
        storage.put_kv_data(DataKind::Synced, b"a", b"1").unwrap();
        storage.delete_kv_data(DataKind::Synced, b"gone").unwrap();

        // Visible to the writer before commit
        assert_eq!(
            storage.get_kv_data(DataKind::Synced, b"a").unwrap(),
            Some(b"1".to_vec())
        );
        assert!(storage.get_kv_data(DataKind::Synced, b"gone").unwrap().is_none());

        storage.commit().unwrap();
        assert!(!storage.in_transaction());
        assert_eq!(
            storage.get_kv_data(DataKind::Synced, b"a").unwrap(),
            Some(b"1".to_vec())
        );
        assert!(storage.get_kv_data(DataKind::Synced, b"gone").unwrap().is_none());
    }

    #[test]
    fn transaction_rollback_discards_staged_writes() {
        let storage = MemoryStorage::new();
        storage.begin_transaction().unwrap();
        storage.put_kv_data(DataKind::Synced, b"a", b"1").unwrap();
        storage.rollback().unwrap();

        assert!(storage.get_kv_data(DataKind::Synced, b"a").unwrap().is_none());
    }

    #[test]
    fn nested_begin_fails() {
        let storage = MemoryStorage::new();
        storage.begin_transaction().unwrap();
        assert!(matches!(
            storage.begin_transaction(),
            Err(StorageError::TransactionActive)
        ));
    }

    #[test]
    fn commit_without_transaction_fails() {
        let storage = MemoryStorage::new();
        assert!(matches!(storage.commit(), Err(StorageError::NoTransaction)));
        assert!(matches!(storage.rollback(), Err(StorageError::NoTransaction)));
    }

    #[test]
    fn max_timestamp_never_lowers() {
        let storage = MemoryStorage::with_max_timestamp(100);
        storage.set_max_timestamp(50).unwrap();
        assert_eq!(storage.get_max_timestamp().unwrap(), 100);

        storage.set_max_timestamp(150).unwrap();
        assert_eq!(storage.get_max_timestamp().unwrap(), 150);
    }

    #[test]
    fn meta_data_roundtrip_and_delete() {
        let storage = MemoryStorage::new();
        storage.put_meta_data(b"a", b"1").unwrap();
        storage.put_meta_data(b"b", b"2").unwrap();

        assert_eq!(storage.get_meta_data(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.get_all_meta_keys().unwrap().len(), 2);

        storage.delete_meta_data(&[b"a".to_vec()]).unwrap();
        assert!(storage.get_meta_data(b"a").unwrap().is_none());
        assert_eq!(storage.get_all_meta_keys().unwrap(), vec![b"b".to_vec()]);
    }

    #[test]
    fn revoked_access_fails_every_read() {
        let storage = MemoryStorage::new();
        storage.put_meta_data(b"a", b"1").unwrap();
        storage.set_access_revoked(true);

        assert!(matches!(
            storage.get_meta_data(b"a"),
            Err(StorageError::KeyRevoked)
        ));
        assert!(storage.get_max_timestamp().unwrap_err().is_key_revoked());

        storage.set_access_revoked(false);
        assert_eq!(storage.get_meta_data(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, u8),
        Delete(u8),
    }

    fn any_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..8, any::<u8>()).prop_map(|(k, v)| Op::Put(k, v)),
            (0u8..8).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn committed_transaction_matches_direct_writes(
            ops in prop::collection::vec(any_op(), 0..32),
            commit in any::<bool>(),
        ) {
            let storage = MemoryStorage::new();
            let mut model: BTreeMap<u8, u8> = BTreeMap::new();
            storage.begin_transaction().unwrap();
            for op in &ops {
                match op {
                    Op::Put(k, v) => {
                        storage.put_kv_data(DataKind::Local, &[*k], &[*v]).unwrap();
                        model.insert(*k, *v);
                    }
                    Op::Delete(k) => {
                        storage.delete_kv_data(DataKind::Local, &[*k]).unwrap();
                        model.remove(k);
                    }
                }
            }
            if commit {
                storage.commit().unwrap();
            } else {
                storage.rollback().unwrap();
                model.clear();
            }

            for k in 0u8..8 {
                let expected = model.get(&k).map(|v| vec![*v]);
                prop_assert_eq!(storage.get_kv_data(DataKind::Local, &[k]).unwrap(), expected);
            }
        }
    }
}
