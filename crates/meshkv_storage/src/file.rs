//! Snapshot-file store for persistent storage.

use crate::backend::{DataKind, KvStorage, Timestamp};
use crate::error::{StorageError, StorageResult};
use crate::memory::StoreState;
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

/// A file-backed store.
///
/// The whole logical state is kept in memory and rewritten as a CBOR
/// snapshot after every durable mutation (write to a temporary file,
/// `sync_all`, then rename over the snapshot). Data survives process
/// restarts.
///
/// # Locking
///
/// An exclusive advisory lock on `<path>.lock` is held for the lifetime
/// of the store. A second `open` of the same path fails with
/// [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use meshkv_storage::{FileStorage, KvStorage};
/// use std::path::Path;
///
/// let storage = FileStorage::open(Path::new("meta.snapshot")).unwrap();
/// storage.put_meta_data(b"key", b"value").unwrap();
/// ```
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    state: RwLock<StoreState>,
    _lock_file: File,
}

impl FileStorage {
    /// Opens or creates a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be taken, or the existing
    /// snapshot cannot be read or decoded.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path(path))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StorageError::Locked)?;

        let state = if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            ciborium::from_reader(reader).map_err(|e| StorageError::Corrupted(e.to_string()))?
        } else {
            StoreState::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
            _lock_file: lock_file,
        })
    }

    /// Opens or creates a store, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the store cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path to the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, state: &StoreState) -> StorageResult<()> {
        let mut encoded = Vec::new();
        ciborium::into_writer(state, &mut encoded)
            .map_err(|e| StorageError::Codec(e.to_string()))?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&encoded)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

impl KvStorage for FileStorage {
    fn get_kv_data(&self, kind: DataKind, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.state.read().get_kv(kind, key))
    }

    fn put_kv_data(&self, kind: DataKind, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut state = self.state.write();
        if state.put_kv(kind, key, value) {
            self.persist(&state)?;
        }
        Ok(())
    }

    fn delete_kv_data(&self, kind: DataKind, key: &[u8]) -> StorageResult<()> {
        let mut state = self.state.write();
        if state.delete_kv(kind, key) {
            self.persist(&state)?;
        }
        Ok(())
    }

    fn begin_transaction(&self) -> StorageResult<()> {
        self.state.write().begin()
    }

    fn commit(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.commit()?;
        self.persist(&state)
    }

    fn rollback(&self) -> StorageResult<()> {
        self.state.write().rollback()
    }

    fn get_max_timestamp(&self) -> StorageResult<Timestamp> {
        Ok(self.state.read().max_timestamp())
    }

    fn set_max_timestamp(&self, timestamp: Timestamp) -> StorageResult<()> {
        let mut state = self.state.write();
        if state.raise_max_timestamp(timestamp) {
            self.persist(&state)?;
        }
        Ok(())
    }

    fn get_meta_data(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.state.read().get_meta(key))
    }

    fn put_meta_data(&self, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut state = self.state.write();
        state.put_meta(key, value);
        self.persist(&state)
    }

    fn delete_meta_data(&self, keys: &[Vec<u8>]) -> StorageResult<()> {
        let mut state = self.state.write();
        state.delete_meta(keys);
        self.persist(&state)
    }

    fn get_all_meta_keys(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.state.read().meta_keys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.snapshot");

        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.get_max_timestamp().unwrap(), 0);
        assert_eq!(storage.path(), path.as_path());
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("persist.snapshot");

        {
            let storage = FileStorage::open(&path).unwrap();
            storage.put_meta_data(b"meta", b"persistent").unwrap();
            storage
                .put_kv_data(DataKind::Synced, b"key", b"value")
                .unwrap();
            storage.set_max_timestamp(42).unwrap();
        }

        {
            let storage = FileStorage::open(&path).unwrap();
            assert_eq!(
                storage.get_meta_data(b"meta").unwrap(),
                Some(b"persistent".to_vec())
            );
            assert_eq!(
                storage.get_kv_data(DataKind::Synced, b"key").unwrap(),
                Some(b"value".to_vec())
            );
            assert_eq!(storage.get_max_timestamp().unwrap(), 42);
        }
    }

    #[test]
    fn uncommitted_writes_are_not_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("txn.snapshot");

        {
            let storage = FileStorage::open(&path).unwrap();
            storage.put_kv_data(DataKind::Local, b"kept", b"1").unwrap();
            storage.begin_transaction().unwrap();
            storage.put_kv_data(DataKind::Local, b"lost", b"2").unwrap();
        }

        let storage = FileStorage::open(&path).unwrap();
        assert!(storage.get_kv_data(DataKind::Local, b"kept").unwrap().is_some());
        assert!(storage.get_kv_data(DataKind::Local, b"lost").unwrap().is_none());
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locked.snapshot");

        let _first = FileStorage::open(&path).unwrap();
        assert!(matches!(FileStorage::open(&path), Err(StorageError::Locked)));
    }

    #[test]
    fn file_create_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("store.snapshot");

        let storage = FileStorage::open_with_create_dirs(&path).unwrap();
        storage.put_meta_data(b"k", b"v").unwrap();
        assert!(path.exists());
    }
}
