//! Persisted per-device sync metadata.
//!
//! Every remote device has one [`MetaDataValue`] stored under
//! `b"deviceId" ++ sha256(device)`. The local time offset lives under
//! `b"localTimeOffset"`. Values are CBOR-encoded and cached in memory;
//! the cache is rebuilt from storage by [`Metadata::load_all`].

use crate::error::{SyncError, SyncResult};
use crate::time_helper::SystemClock;
use meshkv_storage::{KvStorage, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const LOCAL_TIME_OFFSET_KEY: &[u8] = b"localTimeOffset";
const DEVICE_ID_PREFIX_KEY: &[u8] = b"deviceId";

/// Sync state kept for one remote device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDataValue {
    /// Clock offset between this device and the remote one.
    pub time_offset: i64,
    /// Everything local up to this timestamp was sent to the device.
    pub local_water_mark: Timestamp,
    /// Everything from the device up to this timestamp was received.
    pub peer_water_mark: Timestamp,
    /// Raw system time of the last update.
    pub last_update_time: Timestamp,
}

/// Cached, persisted sync metadata of one store.
pub struct Metadata {
    storage: Arc<dyn KvStorage>,
    clock: Arc<dyn SystemClock>,
    local_time_offset: Mutex<i64>,
    // Held across read, persist and cache update so writers never
    // interleave on one key.
    values: Mutex<HashMap<Vec<u8>, MetaDataValue>>,
    hashed_keys: Mutex<HashMap<String, Vec<u8>>>,
}

impl Metadata {
    /// Loads the local time offset (saving zero if absent) and every
    /// device entry.
    ///
    /// # Errors
    ///
    /// Propagates storage and decoding errors.
    pub fn initialize(storage: Arc<dyn KvStorage>, clock: Arc<dyn SystemClock>) -> SyncResult<Self> {
        let metadata = Self {
            storage,
            clock,
            local_time_offset: Mutex::new(0),
            values: Mutex::new(HashMap::new()),
            hashed_keys: Mutex::new(HashMap::new()),
        };
        match metadata.storage.get_meta_data(LOCAL_TIME_OFFSET_KEY)? {
            Some(bytes) => *metadata.local_time_offset.lock() = decode(&bytes)?,
            None => metadata.save_local_time_offset(0)?,
        }
        metadata.load_all()?;
        Ok(metadata)
    }

    /// Rebuilds the device cache from storage.
    ///
    /// # Errors
    ///
    /// Propagates storage errors. Entries that fail to decode are skipped.
    pub fn load_all(&self) -> SyncResult<()> {
        let mut values = self.values.lock();
        values.clear();
        for key in self.storage.get_all_meta_keys()? {
            if !key.starts_with(DEVICE_ID_PREFIX_KEY) {
                continue;
            }
            let Some(bytes) = self.storage.get_meta_data(&key)? else {
                continue;
            };
            match decode::<MetaDataValue>(&bytes) {
                Ok(value) => {
                    values.insert(key, value);
                }
                Err(err) => warn!(error = %err, "[Metadata] skipping undecodable entry"),
            }
        }
        debug!(devices = values.len(), "[Metadata] loaded");
        Ok(())
    }

    /// Offset added to the raw system clock to get logical time.
    pub fn get_local_time_offset(&self) -> i64 {
        *self.local_time_offset.lock()
    }

    /// Persists and caches a new local time offset.
    ///
    /// # Errors
    ///
    /// Propagates storage and encoding errors; the cached value is kept.
    pub fn save_local_time_offset(&self, offset: i64) -> SyncResult<()> {
        let mut current = self.local_time_offset.lock();
        self.storage
            .put_meta_data(LOCAL_TIME_OFFSET_KEY, &encode(&offset)?)?;
        *current = offset;
        Ok(())
    }

    /// Clock offset recorded for `device`.
    pub fn get_time_offset(&self, device: &str) -> i64 {
        self.value(&self.device_key(device)).time_offset
    }

    /// Records the clock offset for `device`.
    ///
    /// # Errors
    ///
    /// Propagates storage and encoding errors.
    pub fn save_time_offset(&self, device: &str, offset: i64) -> SyncResult<()> {
        self.update(self.device_key(device), |value| value.time_offset = offset)
    }

    /// Local watermark for `device`.
    pub fn get_local_water_mark(&self, device: &str) -> Timestamp {
        self.value(&self.device_key(device)).local_water_mark
    }

    /// Records the local watermark for `device`.
    ///
    /// # Errors
    ///
    /// Propagates storage and encoding errors.
    pub fn save_local_water_mark(&self, device: &str, mark: Timestamp) -> SyncResult<()> {
        self.update(self.device_key(device), |value| value.local_water_mark = mark)
    }

    /// Peer watermark for `device`.
    pub fn get_peer_water_mark(&self, device: &str) -> Timestamp {
        self.value(&self.device_key(device)).peer_water_mark
    }

    /// Records the peer watermark for `device`.
    ///
    /// # Errors
    ///
    /// Propagates storage and encoding errors.
    pub fn save_peer_water_mark(&self, device: &str, mark: Timestamp) -> SyncResult<()> {
        self.update(self.device_key(device), |value| value.peer_water_mark = mark)
    }

    /// Resets both watermarks of a device, keeping its time offset.
    ///
    /// With `is_need_hash == false`, `device` is taken as the raw
    /// SHA-256 digest of the device id. Unknown devices are left alone.
    ///
    /// # Errors
    ///
    /// Propagates storage and encoding errors.
    pub fn erase_device_water_mark(
        &self,
        device: impl AsRef<[u8]>,
        is_need_hash: bool,
    ) -> SyncResult<()> {
        let device = device.as_ref();
        let key = if is_need_hash {
            [DEVICE_ID_PREFIX_KEY, Sha256::digest(device).as_slice()].concat()
        } else {
            [DEVICE_ID_PREFIX_KEY, device].concat()
        };
        let mut values = self.values.lock();
        let mut value = match values.get(&key) {
            Some(value) => *value,
            None => match self.load(&key)? {
                Some(value) => value,
                None => {
                    debug!("[Metadata] erase skipped for unknown device");
                    return Ok(());
                }
            },
        };
        value.local_water_mark = 0;
        value.peer_water_mark = 0;
        value.last_update_time = self.clock.now();
        self.storage.put_meta_data(&key, &encode(&value)?)?;
        values.insert(key, value);
        Ok(())
    }

    /// Raw system time of the last metadata update for `device`.
    pub fn get_last_update_time(&self, device: &str) -> Timestamp {
        self.value(&self.device_key(device)).last_update_time
    }

    fn device_key(&self, device: &str) -> Vec<u8> {
        let mut hashed = self.hashed_keys.lock();
        if let Some(key) = hashed.get(device) {
            return key.clone();
        }
        let key = [DEVICE_ID_PREFIX_KEY, Sha256::digest(device.as_bytes()).as_slice()].concat();
        hashed.insert(device.to_string(), key.clone());
        key
    }

    fn value(&self, key: &[u8]) -> MetaDataValue {
        let mut values = self.values.lock();
        if let Some(value) = values.get(key) {
            return *value;
        }
        match self.load(key) {
            Ok(Some(value)) => {
                values.insert(key.to_vec(), value);
                value
            }
            Ok(None) => MetaDataValue::default(),
            Err(err) => {
                warn!(error = %err, "[Metadata] read failed, using defaults");
                MetaDataValue::default()
            }
        }
    }

    fn update<F>(&self, key: Vec<u8>, apply: F) -> SyncResult<()>
    where
        F: FnOnce(&mut MetaDataValue),
    {
        let mut values = self.values.lock();
        let mut value = match values.get(&key) {
            Some(value) => *value,
            None => self.load(&key)?.unwrap_or_default(),
        };
        apply(&mut value);
        value.last_update_time = self.clock.now();
        self.storage.put_meta_data(&key, &encode(&value)?)?;
        values.insert(key, value);
        Ok(())
    }

    fn load(&self, key: &[u8]) -> SyncResult<Option<MetaDataValue>> {
        self.storage
            .get_meta_data(key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("local_time_offset", &self.get_local_time_offset())
            .field("devices", &self.values.lock().len())
            .finish_non_exhaustive()
    }
}

fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(bytes)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> SyncResult<T> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_helper::ManualClock;
    use meshkv_storage::{FileStorage, MemoryStorage};

    fn memory_metadata() -> (Metadata, Arc<MemoryStorage>, Arc<ManualClock>) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let metadata = Metadata::initialize(storage.clone(), clock.clone()).unwrap();
        (metadata, storage, clock)
    }

    #[test]
    fn missing_offset_is_saved_as_zero() {
        let (metadata, storage, _clock) = memory_metadata();
        assert_eq!(metadata.get_local_time_offset(), 0);
        assert!(storage.get_meta_data(LOCAL_TIME_OFFSET_KEY).unwrap().is_some());
    }

    #[test]
    fn watermarks_roundtrip() {
        let (metadata, _storage, clock) = memory_metadata();
        metadata.save_peer_water_mark("device-a", 42).unwrap();
        clock.set(2_000);
        metadata.save_local_water_mark("device-a", 7).unwrap();

        assert_eq!(metadata.get_peer_water_mark("device-a"), 42);
        assert_eq!(metadata.get_local_water_mark("device-a"), 7);
        assert_eq!(metadata.get_last_update_time("device-a"), 2_000);
        assert_eq!(metadata.get_peer_water_mark("device-b"), 0);
    }

    #[test]
    fn device_ids_are_stored_hashed() {
        let (metadata, storage, _clock) = memory_metadata();
        metadata.save_peer_water_mark("device-a", 1).unwrap();
        let keys = storage.get_all_meta_keys().unwrap();
        let device_key = keys
            .iter()
            .find(|key| key.starts_with(DEVICE_ID_PREFIX_KEY))
            .unwrap();
        assert_eq!(device_key.len(), DEVICE_ID_PREFIX_KEY.len() + 32);
        assert!(!device_key.windows(8).any(|w| w == b"device-a"));
    }

    #[test]
    fn erase_keeps_time_offset() {
        let (metadata, _storage, _clock) = memory_metadata();
        metadata.save_time_offset("device-a", -300).unwrap();
        metadata.save_local_water_mark("device-a", 10).unwrap();
        metadata.save_peer_water_mark("device-a", 20).unwrap();

        metadata.erase_device_water_mark("device-a", true).unwrap();

        assert_eq!(metadata.get_time_offset("device-a"), -300);
        assert_eq!(metadata.get_local_water_mark("device-a"), 0);
        assert_eq!(metadata.get_peer_water_mark("device-a"), 0);
    }

    #[test]
    fn erase_accepts_raw_digest() {
        let (metadata, _storage, _clock) = memory_metadata();
        metadata.save_peer_water_mark("device-a", 20).unwrap();
        let digest = Sha256::digest(b"device-a");

        metadata.erase_device_water_mark(digest.as_slice(), false).unwrap();

        assert_eq!(metadata.get_peer_water_mark("device-a"), 0);
    }

    #[test]
    fn erase_of_unknown_device_writes_nothing() {
        let (metadata, storage, _clock) = memory_metadata();
        let before = storage.get_all_meta_keys().unwrap().len();

        metadata.erase_device_water_mark("device-z", true).unwrap();
        metadata.erase_device_water_mark([0xffu8; 32], false).unwrap();

        assert_eq!(storage.get_all_meta_keys().unwrap().len(), before);
        assert!(metadata.values.lock().is_empty());
    }

    #[test]
    fn load_all_rebuilds_cache() {
        let (metadata, storage, clock) = memory_metadata();
        metadata.save_peer_water_mark("device-a", 9).unwrap();
        let reloaded = Metadata::initialize(storage, clock).unwrap();
        assert_eq!(reloaded.values.lock().len(), 1);
        assert_eq!(reloaded.get_peer_water_mark("device-a"), 9);
    }

    #[test]
    fn revoked_storage_fails_save() {
        let (metadata, storage, _clock) = memory_metadata();
        storage.set_access_revoked(true);
        let err = metadata.save_peer_water_mark("device-a", 1).unwrap_err();
        assert!(err.is_key_revoked());
        assert_eq!(metadata.get_peer_water_mark("device-a"), 0);
    }

    #[test]
    fn peer_water_mark_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let clock = Arc::new(ManualClock::new(5));
        {
            let storage = Arc::new(FileStorage::open(&path).unwrap());
            let metadata = Metadata::initialize(storage, clock.clone()).unwrap();
            metadata.save_peer_water_mark("device-a", 42).unwrap();
            metadata.save_local_time_offset(123).unwrap();
        }
        let storage = Arc::new(FileStorage::open(&path).unwrap());
        let metadata = Metadata::initialize(storage, clock).unwrap();
        assert_eq!(metadata.get_peer_water_mark("device-a"), 42);
        assert_eq!(metadata.get_local_time_offset(), 123);
    }
}
