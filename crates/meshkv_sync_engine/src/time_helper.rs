//! Logical clock.
//!
//! Timestamps are in 100 ns units. The logical time of this device is the
//! raw system clock plus a persisted local offset. [`TimeHelper::initialize`]
//! bumps that offset forward whenever the clock would issue a value at or
//! below the newest timestamp already in storage, so data written after a
//! clock rewind or a restore still sorts after everything on disk.

use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use meshkv_storage::{KvStorage, Timestamp};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Microseconds to 100 ns units.
pub const TO_100_NS: i64 = 10;
/// One millisecond in 100 ns units.
pub const MS_TO_100_NS: i64 = 10_000;
/// Every valid timestamp lies strictly below this sentinel.
pub const MAX_VALID_TIME: Timestamp = 0x7fff_ffff_ffff_ffff;

/// Source of raw system time.
pub trait SystemClock: Send + Sync {
    /// Current raw system time in 100 ns units.
    fn now(&self) -> Timestamp;
}

/// The operating-system wall clock. Readings never repeat: two calls in
/// the same microsecond are pushed apart.
#[derive(Debug, Default)]
pub struct WallClock {
    last_micros: Mutex<u64>,
}

impl WallClock {
    /// Creates a wall clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SystemClock for WallClock {
    fn now(&self) -> Timestamp {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let mut last = self.last_micros.lock();
        *last = if micros <= *last { *last + 1 } else { micros };
        last.saturating_mul(TO_100_NS as u64)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now`.
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Sets the reading, backwards or forwards.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves the reading forward by `delta`.
    pub fn advance(&self, delta: Timestamp) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl SystemClock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Issues strictly increasing logical timestamps.
pub struct TimeHelper {
    clock: Arc<dyn SystemClock>,
    storage: Arc<dyn KvStorage>,
    metadata: Arc<Metadata>,
    last_local_time: Mutex<Timestamp>,
}

impl TimeHelper {
    /// Reconciles the persisted offset with the newest stored timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidTime`] if the current logical time or
    /// the stored maximum is not below [`MAX_VALID_TIME`], and storage
    /// errors from reading the maximum or saving a new offset.
    pub fn initialize(
        storage: Arc<dyn KvStorage>,
        metadata: Arc<Metadata>,
        clock: Arc<dyn SystemClock>,
    ) -> SyncResult<Self> {
        let max_stored = storage.get_max_timestamp()?;
        let system_time = clock.now();
        let offset = metadata.get_local_time_offset();
        let current = i128::from(system_time) + i128::from(offset);
        if current >= i128::from(MAX_VALID_TIME) || max_stored >= MAX_VALID_TIME {
            return Err(SyncError::InvalidTime(format!(
                "current time {current} or stored max {max_stored} out of range"
            )));
        }
        if current <= i128::from(max_stored) {
            let bumped = rebased_offset(max_stored, system_time)?;
            info!(
                old_offset = offset,
                new_offset = bumped,
                max_stored,
                "[TimeHelper] local time offset moved forward past stored data"
            );
            metadata.save_local_time_offset(bumped)?;
        }
        Ok(Self {
            clock,
            storage,
            metadata,
            last_local_time: Mutex::new(max_stored),
        })
    }

    /// Returns the next logical timestamp, strictly greater than every
    /// value returned before.
    pub fn get_time(&self) -> Timestamp {
        let current = self.current_time();
        let mut last = self.last_local_time.lock();
        if current <= *last || current > MAX_VALID_TIME {
            *last += 1;
        } else {
            *last = current;
        }
        *last
    }

    /// Raw system time, without the local offset.
    pub fn get_sys_current_time(&self) -> Timestamp {
        self.clock.now()
    }

    /// Newest timestamp stored in the data.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn get_max_data_item_time(&self) -> SyncResult<Timestamp> {
        Ok(self.storage.get_max_timestamp()?)
    }

    /// Re-bases the local offset after the system clock moved by
    /// `changed_micros`, keeping new timestamps above stored data.
    ///
    /// # Errors
    ///
    /// Propagates storage errors.
    pub fn rebase_on_time_change(&self, changed_micros: i64) -> SyncResult<()> {
        let changed = changed_micros.saturating_mul(TO_100_NS);
        let mut offset = self.metadata.get_local_time_offset().saturating_sub(changed);
        let system_time = self.clock.now();
        let max_stored = self.storage.get_max_timestamp()?;
        if i128::from(system_time) + i128::from(offset) <= i128::from(max_stored) {
            offset = rebased_offset(max_stored, system_time)?;
        }
        info!(
            changed_micros,
            offset, "[TimeHelper] system time changed, local offset re-based"
        );
        self.metadata.save_local_time_offset(offset)
    }

    fn current_time(&self) -> Timestamp {
        let current = i128::from(self.clock.now()) + i128::from(self.metadata.get_local_time_offset());
        match Timestamp::try_from(current) {
            Ok(current) => current,
            Err(_) => {
                warn!(current = %current, "[TimeHelper] logical time out of range");
                0
            }
        }
    }
}

impl fmt::Debug for TimeHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeHelper")
            .field("last_local_time", &*self.last_local_time.lock())
            .finish_non_exhaustive()
    }
}

fn rebased_offset(max_stored: Timestamp, system_time: Timestamp) -> SyncResult<i64> {
    let offset = i128::from(max_stored) - i128::from(system_time) + i128::from(MS_TO_100_NS);
    i64::try_from(offset).map_err(|_| SyncError::InvalidTime(format!("offset {offset} out of range")))
}
