//! Commit notification pipeline.
//!
//! A committed write is turned into a [`CommitNotifyData`], stamped with
//! a per-store monotonically increasing notify id, and delivered on the
//! task pool under the store's tag. Delivery for one store is therefore
//! strictly ordered and never concurrent, and writers never run observer
//! callbacks themselves.
//!
//! Each observer captures the notify barrier (the last stamped id) when it
//! registers and ignores payloads with `notify_id <= barrier`, so it never
//! sees a commit that happened before its registration even though
//! delivery is asynchronous.

mod data;

pub use data::{CommitNotifyData, Conflict, Entry, KeyChange};

use crate::error::CoreResult;
use crate::notification::{EventPayload, EventType, Listener, NotificationChain};
use crate::task_pool::TaskPool;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Local writes made through this store.
pub const LOCAL_PUT_EVENT: EventType = 1;
/// Every write, local or synced.
pub const PUT_EVENT: EventType = 2;
/// Writes that arrived through sync.
pub const SYNC_EVENT: EventType = 3;
/// Conflicts detected while applying synced data.
pub const CONFLICT_EVENT: EventType = 4;

const COMMIT_EVENTS: [EventType; 4] = [LOCAL_PUT_EVENT, PUT_EVENT, SYNC_EVENT, CONFLICT_EVENT];

/// Which commits an observer wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverMode {
    /// Only writes made locally.
    LocalOnly,
    /// Every write.
    Native,
    /// Only writes that arrived from remote devices.
    Foreign,
}

impl ObserverMode {
    /// The event type this mode subscribes to.
    pub const fn event_type(self) -> EventType {
        match self {
            Self::LocalOnly => LOCAL_PUT_EVENT,
            Self::Native => PUT_EVENT,
            Self::Foreign => SYNC_EVENT,
        }
    }
}

/// Delivers commit notifications of one store.
pub struct CommitNotifier {
    store_tag: String,
    bus: Arc<NotificationChain>,
    pool: Arc<TaskPool>,
    last_notify_id: AtomicU64,
    // Held from stamping until the delivery is queued.
    stamp_lock: Mutex<()>,
    closed: AtomicBool,
}

impl CommitNotifier {
    /// Creates a notifier and registers the commit event types on `bus`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRegistered` if another notifier already owns the
    /// commit events of this bus.
    pub fn new(bus: Arc<NotificationChain>, pool: Arc<TaskPool>) -> CoreResult<Self> {
        for (registered, event_type) in COMMIT_EVENTS.iter().enumerate() {
            if let Err(err) = bus.register_event_type(*event_type) {
                for undo in &COMMIT_EVENTS[..registered] {
                    let _ = bus.unregister_event_type(*undo);
                }
                return Err(err);
            }
        }
        Ok(Self {
            store_tag: Uuid::new_v4().to_string(),
            bus,
            pool,
            last_notify_id: AtomicU64::new(0),
            stamp_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Task pool tag that serializes this store's deliveries.
    pub fn store_tag(&self) -> &str {
        &self.store_tag
    }

    /// The last stamped notify id.
    pub fn notify_barrier(&self) -> u64 {
        self.last_notify_id.load(Ordering::SeqCst)
    }

    /// Registers a data observer.
    ///
    /// With a `prefix`, the callback receives only the matching part of
    /// each commit and is skipped when nothing matches.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` after [`CommitNotifier::close`].
    pub fn register_observer<F>(
        &self,
        mode: ObserverMode,
        prefix: Option<Vec<u8>>,
        callback: F,
    ) -> CoreResult<Listener>
    where
        F: Fn(&CommitNotifyData) + Send + Sync + 'static,
    {
        let barrier = self.notify_barrier();
        self.bus.register_listener(mode.event_type(), move |payload| {
            let EventPayload::Commit(data) = payload else {
                return;
            };
            let data: &CommitNotifyData = data;
            if data.notify_id() <= barrier || data.is_changed_data_empty() {
                return;
            }
            match &prefix {
                Some(prefix) => {
                    if let Some(filtered) = data.filter_by_prefix(prefix) {
                        if !filtered.is_changed_data_empty() {
                            callback(&filtered);
                        }
                    }
                }
                None => callback(data),
            }
        })
    }

    /// Registers an observer for sync conflicts.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` after [`CommitNotifier::close`].
    pub fn register_conflict_observer<F>(&self, callback: F) -> CoreResult<Listener>
    where
        F: Fn(&CommitNotifyData) + Send + Sync + 'static,
    {
        let barrier = self.notify_barrier();
        self.bus.register_listener(CONFLICT_EVENT, move |payload| {
            let EventPayload::Commit(data) = payload else {
                return;
            };
            let data: &CommitNotifyData = data;
            if data.notify_id() <= barrier || data.is_conflicted_data_empty() {
                return;
            }
            callback(data);
        })
    }

    /// Stamps `data` and schedules its delivery on `event_type`.
    ///
    /// Returns the stamped notify id.
    ///
    /// # Errors
    ///
    /// Returns `NotPermit`/`Stale` if the task pool is not running; the
    /// notification is dropped.
    pub fn commit_notify(&self, event_type: EventType, data: CommitNotifyData) -> CoreResult<u64> {
        self.deliver(&[event_type], data)
    }

    /// Emits `event_type` if `data` carries changes and
    /// [`CONFLICT_EVENT`] if it carries conflicts, consuming `data`.
    ///
    /// # Errors
    ///
    /// Same as [`CommitNotifier::commit_notify`].
    pub fn commit_and_release(&self, event_type: EventType, data: CommitNotifyData) -> CoreResult<()> {
        let mut events = Vec::with_capacity(2);
        if !data.is_changed_data_empty() {
            events.push(event_type);
        }
        if !data.is_conflicted_data_empty() {
            events.push(CONFLICT_EVENT);
        }
        if events.is_empty() {
            return Ok(());
        }
        self.deliver(&events, data).map(|_| ())
    }

    fn deliver(&self, events: &[EventType], mut data: CommitNotifyData) -> CoreResult<u64> {
        let _stamp = self.stamp_lock.lock();
        let notify_id = self.last_notify_id.fetch_add(1, Ordering::SeqCst) + 1;
        data.stamp(notify_id);
        let payload = EventPayload::Commit(Arc::new(data));
        let events = events.to_vec();
        let bus = Arc::clone(&self.bus);

        self.pool
            .schedule_keyed(self.store_tag.clone(), move || {
                for event_type in events {
                    bus.notify_event(event_type, &payload);
                }
            })
            .inspect_err(|err| {
                warn!(notify_id, error = %err, "[CommitNotify] could not schedule delivery");
            })?;
        debug!(notify_id, "[CommitNotify] delivery scheduled");
        Ok(notify_id)
    }

    /// Unregisters the commit event types, detaching every observer.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for event_type in COMMIT_EVENTS {
            if let Err(err) = self.bus.unregister_event_type(event_type) {
                debug!(event_type, error = %err, "[CommitNotify] event type already gone");
            }
        }
        self.pool.shrink_memory(&self.store_tag);
    }
}

impl Drop for CommitNotifier {
    fn drop(&mut self) {
        self.close();
    }
}
