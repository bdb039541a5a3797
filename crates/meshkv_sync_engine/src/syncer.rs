//! Public sync API.
//!
//! A [`Syncer`] owns the metadata, the logical clock and the
//! [`SyncEngine`] of one store. Each `sync` call becomes a
//! [`SyncOperation`] tracked until every device reached a terminal
//! status or the request was stopped.

use crate::config::{SyncConfig, QUEUED_SYNC_LIMIT_MAX, QUEUED_SYNC_LIMIT_MIN};
use crate::engine::{PermissionCheck, SyncEngine, SyncRuntime};
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::operation::{DeviceStatuses, SyncCallback, SyncId, SyncMode, SyncOperation};
use crate::state_machine::StateMachineFactory;
use crate::time_helper::{SystemClock, TimeHelper, WallClock};
use meshkv_core::{CoreError, TaskPool};
use meshkv_storage::{KvStorage, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Sync ids wrap back to 1 after this value.
const MAX_SYNC_ID: SyncId = 0x7fff_ffff;

type FinalizeCallback = Box<dyn FnOnce() + Send>;

/// A user sync request.
#[must_use]
pub struct SyncRequest {
    devices: Vec<String>,
    mode: SyncMode,
    wait: bool,
    on_complete: Option<SyncCallback>,
    on_finalize: Option<FinalizeCallback>,
}

impl SyncRequest {
    /// Creates a non-blocking request for `devices`.
    pub fn new<I, S>(devices: I, mode: SyncMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
            mode,
            wait: false,
            on_complete: None,
            on_finalize: None,
        }
    }

    /// Makes `sync` block until the request finished.
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Sets the callback run once with the final per-device statuses.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&DeviceStatuses) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Sets the callback run when the request is released.
    pub fn on_finalize<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_finalize = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for SyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRequest")
            .field("devices", &self.devices)
            .field("mode", &self.mode)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

struct SyncerState {
    initialized: bool,
    closing: bool,
    manual_sync_enabled: bool,
    queued_manual_sync_size: usize,
    queued_sync_limit: usize,
    last_sync_id: SyncId,
    auto_sync_enabled: bool,
    auto_sync_devices: Vec<String>,
}

impl SyncerState {
    fn next_sync_id(&mut self) -> SyncId {
        self.last_sync_id = if self.last_sync_id >= MAX_SYNC_ID {
            1
        } else {
            self.last_sync_id + 1
        };
        self.last_sync_id
    }
}

struct SyncerInner {
    engine: SyncEngine,
    metadata: Arc<Metadata>,
    time_helper: Arc<TimeHelper>,
    pool: Arc<TaskPool>,
    state: Mutex<SyncerState>,
    operations: Mutex<HashMap<SyncId, SyncOperation>>,
}

impl SyncerInner {
    fn remove_sync_operation(&self, sync_id: SyncId) -> bool {
        let operation = self.operations.lock().remove(&sync_id);
        let Some(operation) = operation else {
            return false;
        };
        if operation.mode().is_manual() && !operation.is_blocking() {
            let mut state = self.state.lock();
            state.queued_manual_sync_size = state.queued_manual_sync_size.saturating_sub(1);
        }
        debug!(sync_id, "[Syncer] sync operation removed");
        operation.kill_and_release();
        true
    }
}

/// Entry point for syncing one store with remote devices.
#[derive(Clone)]
pub struct Syncer {
    inner: Arc<SyncerInner>,
}

impl Syncer {
    /// Initializes a syncer on the wall clock.
    ///
    /// # Errors
    ///
    /// Propagates metadata, clock and engine initialization errors.
    pub fn initialize(
        storage: Arc<dyn KvStorage>,
        runtime: SyncRuntime,
        factory: Arc<dyn StateMachineFactory>,
        config: SyncConfig,
    ) -> SyncResult<Self> {
        Self::initialize_with_clock(storage, runtime, factory, config, Arc::new(WallClock::new()))
    }

    /// Initializes a syncer on an explicit system clock.
    ///
    /// # Errors
    ///
    /// Same as [`Syncer::initialize`].
    pub fn initialize_with_clock(
        storage: Arc<dyn KvStorage>,
        runtime: SyncRuntime,
        factory: Arc<dyn StateMachineFactory>,
        config: SyncConfig,
        clock: Arc<dyn SystemClock>,
    ) -> SyncResult<Self> {
        let metadata = Arc::new(Metadata::initialize(
            Arc::clone(&storage),
            Arc::clone(&clock),
        )?);
        let time_helper = Arc::new(TimeHelper::initialize(
            storage,
            Arc::clone(&metadata),
            clock,
        )?);
        let pool = Arc::clone(&runtime.pool);
        let state = SyncerState {
            initialized: true,
            closing: false,
            manual_sync_enabled: true,
            queued_manual_sync_size: 0,
            queued_sync_limit: config.queued_sync_limit,
            last_sync_id: 0,
            auto_sync_enabled: config.auto_sync_enabled,
            auto_sync_devices: Vec::new(),
        };
        let engine = SyncEngine::new(
            config,
            runtime,
            factory,
            Arc::clone(&metadata),
            Arc::clone(&time_helper),
        )?;
        info!("[Syncer] initialized");
        Ok(Self {
            inner: Arc::new(SyncerInner {
                engine,
                metadata,
                time_helper,
                pool,
                state: Mutex::new(state),
                operations: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Starts a sync with the request's devices and returns its id.
    ///
    /// A blocking request returns after its completion callback ran.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NotInit`] after `close`
    /// - [`SyncError::Busy`] while closing, when the queued manual sync
    ///   limit is reached, or while manual sync is disabled
    /// - [`SyncError::InvalidArgs`] for an empty device list or a mode
    ///   callers may not request
    pub fn sync(&self, request: SyncRequest) -> SyncResult<SyncId> {
        let SyncRequest {
            devices,
            mode,
            wait,
            on_complete,
            on_finalize,
        } = request;

        let sync_id = {
            let mut state = self.inner.state.lock();
            if !state.initialized {
                return Err(SyncError::NotInit);
            }
            if state.closing {
                return Err(SyncError::busy("syncer is closing"));
            }
            if devices.is_empty() || devices.iter().any(String::is_empty) {
                return Err(SyncError::invalid_args("empty device list"));
            }
            if !mode.is_user_selectable() {
                return Err(SyncError::invalid_args(format!("mode {mode:?} cannot be requested")));
            }
            let queued = !wait && mode.is_manual();
            if queued && state.queued_manual_sync_size >= state.queued_sync_limit {
                return Err(SyncError::busy("queued manual sync limit reached"));
            }
            if mode.is_manual() && !state.manual_sync_enabled {
                return Err(SyncError::busy("manual sync is disabled"));
            }
            if queued {
                state.queued_manual_sync_size += 1;
            }
            state.next_sync_id()
        };

        let operation = SyncOperation::new(sync_id, &devices, mode, wait);
        if let Some(callback) = on_complete {
            operation.set_user_callback(callback);
        }
        if let Some(callback) = on_finalize {
            operation.set_on_finalize(callback);
        }
        info!(sync_id, mode = ?mode, devices = devices.len(), wait, "[Syncer] sync");
        self.start_operation(operation)?;
        Ok(sync_id)
    }

    /// Stops a request. Devices that have not started are dropped from
    /// their queues; running sessions finish but report nothing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] for an unknown or finished id.
    pub fn stop_sync(&self, sync_id: SyncId) -> SyncResult<()> {
        if !self.inner.remove_sync_operation(sync_id) {
            return Err(CoreError::not_found(format!("sync id {sync_id}")).into());
        }
        info!(sync_id, "[Syncer] sync stopped");
        Ok(())
    }

    /// Returns a fresh logical timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInit`] after `close`.
    pub fn get_timestamp(&self) -> SyncResult<Timestamp> {
        self.check_initialized()?;
        Ok(self.inner.time_helper.get_time())
    }

    /// Resets both watermarks of `device`, given as a device id or, with
    /// `is_need_hash == false`, as its SHA-256 digest.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInit`] after `close`, and storage errors.
    pub fn erase_device_water_mark(
        &self,
        device: impl AsRef<[u8]>,
        is_need_hash: bool,
    ) -> SyncResult<()> {
        self.check_initialized()?;
        let device = device.as_ref();
        if device.is_empty() {
            return Err(SyncError::invalid_args("empty device id"));
        }
        self.inner.metadata.erase_device_water_mark(device, is_need_hash)
    }

    /// Number of queued manual non-blocking syncs.
    pub fn get_queued_sync_size(&self) -> usize {
        self.inner.state.lock().queued_manual_sync_size
    }

    /// Sets the queued manual sync limit.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgs`] outside
    /// `[QUEUED_SYNC_LIMIT_MIN, QUEUED_SYNC_LIMIT_MAX]`.
    pub fn set_queued_sync_limit(&self, limit: usize) -> SyncResult<()> {
        if !(QUEUED_SYNC_LIMIT_MIN..=QUEUED_SYNC_LIMIT_MAX).contains(&limit) {
            return Err(SyncError::invalid_args(format!("queued sync limit {limit}")));
        }
        self.inner.state.lock().queued_sync_limit = limit;
        Ok(())
    }

    /// Current queued manual sync limit.
    pub fn get_queued_sync_limit(&self) -> usize {
        self.inner.state.lock().queued_sync_limit
    }

    /// Rejects further manual syncs.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Busy`] while manual syncs are queued.
    pub fn disable_manual_sync(&self) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        if state.queued_manual_sync_size > 0 {
            return Err(SyncError::busy("manual syncs are queued"));
        }
        state.manual_sync_enabled = false;
        Ok(())
    }

    /// Accepts manual syncs again.
    pub fn enable_manual_sync(&self) {
        self.inner.state.lock().manual_sync_enabled = true;
    }

    /// Sets the devices auto syncs go to.
    pub fn set_auto_sync_devices<I, S>(&self, devices: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.state.lock().auto_sync_devices = devices.into_iter().map(Into::into).collect();
    }

    /// Turns data-change triggered syncs on or off.
    pub fn enable_auto_sync(&self, enabled: bool) {
        self.inner.state.lock().auto_sync_enabled = enabled;
    }

    /// Pushes local changes to the auto-sync devices. Returns the id of
    /// the started auto sync, or `None` if auto sync is off or no device
    /// is configured.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInit`] after `close`, and engine errors.
    pub fn local_data_changed(&self) -> SyncResult<Option<SyncId>> {
        let (sync_id, devices) = {
            let mut state = self.inner.state.lock();
            if !state.initialized || state.closing {
                return Err(SyncError::NotInit);
            }
            if !state.auto_sync_enabled || state.auto_sync_devices.is_empty() {
                return Ok(None);
            }
            (state.next_sync_id(), state.auto_sync_devices.clone())
        };
        debug!(sync_id, devices = devices.len(), "[Syncer] local data changed");
        self.start_operation(SyncOperation::new(sync_id, &devices, SyncMode::AutoPush, false))?;
        Ok(Some(sync_id))
    }

    /// Pulls from `device` after it announced new data. Returns the id
    /// of the started auto sync, or `None` if auto sync is off.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInit`] after `close`,
    /// [`SyncError::InvalidArgs`] for an empty device id, and engine
    /// errors.
    pub fn remote_data_changed(&self, device: &str) -> SyncResult<Option<SyncId>> {
        if device.is_empty() {
            return Err(SyncError::invalid_args("empty device id"));
        }
        let sync_id = {
            let mut state = self.inner.state.lock();
            if !state.initialized || state.closing {
                return Err(SyncError::NotInit);
            }
            if !state.auto_sync_enabled {
                return Ok(None);
            }
            state.next_sync_id()
        };
        debug!(sync_id, device, "[Syncer] remote data changed");
        let devices = [device.to_string()];
        self.start_operation(SyncOperation::new(sync_id, &devices, SyncMode::AutoPull, false))?;
        Ok(Some(sync_id))
    }

    /// Installs the permission hook consulted for every device.
    pub fn set_permission_check(&self, check: Arc<dyn PermissionCheck>) {
        self.inner.engine.set_permission_check(check);
    }

    /// The engine routing messages to device contexts.
    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    /// Persisted metadata.
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.inner.metadata
    }

    /// Number of requests not yet finished or stopped.
    pub fn operation_count(&self) -> usize {
        self.inner.operations.lock().len()
    }

    /// Stops every context and request. Later calls fail with
    /// [`SyncError::NotInit`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotInit`] if already closed and
    /// [`SyncError::Busy`] while another close is running.
    pub fn close(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            if !state.initialized {
                return Err(SyncError::NotInit);
            }
            if state.closing {
                return Err(SyncError::busy("syncer is closing"));
            }
            state.closing = true;
        }
        info!("[Syncer] closing");
        self.inner.engine.close();

        let remaining: Vec<SyncOperation> = self
            .inner
            .operations
            .lock()
            .drain()
            .map(|(_, operation)| operation)
            .collect();
        for operation in remaining {
            operation.kill_and_release();
        }

        let mut state = self.inner.state.lock();
        state.queued_manual_sync_size = 0;
        state.initialized = false;
        state.closing = false;
        Ok(())
    }

    fn check_initialized(&self) -> SyncResult<()> {
        if !self.inner.state.lock().initialized {
            return Err(SyncError::NotInit);
        }
        Ok(())
    }

    /// Tracks `operation`, hands it to the engine, and parks a blocking
    /// caller until it finished.
    fn start_operation(&self, operation: SyncOperation) -> SyncResult<()> {
        let sync_id = operation.sync_id();
        let weak: Weak<SyncerInner> = Arc::downgrade(&self.inner);
        operation.set_on_finished(move |sync_id| {
            if let Some(inner) = weak.upgrade() {
                inner.remove_sync_operation(sync_id);
            }
        });
        let weak: Weak<SyncerInner> = Arc::downgrade(&self.inner);
        operation.on_kill(move || {
            if let Some(inner) = weak.upgrade() {
                inner.engine.remove_sync_operation(sync_id);
            }
        })?;
        self.inner.operations.lock().insert(sync_id, operation.clone());

        if let Err(err) = self.inner.engine.add_sync_operation(&operation) {
            warn!(sync_id, error = %err, "[Syncer] failed to add sync operation");
            self.inner.remove_sync_operation(sync_id);
            return Err(err);
        }

        // Every device may already be done, e.g. all rejected by the
        // permission hook; nothing else would finish the request then.
        if operation.check_is_all_finished() {
            if operation.is_blocking() {
                operation.finished();
            } else {
                let deferred = operation.clone();
                if let Err(err) = self.inner.pool.schedule(move || deferred.finished()) {
                    debug!(sync_id, error = %err, "[Syncer] finishing sync inline");
                    operation.finished();
                }
            }
        }
        operation.wait_if_needed();
        Ok(())
    }
}

impl fmt::Debug for Syncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Syncer")
            .field("initialized", &state.initialized)
            .field("queued_manual_sync_size", &state.queued_manual_sync_size)
            .field("queued_sync_limit", &state.queued_sync_limit)
            .field("last_sync_id", &state.last_sync_id)
            .finish_non_exhaustive()
    }
}
