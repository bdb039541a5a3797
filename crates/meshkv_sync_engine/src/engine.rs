//! Per-device context registry.

use crate::config::SyncConfig;
use crate::context::SyncTaskContext;
use crate::error::{SyncError, SyncResult};
use crate::metadata::Metadata;
use crate::operation::{SyncId, SyncMode, SyncOperation, SyncStatus};
use crate::state_machine::{StateMachineFactory, SyncMessage};
use crate::time_helper::TimeHelper;
use crate::timer::TimerService;
use meshkv_core::{CoreError, EventPayload, EventType, Listener, NotificationChain, TaskPool};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Event type on which the platform reports system clock changes, as
/// [`EventPayload::TimeChanged`].
pub const TIME_CHANGED_EVENT: EventType = 5;

/// Shared services a sync engine runs on.
#[derive(Clone)]
pub struct SyncRuntime {
    /// Pool running sync sessions and callbacks.
    pub pool: Arc<TaskPool>,
    /// Session timers.
    pub timer: Arc<dyn TimerService>,
    /// Event bus of the store.
    pub bus: Arc<NotificationChain>,
}

impl fmt::Debug for SyncRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncRuntime")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Direction a permission check is asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionFlag {
    /// Sending data to the device.
    Push,
    /// Receiving data from the device.
    Pull,
    /// Both.
    PushAndPull,
}

impl From<SyncMode> for PermissionFlag {
    fn from(mode: SyncMode) -> Self {
        match mode {
            SyncMode::Push | SyncMode::AutoPush => PermissionFlag::Push,
            SyncMode::Pull | SyncMode::AutoPull | SyncMode::ResponsePull => PermissionFlag::Pull,
            SyncMode::PushAndPull => PermissionFlag::PushAndPull,
        }
    }
}

/// Decides whether a device may be synced with.
pub trait PermissionCheck: Send + Sync {
    /// Returns true if syncing with `device` in direction `flag` is allowed.
    fn check(&self, device: &str, flag: PermissionFlag) -> bool;
}

impl<F> PermissionCheck for F
where
    F: Fn(&str, PermissionFlag) -> bool + Send + Sync,
{
    fn check(&self, device: &str, flag: PermissionFlag) -> bool {
        self(device, flag)
    }
}

struct EngineInner {
    config: SyncConfig,
    runtime: SyncRuntime,
    factory: Arc<dyn StateMachineFactory>,
    metadata: Arc<Metadata>,
    time_helper: Arc<TimeHelper>,
    permission: RwLock<Option<Arc<dyn PermissionCheck>>>,
    contexts: Mutex<HashMap<String, SyncTaskContext>>,
    time_listener: Mutex<Option<Listener>>,
    closed: AtomicBool,
}

/// Routes sync operations and messages to per-device contexts.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Creates an engine and subscribes it to clock-change events.
    ///
    /// # Errors
    ///
    /// Propagates bus errors from registering the listener.
    pub fn new(
        config: SyncConfig,
        runtime: SyncRuntime,
        factory: Arc<dyn StateMachineFactory>,
        metadata: Arc<Metadata>,
        time_helper: Arc<TimeHelper>,
    ) -> SyncResult<Self> {
        let bus = Arc::clone(&runtime.bus);
        let inner = Arc::new(EngineInner {
            config,
            runtime,
            factory,
            metadata,
            time_helper,
            permission: RwLock::new(None),
            contexts: Mutex::new(HashMap::new()),
            time_listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        match bus.register_event_type(TIME_CHANGED_EVENT) {
            Ok(()) | Err(CoreError::AlreadyRegistered { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let listener = bus.register_listener(TIME_CHANGED_EVENT, move |payload| {
            let EventPayload::TimeChanged(changed_micros) = payload else {
                return;
            };
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(err) = inner.time_helper.rebase_on_time_change(*changed_micros) {
                warn!(error = %err, "[SyncEngine] failed to re-base local time offset");
            }
        })?;
        *inner.time_listener.lock() = Some(listener);
        Ok(Self { inner })
    }

    /// Installs the permission hook consulted for every device.
    pub fn set_permission_check(&self, check: Arc<dyn PermissionCheck>) {
        *self.inner.permission.write() = Some(check);
    }

    /// Queues `operation` on the context of each of its devices.
    ///
    /// Devices rejected by the permission hook get
    /// [`SyncStatus::PermissionCheckFailed`]; devices whose context
    /// refuses the operation get [`SyncStatus::Failed`]. Neither is an
    /// error for the call as a whole.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ObjIsKilled`] once the engine is closed.
    pub fn add_sync_operation(&self, operation: &SyncOperation) -> SyncResult<()> {
        self.check_open()?;
        let flag = PermissionFlag::from(operation.mode());
        let permission = self.inner.permission.read().clone();
        for device in operation.devices() {
            if let Some(check) = &permission {
                if !check.check(&device, flag) {
                    info!(
                        device = %device,
                        sync_id = operation.sync_id(),
                        "[SyncEngine] permission check failed"
                    );
                    operation.set_status(&device, SyncStatus::PermissionCheckFailed);
                    continue;
                }
            }
            let added = self
                .get_or_create_context(&device)
                .and_then(|ctx| ctx.add_sync_operation(operation));
            if let Err(err) = added {
                warn!(
                    device = %device,
                    sync_id = operation.sync_id(),
                    error = %err,
                    "[SyncEngine] failed to queue sync operation"
                );
                operation.set_status(&device, SyncStatus::Failed);
            }
        }
        Ok(())
    }

    /// Removes a not-yet-started operation from every context.
    pub fn remove_sync_operation(&self, sync_id: SyncId) {
        for ctx in self.contexts() {
            if ctx.remove_sync_operation(sync_id) {
                debug!(device = ctx.device_id(), sync_id, "[SyncEngine] removed queued operation");
            }
        }
    }

    /// Delivers a message from `device` to its context.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgs`] for an empty device id,
    /// [`SyncError::ObjIsKilled`] once closed, and scheduling errors.
    pub fn receive_message(&self, device: &str, message: SyncMessage) -> SyncResult<()> {
        if device.is_empty() {
            return Err(SyncError::invalid_args("empty device id"));
        }
        self.check_open()?;
        self.get_or_create_context(device)?.receive_message(message)
    }

    /// Reports the outcome of a send or receive for `session_id`.
    pub fn comm_error(&self, device: &str, result: SyncResult<()>, session_id: u32) {
        match self.context(device) {
            Some(ctx) => ctx.comm_err_handler(result, session_id),
            None => debug!(device, "[SyncEngine] comm result for unknown device"),
        }
    }

    /// Context of `device`, if one was created.
    pub fn context(&self, device: &str) -> Option<SyncTaskContext> {
        self.inner.contexts.lock().get(device).cloned()
    }

    /// Number of device contexts.
    pub fn context_count(&self) -> usize {
        self.inner.contexts.lock().len()
    }

    /// Persisted metadata shared by all contexts.
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.inner.metadata
    }

    /// The runtime this engine schedules on.
    pub fn runtime(&self) -> &SyncRuntime {
        &self.inner.runtime
    }

    /// Unsubscribes from clock changes and kill-waits every context.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let listener = self.inner.time_listener.lock().take();
        if let Some(listener) = listener {
            listener.detach(true);
        }
        let contexts: Vec<SyncTaskContext> = self
            .inner
            .contexts
            .lock()
            .drain()
            .map(|(_, ctx)| ctx)
            .collect();
        info!(contexts = contexts.len(), "[SyncEngine] closing");
        for ctx in contexts {
            ctx.kill_and_wait();
        }
    }

    fn check_open(&self) -> SyncResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SyncError::ObjIsKilled);
        }
        Ok(())
    }

    fn contexts(&self) -> Vec<SyncTaskContext> {
        self.inner.contexts.lock().values().cloned().collect()
    }

    fn get_or_create_context(&self, device: &str) -> SyncResult<SyncTaskContext> {
        let mut contexts = self.inner.contexts.lock();
        self.check_open()?;
        if let Some(ctx) = contexts.get(device) {
            return Ok(ctx.clone());
        }
        let ctx = SyncTaskContext::new(
            device,
            self.inner.config.clone(),
            self.inner.factory.create(device),
            Arc::clone(&self.inner.runtime.timer),
            Arc::clone(&self.inner.runtime.pool),
            Arc::clone(&self.inner.metadata),
        );
        debug!(device, "[SyncEngine] context created");
        contexts.insert(device.to_string(), ctx.clone());
        Ok(ctx)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("contexts", &self.context_count())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{MockBehavior, MockStateMachine, SyncStateMachine};
    use crate::time_helper::ManualClock;
    use crate::timer::ManualTimer;
    use meshkv_storage::{KvStorage, MemoryStorage};
    use std::thread;
    use std::time::{Duration, Instant};

    struct Fixture {
        engine: SyncEngine,
        bus: Arc<NotificationChain>,
        pool: Arc<TaskPool>,
        metadata: Arc<Metadata>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new(behavior: MockBehavior) -> Self {
            let pool = Arc::new(TaskPool::new());
            pool.start(1, 4).unwrap();
            let bus = Arc::new(NotificationChain::new());
            let storage: Arc<dyn KvStorage> = Arc::new(MemoryStorage::with_max_timestamp(1_000));
            let clock = Arc::new(ManualClock::new(10_000_000));
            let metadata = Arc::new(Metadata::initialize(Arc::clone(&storage), clock.clone()).unwrap());
            let time_helper = Arc::new(
                TimeHelper::initialize(storage, Arc::clone(&metadata), clock.clone()).unwrap(),
            );
            let factory = move |_: &str| -> Arc<dyn SyncStateMachine> {
                Arc::new(MockStateMachine::new(behavior))
            };
            let engine = SyncEngine::new(
                SyncConfig::new(),
                SyncRuntime {
                    pool: Arc::clone(&pool),
                    timer: Arc::new(ManualTimer::new()),
                    bus: Arc::clone(&bus),
                },
                Arc::new(factory),
                Arc::clone(&metadata),
                time_helper,
            )
            .unwrap();
            Self {
                engine,
                bus,
                pool,
                metadata,
                clock,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.engine.close();
            self.pool.stop();
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn devices(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn one_context_per_device() {
        let fixture = Fixture::new(MockBehavior::Complete(SyncStatus::FinishedAll));
        let op = SyncOperation::new(1, &devices(&["a", "b"]), SyncMode::Push, false);
        fixture.engine.add_sync_operation(&op).unwrap();
        let again = SyncOperation::new(2, &devices(&["a"]), SyncMode::Pull, false);
        fixture.engine.add_sync_operation(&again).unwrap();

        assert!(wait_for(|| op.is_finished() && again.is_finished()));
        assert_eq!(fixture.engine.context_count(), 2);
    }

    #[test]
    fn permission_hook_rejects_device() {
        let fixture = Fixture::new(MockBehavior::Complete(SyncStatus::FinishedAll));
        fixture
            .engine
            .set_permission_check(Arc::new(|device: &str, flag: PermissionFlag| {
                !(device == "b" && flag == PermissionFlag::Push)
            }));
        let op = SyncOperation::new(1, &devices(&["a", "b"]), SyncMode::AutoPush, false);
        fixture.engine.add_sync_operation(&op).unwrap();

        assert!(wait_for(|| op.check_is_all_finished()));
        assert_eq!(op.status("a"), Some(SyncStatus::FinishedAll));
        assert_eq!(op.status("b"), Some(SyncStatus::PermissionCheckFailed));
        assert!(fixture.engine.context("b").is_none());
    }

    #[test]
    fn empty_device_message_is_rejected() {
        let fixture = Fixture::new(MockBehavior::Hang);
        assert!(matches!(
            fixture.engine.receive_message("", SyncMessage::new(1, 1, Vec::new())),
            Err(SyncError::InvalidArgs(_))
        ));
    }

    #[test]
    fn time_change_rebases_offset() {
        let fixture = Fixture::new(MockBehavior::Hang);
        assert_eq!(fixture.metadata.get_local_time_offset(), 0);
        fixture.clock.set(5_000_000);
        fixture
            .bus
            .notify_event(TIME_CHANGED_EVENT, &EventPayload::TimeChanged(-500_000));
        assert_eq!(fixture.metadata.get_local_time_offset(), 5_000_000);
    }

    #[test]
    fn closed_engine_refuses_work() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let op = SyncOperation::new(1, &devices(&["a"]), SyncMode::Push, false);
        fixture.engine.add_sync_operation(&op).unwrap();
        assert!(wait_for(|| op.status("a") == Some(SyncStatus::Syncing)));

        fixture.engine.close();

        assert_eq!(op.status("a"), Some(SyncStatus::Failed));
        assert_eq!(fixture.engine.context_count(), 0);
        assert_eq!(fixture.bus.listener_count(TIME_CHANGED_EVENT), 0);
        assert!(matches!(
            fixture.engine.add_sync_operation(&op),
            Err(SyncError::ObjIsKilled)
        ));
    }
}
