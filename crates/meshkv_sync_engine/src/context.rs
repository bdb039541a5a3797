//! Per-device sync task context.
//!
//! A [`SyncTaskContext`] owns the queue of sync targets for one remote
//! device and runs them one at a time on the task pool, under a tag of
//! its own. Request targets have priority over response targets.
//!
//! Every reentrant entry point (timer expiry, incoming message) holds an
//! [`InFlightGuard`] while it runs. [`SyncTaskContext::kill_and_wait`]
//! refuses new entries, stops the timer, aborts the protocol and then
//! waits (bounded) for those guards to drain.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult, TaskError};
use crate::metadata::Metadata;
use crate::operation::{SyncId, SyncMode, SyncOperation, SyncStatus};
use crate::state_machine::{SyncMessage, SyncStateMachine};
use crate::target::SyncTarget;
use crate::timer::{TimerAction, TimerId, TimerService};
use meshkv_core::{CoreError, InFlight, InFlightGuard, RefCounted, TaskPool};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Whether the context has work scheduled on the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskExecStatus {
    /// Never ran.
    Init,
    /// A run is scheduled or in progress.
    Running,
    /// The queues drained.
    Finished,
}

struct ContextState {
    request_queue: VecDeque<SyncTarget>,
    response_queue: VecDeque<SyncTarget>,
    current: Option<SyncTarget>,
    mode: SyncMode,
    sync_id: SyncId,
    is_auto_sync: bool,
    request_session_id: u32,
    response_session_id: u32,
    sequence_id: u32,
    retry_time: u32,
    task_error: TaskError,
    exec_status: TaskExecStatus,
    timer_id: Option<TimerId>,
    session_counter: u64,
}

impl ContextState {
    fn new() -> Self {
        Self {
            request_queue: VecDeque::new(),
            response_queue: VecDeque::new(),
            current: None,
            mode: SyncMode::Push,
            sync_id: 0,
            is_auto_sync: false,
            request_session_id: 0,
            response_session_id: 0,
            sequence_id: 1,
            retry_time: 0,
            task_error: TaskError::None,
            exec_status: TaskExecStatus::Init,
            timer_id: None,
            session_counter: 0,
        }
    }

    fn is_target_queue_empty(&self) -> bool {
        self.request_queue.is_empty() && self.response_queue.is_empty()
    }

    fn current_operation(&self) -> Option<SyncOperation> {
        self.current.as_ref().and_then(SyncTarget::operation).cloned()
    }

    /// Moves every target out, leaving the queues empty.
    fn take_targets(&mut self) -> Vec<SyncTarget> {
        let mut targets: Vec<SyncTarget> = self.current.take().into_iter().collect();
        targets.extend(self.request_queue.drain(..));
        targets.extend(self.response_queue.drain(..));
        targets
    }
}

struct ContextInner {
    device_id: String,
    task_tag: String,
    config: SyncConfig,
    machine: Arc<dyn SyncStateMachine>,
    timer: Arc<dyn TimerService>,
    pool: Arc<TaskPool>,
    metadata: Arc<Metadata>,
    in_flight: InFlight,
    state: Mutex<ContextState>,
    comm_normal: AtomicBool,
    remote_software_version: AtomicU32,
}

/// Sync state of one remote device.
#[derive(Clone)]
pub struct SyncTaskContext {
    inner: RefCounted<ContextInner>,
}

impl SyncTaskContext {
    /// Creates an idle context for `device_id`.
    pub fn new(
        device_id: &str,
        config: SyncConfig,
        machine: Arc<dyn SyncStateMachine>,
        timer: Arc<dyn TimerService>,
        pool: Arc<TaskPool>,
        metadata: Arc<Metadata>,
    ) -> Self {
        Self {
            inner: RefCounted::new(ContextInner {
                device_id: device_id.to_string(),
                task_tag: format!("sync-context:{device_id}"),
                config,
                machine,
                timer,
                pool,
                metadata,
                in_flight: InFlight::new(),
                state: Mutex::new(ContextState::new()),
                comm_normal: AtomicBool::new(true),
                remote_software_version: AtomicU32::new(0),
            }),
        }
    }

    /// Queues `operation` for this device.
    ///
    /// An auto sync whose work is already covered by a queued auto
    /// target is not queued again; this device is reported finished for
    /// it right away.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ObjIsKilled`] once killed, and pool errors if
    /// the context cannot be scheduled.
    pub fn add_sync_operation(&self, operation: &SyncOperation) -> SyncResult<()> {
        if self.is_killed() {
            return Err(SyncError::ObjIsKilled);
        }
        if operation.is_auto_sync() {
            let covered = self
                .inner
                .state
                .lock()
                .request_queue
                .iter()
                .filter_map(SyncTarget::operation)
                .any(|queued| !queued.is_killed() && queued.mode().covers(operation.mode()));
            if covered {
                debug!(
                    device = %self.inner.device_id,
                    sync_id = operation.sync_id(),
                    "[SyncTaskContext] auto sync merged into queued target"
                );
                operation.set_status(&self.inner.device_id, SyncStatus::FinishedAll);
                return Ok(());
            }
        }
        self.add_sync_target(SyncTarget::Request(operation.clone()))
    }

    /// Queues an answer to a pull started by the remote device.
    ///
    /// # Errors
    ///
    /// Same as [`SyncTaskContext::add_sync_target`].
    pub fn add_response_target(&self, session_id: u32) -> SyncResult<()> {
        self.add_sync_target(SyncTarget::Response { session_id })
    }

    /// Appends a target and schedules the context if it is idle.
    ///
    /// If the running session is retrying and the new target's mode is the
    /// same or [`SyncMode::PushAndPull`], its retry counter is reset and its
    /// timer restarted.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ObjIsKilled`] once killed, and pool errors if
    /// the context cannot be scheduled; the target is dropped then.
    pub fn add_sync_target(&self, target: SyncTarget) -> SyncResult<()> {
        if self.is_killed() {
            return Err(SyncError::ObjIsKilled);
        }
        let mode = target.mode();
        let is_response = target.is_response();
        let (needs_schedule, restart_timer) = {
            let mut state = self.inner.state.lock();
            if is_response {
                state.response_queue.push_back(target);
            } else {
                state.request_queue.push_back(target);
            }
            let mut restart_timer = None;
            let supersedes = mode == state.mode || mode == SyncMode::PushAndPull;
            if state.current.is_some() && supersedes && state.retry_time > 0 {
                state.retry_time = 0;
                let timeout = self.inner.config.session_timeout(state.is_auto_sync);
                restart_timer = state.timer_id.map(|id| (id, timeout));
            }
            let needs_schedule = state.exec_status != TaskExecStatus::Running;
            if needs_schedule {
                state.exec_status = TaskExecStatus::Running;
            }
            (needs_schedule, restart_timer)
        };

        if let Some((timer_id, timeout)) = restart_timer {
            debug!(
                device = %self.inner.device_id,
                "[SyncTaskContext] pending retry cancelled by new target"
            );
            if let Err(err) = self.inner.timer.modify_timer(timer_id, timeout) {
                warn!(error = %err, "[SyncTaskContext] failed to restart timer");
            }
        }
        if needs_schedule {
            if let Err(err) = self.schedule_exec() {
                let dropped = {
                    let mut state = self.inner.state.lock();
                    let queue = if is_response {
                        &mut state.response_queue
                    } else {
                        &mut state.request_queue
                    };
                    queue.pop_back()
                };
                drop(dropped);
                return Err(err);
            }
        }
        Ok(())
    }

    fn schedule_exec(&self) -> SyncResult<()> {
        let ctx = self.clone();
        let scheduled = self
            .inner
            .pool
            .schedule_keyed(self.inner.task_tag.clone(), move || ctx.exec_sync_task());
        if let Err(err) = scheduled {
            self.inner.state.lock().exec_status = TaskExecStatus::Finished;
            warn!(
                device = %self.inner.device_id,
                error = %err,
                "[SyncTaskContext] failed to schedule sync task"
            );
            return Err(err.into());
        }
        Ok(())
    }

    fn exec_sync_task(&self) {
        let Some(_guard) = self.inc_used_count() else {
            return;
        };
        let (next, skipped) = {
            let mut state = self.inner.state.lock();
            let moved = self.move_to_next_target(&mut state);
            if moved.0.is_none() {
                state.exec_status = TaskExecStatus::Finished;
            }
            moved
        };
        drop(skipped);
        let Some(target) = next else {
            return;
        };

        info!(
            device = %self.inner.device_id,
            sync_id = target.sync_id(),
            mode = ?target.mode(),
            session_id = self.request_session_id(),
            "[SyncTaskContext] start sync"
        );
        self.set_operation_status(SyncStatus::Syncing);
        if let Err(err) = self.start_timer() {
            self.fail_current(&err);
            return;
        }
        if let Err(err) = self.inner.machine.start_sync(self) {
            self.fail_current(&err);
        }
    }

    /// Pops the next live target into the current slot. Returns it, and
    /// the killed targets skipped on the way (to be dropped unlocked).
    fn move_to_next_target(&self, state: &mut ContextState) -> (Option<SyncTarget>, Vec<SyncTarget>) {
        let mut skipped: Vec<SyncTarget> = state.current.take().into_iter().collect();
        loop {
            let next = match state.request_queue.pop_front() {
                Some(target) => Some(target),
                None => state.response_queue.pop_front(),
            };
            let Some(target) = next else {
                return (None, skipped);
            };
            if target.is_killed() {
                debug!(
                    device = %self.inner.device_id,
                    sync_id = target.sync_id(),
                    "[SyncTaskContext] skipping killed target"
                );
                skipped.push(target);
                continue;
            }
            state.mode = target.mode();
            state.sync_id = target.sync_id();
            state.is_auto_sync = target.is_auto_sync();
            if let SyncTarget::Response { session_id } = &target {
                state.response_session_id = *session_id;
            }
            state.session_counter += 1;
            state.request_session_id =
                session_hash(&self.inner.device_id, state.session_counter, state.sync_id);
            state.sequence_id = 1;
            state.retry_time = 0;
            state.task_error = TaskError::None;
            state.current = Some(target.clone());
            return (Some(target), skipped);
        }
    }

    fn fail_current(&self, err: &SyncError) {
        warn!(
            device = %self.inner.device_id,
            error = %err,
            "[SyncTaskContext] sync session failed to start"
        );
        self.set_task_error(err.task_error());
        self.abort(self.inner_err_status());
        self.finish_target();
    }

    /// Ends the current target and schedules the next one, if any.
    pub fn finish_target(&self) {
        self.stop_timer();
        let (finished, reschedule) = {
            let mut state = self.inner.state.lock();
            let finished = state.current.take();
            if finished.is_none() {
                return;
            }
            let reschedule = !state.is_target_queue_empty() && !self.is_killed();
            if !reschedule {
                state.exec_status = TaskExecStatus::Finished;
            }
            (finished, reschedule)
        };
        drop(finished);
        if reschedule && self.schedule_exec().is_err() {
            self.fail_queued_targets();
        }
    }

    /// Fails this device on every queued request and drops the queues.
    fn fail_queued_targets(&self) {
        let targets = self.inner.state.lock().take_targets();
        for operation in targets.iter().filter_map(SyncTarget::operation) {
            operation.set_status(&self.inner.device_id, SyncStatus::Failed);
            if operation.check_is_all_finished() {
                operation.finished();
            }
        }
    }

    /// Reports `status` for this device on the current operation, then
    /// finishes the operation if every device is done.
    pub fn set_operation_status(&self, status: SyncStatus) {
        let (operation, key_revoked) = {
            let state = self.inner.state.lock();
            (
                state.current_operation(),
                state.task_error == TaskError::KeyRevoked,
            )
        };
        let Some(operation) = operation else {
            return;
        };
        operation.merge_status(&self.inner.device_id, status, key_revoked);
        if operation.check_is_all_finished() {
            operation.finished();
        }
    }

    /// Ends this device's part of the current operation with `status`.
    pub fn abort(&self, status: SyncStatus) {
        debug!(
            device = %self.inner.device_id,
            status = ?status,
            "[SyncTaskContext] abort"
        );
        self.set_operation_status(status);
    }

    /// Status matching the last recorded task error.
    pub fn inner_err_status(&self) -> SyncStatus {
        match self.task_error() {
            TaskError::KeyRevoked => SyncStatus::EKeyRevokedFailure,
            TaskError::Busy => SyncStatus::BusyFailure,
            TaskError::Timeout => SyncStatus::Timeout,
            TaskError::None | TaskError::Other => {
                if self.is_comm_normal() {
                    SyncStatus::Failed
                } else {
                    SyncStatus::CommAbnormal
                }
            }
        }
    }

    /// Drops every target and resets the session fields.
    pub fn clear(&self) {
        self.stop_timer();
        let targets = {
            let mut state = self.inner.state.lock();
            let targets = state.take_targets();
            state.sync_id = 0;
            state.is_auto_sync = false;
            state.request_session_id = 0;
            state.response_session_id = 0;
            state.sequence_id = 1;
            state.retry_time = 0;
            state.task_error = TaskError::None;
            if state.exec_status != TaskExecStatus::Running {
                state.exec_status = TaskExecStatus::Init;
            }
            targets
        };
        drop(targets);
    }

    /// Removes a not-yet-started request. Returns true if one was found.
    pub fn remove_sync_operation(&self, sync_id: SyncId) -> bool {
        let removed: Vec<SyncTarget> = {
            let mut state = self.inner.state.lock();
            let (removed, kept): (VecDeque<_>, VecDeque<_>) = state
                .request_queue
                .drain(..)
                .partition(|target| target.sync_id() == sync_id);
            state.request_queue = kept;
            removed.into_iter().collect()
        };
        !removed.is_empty()
    }

    /// Starts the session timer for the current target.
    ///
    /// # Errors
    ///
    /// Propagates timer-service errors.
    pub fn start_timer(&self) -> SyncResult<()> {
        self.stop_timer();
        let weak = self.inner.downgrade();
        let action: TimerAction = Box::new(move |timer_id| {
            let inner = weak.upgrade().map_err(|_| SyncError::ObjIsKilled)?;
            SyncTaskContext { inner }.on_timer_fired(timer_id)
        });
        // Held while the timer is set so an early expiry sees the id.
        let mut state = self.inner.state.lock();
        let timeout = self.inner.config.session_timeout(state.is_auto_sync);
        state.timer_id = Some(self.inner.timer.set_timer(timeout, action, None)?);
        Ok(())
    }

    /// Stops the session timer, if any.
    pub fn stop_timer(&self) {
        let timer_id = self.inner.state.lock().timer_id.take();
        if let Some(timer_id) = timer_id {
            self.inner.timer.remove_timer(timer_id);
        }
    }

    /// Changes the session timeout and restarts the countdown.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if no timer is running.
    pub fn modify_timer(&self, timeout: Duration) -> SyncResult<()> {
        let timer_id = self
            .inner
            .state
            .lock()
            .timer_id
            .ok_or_else(|| CoreError::not_found("session timer"))?;
        self.inner.timer.modify_timer(timer_id, timeout)
    }

    fn on_timer_fired(&self, timer_id: TimerId) -> SyncResult<()> {
        if self.is_killed() {
            return Err(SyncError::ObjIsKilled);
        }
        if self.inner.state.lock().timer_id != Some(timer_id) {
            return Err(SyncError::Internal(format!("stale timer {timer_id}")));
        }
        let guard = self.inc_used_count().ok_or(SyncError::ObjIsKilled)?;
        let ctx = self.clone();
        self.inner
            .pool
            .schedule_keyed(self.inner.task_tag.clone(), move || {
                let _guard = guard;
                ctx.inner.machine.time_out(&ctx);
            })?;
        Ok(())
    }

    /// Registers a reentrant user. `None` once the context is killed.
    pub fn inc_used_count(&self) -> Option<InFlightGuard> {
        if self.is_killed() {
            return None;
        }
        self.inner.in_flight.enter()
    }

    /// Hands a message from the remote device to the state machine on the
    /// pool.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ObjIsKilled`] once killed, and pool errors.
    pub fn receive_message(&self, message: SyncMessage) -> SyncResult<()> {
        let guard = self.inc_used_count().ok_or(SyncError::ObjIsKilled)?;
        let ctx = self.clone();
        self.inner
            .pool
            .schedule_keyed(self.inner.task_tag.clone(), move || {
                let _guard = guard;
                if let Err(err) = ctx.inner.machine.receive_message(&ctx, &message) {
                    warn!(
                        device = %ctx.inner.device_id,
                        session_id = message.session_id,
                        error = %err,
                        "[SyncTaskContext] message handling failed"
                    );
                }
            })?;
        Ok(())
    }

    /// Handles a send/receive outcome reported by the communicator.
    /// Outcomes for a session other than the current request session are
    /// ignored.
    pub fn comm_err_handler(&self, result: SyncResult<()>, session_id: u32) {
        let Some(_guard) = self.inc_used_count() else {
            return;
        };
        if session_id != self.request_session_id() {
            debug!(
                device = %self.inner.device_id,
                session_id,
                "[SyncTaskContext] ignoring comm result for stale session"
            );
            return;
        }
        match result {
            Ok(()) => self.inner.comm_normal.store(true, Ordering::Release),
            Err(err) => {
                warn!(
                    device = %self.inner.device_id,
                    session_id,
                    error = %err,
                    "[SyncTaskContext] communication error"
                );
                self.inner.comm_normal.store(false, Ordering::Release);
                if err.is_key_revoked() {
                    self.set_task_error(TaskError::KeyRevoked);
                }
                self.inner.machine.comm_err_abort(self);
            }
        }
    }

    /// Kills the context and waits (bounded) for in-flight callbacks.
    /// Targets still queued fail for this device.
    pub fn kill_and_wait(&self) {
        info!(device = %self.inner.device_id, "[SyncTaskContext] kill and wait");
        self.inner.kill();
        self.inner.in_flight.close();
        self.stop_timer();
        self.inner.machine.abort(self);
        if !self
            .inner
            .in_flight
            .wait_drained(self.inner.config.kill_wait_timeout)
        {
            warn!(
                device = %self.inner.device_id,
                "[SyncTaskContext] callbacks still running after kill wait"
            );
        }

        self.fail_queued_targets();
        self.clear();
    }

    /// Remote device this context syncs with.
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Pool tag under which this context runs.
    pub fn task_tag(&self) -> &str {
        &self.inner.task_tag
    }

    /// Persisted metadata of the store.
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.inner.metadata
    }

    /// Mode of the current target.
    pub fn mode(&self) -> SyncMode {
        self.inner.state.lock().mode
    }

    /// Sync id of the current target.
    pub fn sync_id(&self) -> SyncId {
        self.inner.state.lock().sync_id
    }

    /// True if the current target is an auto sync.
    pub fn is_auto_sync(&self) -> bool {
        self.inner.state.lock().is_auto_sync
    }

    /// The target being synced.
    pub fn current_target(&self) -> Option<SyncTarget> {
        self.inner.state.lock().current.clone()
    }

    /// The operation being synced.
    pub fn current_operation(&self) -> Option<SyncOperation> {
        self.inner.state.lock().current_operation()
    }

    /// Number of queued targets, excluding the current one.
    pub fn queued_target_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.request_queue.len() + state.response_queue.len()
    }

    /// True if nothing is queued.
    pub fn is_target_queue_empty(&self) -> bool {
        self.inner.state.lock().is_target_queue_empty()
    }

    /// Session id of the current local request.
    pub fn request_session_id(&self) -> u32 {
        self.inner.state.lock().request_session_id
    }

    /// Session id chosen by the remote device for the current response.
    pub fn response_session_id(&self) -> u32 {
        self.inner.state.lock().response_session_id
    }

    /// Sequence id within the current session.
    pub fn sequence_id(&self) -> u32 {
        self.inner.state.lock().sequence_id
    }

    /// Moves to the next sequence id and returns it.
    pub fn inc_sequence_id(&self) -> u32 {
        let mut state = self.inner.state.lock();
        state.sequence_id += 1;
        state.sequence_id
    }

    /// Retries spent on the current target.
    pub fn retry_time(&self) -> u32 {
        self.inner.state.lock().retry_time
    }

    /// Counts one retry.
    pub fn inc_retry_time(&self) {
        self.inner.state.lock().retry_time += 1;
    }

    /// True while the current auto sync has retries left.
    pub fn is_retry_allowed(&self) -> bool {
        let state = self.inner.state.lock();
        state.is_auto_sync && state.retry_time < self.inner.config.max_auto_retry
    }

    /// Last recorded error of the current target.
    pub fn task_error(&self) -> TaskError {
        self.inner.state.lock().task_error
    }

    /// Records an error for the current target.
    pub fn set_task_error(&self, error: TaskError) {
        self.inner.state.lock().task_error = error;
    }

    /// Whether work is scheduled.
    pub fn exec_status(&self) -> TaskExecStatus {
        self.inner.state.lock().exec_status
    }

    /// Live session timer, if any.
    pub fn timer_id(&self) -> Option<TimerId> {
        self.inner.state.lock().timer_id
    }

    /// False after the communicator reported an error.
    pub fn is_comm_normal(&self) -> bool {
        self.inner.comm_normal.load(Ordering::Acquire)
    }

    /// Software version announced by the remote device.
    pub fn remote_software_version(&self) -> u32 {
        self.inner.remote_software_version.load(Ordering::Acquire)
    }

    /// Records the software version announced by the remote device.
    pub fn set_remote_software_version(&self, version: u32) {
        self.inner
            .remote_software_version
            .store(version, Ordering::Release);
    }

    /// True once killed.
    pub fn is_killed(&self) -> bool {
        self.inner.is_killed()
    }
}

impl fmt::Debug for SyncTaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SyncTaskContext")
            .field("device_id", &self.inner.device_id)
            .field("sync_id", &state.sync_id)
            .field("mode", &state.mode)
            .field("exec_status", &state.exec_status)
            .field("queued", &(state.request_queue.len() + state.response_queue.len()))
            .field("killed", &self.inner.is_killed())
            .finish()
    }
}

fn session_hash(device: &str, counter: u64, sync_id: SyncId) -> u32 {
    let digest = Sha256::new()
        .chain_update(device.as_bytes())
        .chain_update(counter.to_le_bytes())
        .chain_update(sync_id.to_le_bytes())
        .finalize();
    let id = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
    id.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{MachineCall, MockBehavior, MockFailure, MockStateMachine};
    use crate::time_helper::ManualClock;
    use crate::timer::ManualTimer;
    use meshkv_storage::MemoryStorage;
    use std::thread;
    use std::time::Instant;

    const DEVICE: &str = "device-a";

    struct Fixture {
        ctx: SyncTaskContext,
        machine: Arc<MockStateMachine>,
        timer: Arc<ManualTimer>,
        pool: Arc<TaskPool>,
    }

    impl Fixture {
        fn new(behavior: MockBehavior) -> Self {
            Self::with_config(behavior, SyncConfig::new())
        }

        fn with_config(behavior: MockBehavior, config: SyncConfig) -> Self {
            let pool = Arc::new(TaskPool::new());
            pool.start(1, 4).unwrap();
            let machine = Arc::new(MockStateMachine::new(behavior));
            let timer = Arc::new(ManualTimer::new());
            let metadata = Arc::new(
                Metadata::initialize(Arc::new(MemoryStorage::new()), Arc::new(ManualClock::new(1)))
                    .unwrap(),
            );
            let ctx = SyncTaskContext::new(
                DEVICE,
                config,
                machine.clone(),
                timer.clone(),
                Arc::clone(&pool),
                metadata,
            );
            Self {
                ctx,
                machine,
                timer,
                pool,
            }
        }

        fn operation(&self, sync_id: SyncId, mode: SyncMode) -> SyncOperation {
            SyncOperation::new(sync_id, &[DEVICE.to_string()], mode, false)
        }

        fn wait_timer(&self) -> TimerId {
            assert!(wait_for(|| self.ctx.timer_id().is_some()));
            self.ctx.timer_id().unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.ctx.kill_and_wait();
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

    #[test]
    fn operation_completes_on_pool() {
        let fixture = Fixture::new(MockBehavior::Complete(SyncStatus::FinishedAll));
        let op = fixture.operation(1, SyncMode::Push);
        fixture.ctx.add_sync_operation(&op).unwrap();

        assert!(wait_for(|| op.is_finished()));
        assert_eq!(op.status(DEVICE), Some(SyncStatus::FinishedAll));
        assert!(wait_for(|| fixture.ctx.exec_status() == TaskExecStatus::Finished));
        assert!(fixture.ctx.timer_id().is_none());
    }

    #[test]
    fn targets_run_in_order() {
        let fixture = Fixture::new(MockBehavior::CompleteLegs);
        let ops: Vec<_> = (1..=3)
            .map(|id| fixture.operation(id, SyncMode::PushAndPull))
            .collect();
        for op in &ops {
            fixture.ctx.add_sync_operation(op).unwrap();
        }
        assert!(wait_for(|| ops.iter().all(SyncOperation::is_finished)));

        let started: Vec<SyncId> = fixture
            .machine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                MachineCall::StartSync { sync_id, .. } => Some(sync_id),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec![1, 2, 3]);
    }

    #[test]
    fn manual_sync_times_out_without_retry() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let op = fixture.operation(1, SyncMode::Pull);
        fixture.ctx.add_sync_operation(&op).unwrap();

        let timer_id = fixture.wait_timer();
        assert_eq!(fixture.timer.duration(timer_id), Some(Duration::from_secs(30)));
        assert!(fixture.timer.fire(timer_id));

        assert!(wait_for(|| op.is_finished()));
        assert_eq!(op.status(DEVICE), Some(SyncStatus::Timeout));
    }

    #[test]
    fn auto_sync_retries_before_timing_out() {
        let fixture = Fixture::with_config(MockBehavior::Hang, SyncConfig::new().with_max_auto_retry(2));
        let op = fixture.operation(1, SyncMode::AutoPush);
        fixture.ctx.add_sync_operation(&op).unwrap();

        let timer_id = fixture.wait_timer();
        assert_eq!(fixture.timer.duration(timer_id), Some(Duration::from_secs(5)));
        for expected in 1..=2 {
            assert!(fixture.timer.fire(timer_id));
            assert!(wait_for(|| fixture.ctx.retry_time() == expected));
        }
        assert_eq!(op.status(DEVICE), Some(SyncStatus::Syncing));

        assert!(fixture.timer.fire(timer_id));
        assert!(wait_for(|| op.is_finished()));
        assert_eq!(op.status(DEVICE), Some(SyncStatus::Timeout));
    }

    #[test]
    fn queued_auto_sync_absorbs_duplicate() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let running = fixture.operation(1, SyncMode::Pull);
        fixture.ctx.add_sync_operation(&running).unwrap();
        fixture.wait_timer();

        let queued = fixture.operation(2, SyncMode::AutoPush);
        fixture.ctx.add_sync_operation(&queued).unwrap();
        let duplicate = fixture.operation(3, SyncMode::AutoPush);
        fixture.ctx.add_sync_operation(&duplicate).unwrap();

        assert_eq!(duplicate.status(DEVICE), Some(SyncStatus::FinishedAll));
        assert_eq!(fixture.ctx.queued_target_count(), 1);
    }

    #[test]
    fn new_target_cancels_pending_retry() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let op = fixture.operation(1, SyncMode::AutoPull);
        fixture.ctx.add_sync_operation(&op).unwrap();
        let timer_id = fixture.wait_timer();
        assert!(fixture.timer.fire(timer_id));
        assert!(wait_for(|| fixture.ctx.retry_time() == 1));

        let next = fixture.operation(2, SyncMode::AutoPull);
        fixture.ctx.add_sync_operation(&next).unwrap();
        assert_eq!(fixture.ctx.retry_time(), 0);
        assert_eq!(fixture.ctx.queued_target_count(), 1);
    }

    #[test]
    fn push_and_pull_target_cancels_auto_retry() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let op = fixture.operation(1, SyncMode::AutoPull);
        fixture.ctx.add_sync_operation(&op).unwrap();
        let timer_id = fixture.wait_timer();
        assert!(fixture.timer.fire(timer_id));
        assert!(wait_for(|| fixture.ctx.retry_time() == 1));

        let next = fixture.operation(2, SyncMode::PushAndPull);
        fixture.ctx.add_sync_operation(&next).unwrap();
        assert_eq!(fixture.ctx.retry_time(), 0);
    }

    #[test]
    fn other_direction_keeps_auto_retry() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let op = fixture.operation(1, SyncMode::AutoPull);
        fixture.ctx.add_sync_operation(&op).unwrap();
        let timer_id = fixture.wait_timer();
        assert!(fixture.timer.fire(timer_id));
        assert!(wait_for(|| fixture.ctx.retry_time() == 1));

        let next = fixture.operation(2, SyncMode::Push);
        fixture.ctx.add_sync_operation(&next).unwrap();
        assert_eq!(fixture.ctx.retry_time(), 1);
    }

    #[test]
    fn key_revoked_start_failure() {
        let fixture = Fixture::new(MockBehavior::FailStart(MockFailure::KeyRevoked));
        let op = fixture.operation(1, SyncMode::Push);
        fixture.ctx.add_sync_operation(&op).unwrap();
        assert!(wait_for(|| op.is_finished()));
        assert_eq!(op.status(DEVICE), Some(SyncStatus::EKeyRevokedFailure));
    }

    #[test]
    fn stale_session_comm_error_is_ignored() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let op = fixture.operation(1, SyncMode::Push);
        fixture.ctx.add_sync_operation(&op).unwrap();
        fixture.wait_timer();
        let session_id = fixture.ctx.request_session_id();

        fixture
            .ctx
            .comm_err_handler(Err(SyncError::Timeout), session_id.wrapping_add(1));
        assert!(fixture.ctx.is_comm_normal());
        assert_eq!(op.status(DEVICE), Some(SyncStatus::Syncing));

        fixture
            .ctx
            .comm_err_handler(Err(SyncError::Internal("link down".into())), session_id);
        assert!(!fixture.ctx.is_comm_normal());
        assert!(wait_for(|| op.is_finished()));
        assert_eq!(op.status(DEVICE), Some(SyncStatus::CommAbnormal));
    }

    #[test]
    fn removed_operation_never_starts() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let running = fixture.operation(1, SyncMode::Push);
        fixture.ctx.add_sync_operation(&running).unwrap();
        fixture.wait_timer();

        let queued = fixture.operation(2, SyncMode::Push);
        fixture.ctx.add_sync_operation(&queued).unwrap();
        assert!(fixture.ctx.remove_sync_operation(2));
        assert!(!fixture.ctx.remove_sync_operation(2));
        assert!(fixture.ctx.is_target_queue_empty());
    }

    #[test]
    fn kill_and_wait_fails_queued_targets() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let running = fixture.operation(1, SyncMode::Push);
        fixture.ctx.add_sync_operation(&running).unwrap();
        fixture.wait_timer();
        let queued = fixture.operation(2, SyncMode::Push);
        fixture.ctx.add_sync_operation(&queued).unwrap();

        fixture.ctx.kill_and_wait();

        assert_eq!(running.status(DEVICE), Some(SyncStatus::Failed));
        assert_eq!(queued.status(DEVICE), Some(SyncStatus::Failed));
        assert!(queued.is_finished());
        assert!(fixture.machine.calls().contains(&MachineCall::Abort));
        assert!(fixture.timer.active_timers().is_empty());
        assert!(matches!(
            fixture.ctx.add_sync_operation(&fixture.operation(3, SyncMode::Push)),
            Err(SyncError::ObjIsKilled)
        ));
        assert!(fixture.ctx.inc_used_count().is_none());
    }

    #[test]
    fn unschedulable_queue_is_failed() {
        let fixture = Fixture::new(MockBehavior::Hang);
        let running = fixture.operation(1, SyncMode::Push);
        fixture.ctx.add_sync_operation(&running).unwrap();
        fixture.wait_timer();
        let queued = fixture.operation(2, SyncMode::Push);
        fixture.ctx.add_sync_operation(&queued).unwrap();
        fixture.pool.stop();

        fixture.ctx.finish_target();

        assert!(queued.is_finished());
        assert_eq!(queued.status(DEVICE), Some(SyncStatus::Failed));
        assert_eq!(fixture.ctx.queued_target_count(), 0);
        assert_eq!(fixture.ctx.exec_status(), TaskExecStatus::Finished);
    }

    #[test]
    fn remote_pull_becomes_response_target() {
        let fixture = Fixture::new(MockBehavior::Complete(SyncStatus::FinishedAll));
        fixture
            .ctx
            .receive_message(SyncMessage::new(77, 1, b"pull".to_vec()))
            .unwrap();

        assert!(wait_for(|| fixture.machine.start_count() == 1));
        assert!(wait_for(|| fixture.ctx.exec_status() == TaskExecStatus::Finished));
        assert_eq!(fixture.ctx.response_session_id(), 77);
        assert!(fixture.machine.calls().contains(&MachineCall::StartSync {
            sync_id: 0,
            mode: SyncMode::ResponsePull,
        }));
    }

    #[test]
    fn session_ids_are_nonzero_and_distinct() {
        let a = session_hash(DEVICE, 1, 1);
        let b = session_hash(DEVICE, 2, 1);
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }
}
