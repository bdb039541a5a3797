//! One sync request and the per-device progress it tracks.

use meshkv_core::{CoreResult, RefCounted};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;

/// Identifies a sync request within one syncer.
pub type SyncId = u32;

/// Final or current status per device.
pub type DeviceStatuses = BTreeMap<String, SyncStatus>;

/// User callback run once when every device finished.
pub type SyncCallback = Box<dyn FnOnce(&DeviceStatuses) + Send>;

type FinishedHook = Box<dyn FnOnce(SyncId) + Send>;

/// Direction of a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Send local changes.
    Push,
    /// Fetch remote changes.
    Pull,
    /// Both directions.
    PushAndPull,
    /// Push triggered by a local data change.
    AutoPush,
    /// Pull triggered by a remote data-change notice.
    AutoPull,
    /// Answer to a remote pull. Internal only.
    ResponsePull,
}

impl SyncMode {
    /// Auto modes get the short session timeout and may be retried.
    pub fn is_auto(self) -> bool {
        matches!(self, SyncMode::AutoPush | SyncMode::AutoPull)
    }

    /// User-requested modes.
    pub fn is_manual(self) -> bool {
        matches!(self, SyncMode::Push | SyncMode::Pull | SyncMode::PushAndPull)
    }

    /// Modes accepted by [`crate::Syncer::sync`].
    pub fn is_user_selectable(self) -> bool {
        self != SyncMode::ResponsePull
    }

    /// Returns true if a sync in this mode does everything a sync in
    /// `other` would.
    pub fn covers(self, other: SyncMode) -> bool {
        self == other
            || (self == SyncMode::PushAndPull && matches!(other, SyncMode::Push | SyncMode::Pull))
    }
}

/// Progress of one device within a sync request.
///
/// Declaration order matters: every status from
/// [`SyncStatus::FinishedAll`] on is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncStatus {
    /// Queued.
    Waiting,
    /// Session running.
    Syncing,
    /// Local changes sent.
    SendFinished,
    /// Remote changes received.
    RecvFinished,
    /// Done.
    FinishedAll,
    /// Failed for an unspecified reason.
    Failed,
    /// The session timed out.
    Timeout,
    /// The permission hook rejected the device.
    PermissionCheckFailed,
    /// The communicator reported an error.
    CommAbnormal,
    /// The security options of the two sides do not match.
    SecurityOptionCheckFailure,
    /// Platform access to the storage keys was revoked.
    EKeyRevokedFailure,
    /// The remote side was busy.
    BusyFailure,
    /// The schemas of the two sides are incompatible.
    SchemaIncompatible,
}

impl SyncStatus {
    /// Returns true for statuses that end a device's sync.
    pub fn is_terminal(self) -> bool {
        self >= SyncStatus::FinishedAll
    }
}

/// Status a device moves to when `incoming` is reported while it is at
/// `current`.
///
/// Finishing the second leg (send after receive, or receive after send)
/// completes the device, unless the task recorded a key revocation, in
/// which case it fails with [`SyncStatus::EKeyRevokedFailure`]. Only that
/// leg-to-leg step consults `key_revoked`; a revocation seen while still
/// [`SyncStatus::Syncing`] has no effect here.
pub fn promote(current: SyncStatus, incoming: SyncStatus, key_revoked: bool) -> SyncStatus {
    match (current, incoming) {
        (SyncStatus::SendFinished, SyncStatus::RecvFinished)
        | (SyncStatus::RecvFinished, SyncStatus::SendFinished) => {
            if key_revoked {
                SyncStatus::EKeyRevokedFailure
            } else {
                SyncStatus::FinishedAll
            }
        }
        _ => incoming,
    }
}

struct OperationState {
    statuses: DeviceStatuses,
    is_finished: bool,
    is_notified: bool,
    user_callback: Option<SyncCallback>,
    on_finished: Option<FinishedHook>,
}

struct OperationInner {
    sync_id: SyncId,
    mode: SyncMode,
    is_blocking: bool,
    state: Mutex<OperationState>,
    finished_cv: Condvar,
}

/// A sync request over a set of devices.
///
/// Cloning retains; the request is torn down with
/// [`SyncOperation::kill`].
#[derive(Clone)]
pub struct SyncOperation {
    inner: RefCounted<OperationInner>,
}

impl SyncOperation {
    /// Creates a request with every device [`SyncStatus::Waiting`].
    pub fn new(sync_id: SyncId, devices: &[String], mode: SyncMode, is_blocking: bool) -> Self {
        let statuses = devices
            .iter()
            .map(|device| (device.clone(), SyncStatus::Waiting))
            .collect();
        Self {
            inner: RefCounted::new(OperationInner {
                sync_id,
                mode,
                is_blocking,
                state: Mutex::new(OperationState {
                    statuses,
                    is_finished: false,
                    is_notified: false,
                    user_callback: None,
                    on_finished: None,
                }),
                finished_cv: Condvar::new(),
            }),
        }
    }

    /// Sync id.
    pub fn sync_id(&self) -> SyncId {
        self.inner.sync_id
    }

    /// Sync mode.
    pub fn mode(&self) -> SyncMode {
        self.inner.mode
    }

    /// True if the caller of `sync` waits for completion.
    pub fn is_blocking(&self) -> bool {
        self.inner.is_blocking
    }

    /// True for auto syncs.
    pub fn is_auto_sync(&self) -> bool {
        self.inner.mode.is_auto()
    }

    /// Devices of this request.
    pub fn devices(&self) -> Vec<String> {
        self.inner.state.lock().statuses.keys().cloned().collect()
    }

    /// Status of one device.
    pub fn status(&self, device: &str) -> Option<SyncStatus> {
        self.inner.state.lock().statuses.get(device).copied()
    }

    /// Snapshot of every device's status.
    pub fn statuses(&self) -> DeviceStatuses {
        self.inner.state.lock().statuses.clone()
    }

    /// True once killed.
    pub fn is_killed(&self) -> bool {
        self.inner.is_killed()
    }

    /// True once [`SyncOperation::finished`] ran.
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().is_finished
    }

    /// Sets a device status. No-op once killed, for unknown devices, and
    /// for devices that already reached a terminal status.
    pub fn set_status(&self, device: &str, status: SyncStatus) {
        self.update_status(device, |_| status);
    }

    /// Applies [`promote`] to a device status under the operation lock.
    /// Returns the resulting status.
    pub fn merge_status(&self, device: &str, status: SyncStatus, key_revoked: bool) -> Option<SyncStatus> {
        self.update_status(device, |current| promote(current, status, key_revoked))
    }

    fn update_status<F>(&self, device: &str, next: F) -> Option<SyncStatus>
    where
        F: FnOnce(SyncStatus) -> SyncStatus,
    {
        if self.is_killed() {
            return None;
        }
        let mut state = self.inner.state.lock();
        let current = state.statuses.get_mut(device)?;
        if !current.is_terminal() {
            *current = next(*current);
        }
        Some(*current)
    }

    /// True iff every device reached a terminal status.
    pub fn check_is_all_finished(&self) -> bool {
        self.inner
            .state
            .lock()
            .statuses
            .values()
            .all(|status| status.is_terminal())
    }

    /// Runs the user callback, then the internal finished hook, exactly
    /// once. No-op once killed.
    pub fn finished(&self) {
        let (callback, hook, statuses) = {
            let mut state = self.inner.state.lock();
            if state.is_finished || self.is_killed() {
                return;
            }
            state.is_finished = true;
            (
                state.user_callback.take(),
                state.on_finished.take(),
                state.statuses.clone(),
            )
        };
        if let Some(callback) = callback {
            callback(&statuses);
        }
        if let Some(hook) = hook {
            hook(self.inner.sync_id);
        }
        self.notify_if_needed();
    }

    /// Parks a blocking caller until the request's callback ran or the
    /// request was killed.
    pub fn wait_if_needed(&self) {
        if !self.inner.is_blocking {
            return;
        }
        let mut state = self.inner.state.lock();
        while !state.is_notified && !self.is_killed() {
            self.inner.finished_cv.wait(&mut state);
        }
    }

    /// Wakes a caller parked in [`SyncOperation::wait_if_needed`].
    pub fn notify_if_needed(&self) {
        if self.inner.is_blocking {
            let mut state = self.inner.state.lock();
            state.is_notified = true;
            self.inner.finished_cv.notify_all();
        }
    }

    /// Sets the callback run with the final statuses.
    pub fn set_user_callback<F>(&self, callback: F)
    where
        F: FnOnce(&DeviceStatuses) + Send + 'static,
    {
        self.inner.state.lock().user_callback = Some(Box::new(callback));
    }

    /// Sets the internal hook run after the user callback.
    pub fn set_on_finished<F>(&self, hook: F)
    where
        F: FnOnce(SyncId) + Send + 'static,
    {
        self.inner.state.lock().on_finished = Some(Box::new(hook));
    }

    /// Registers a handler run when the request is killed.
    ///
    /// # Errors
    ///
    /// Returns [`meshkv_core::CoreError::ObjIsKilled`] if already killed.
    pub fn on_kill<F>(&self, handler: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.on_kill(handler)
    }

    /// Registers a handler run when the last handle is dropped.
    pub fn set_on_finalize<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.on_last_ref(handler);
    }

    /// Kills the request and wakes any blocked caller.
    pub fn kill(&self) {
        self.inner.kill();
        let _state = self.inner.state.lock();
        self.inner.finished_cv.notify_all();
    }

    /// Kills the request and releases this handle.
    pub fn kill_and_release(self) {
        self.kill();
    }

    /// Returns true if both handles refer to the same request.
    pub fn same(&self, other: &SyncOperation) -> bool {
        RefCounted::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOperation")
            .field("sync_id", &self.inner.sync_id)
            .field("mode", &self.inner.mode)
            .field("statuses", &self.statuses())
            .field("killed", &self.is_killed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn devices(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn second_leg_completes_device() {
        let op = SyncOperation::new(1, &devices(&["a"]), SyncMode::PushAndPull, false);
        op.merge_status("a", SyncStatus::Syncing, false);
        op.merge_status("a", SyncStatus::RecvFinished, false);
        assert_eq!(
            op.merge_status("a", SyncStatus::SendFinished, false),
            Some(SyncStatus::FinishedAll)
        );
    }

    #[test]
    fn key_revoked_on_second_leg_fails_device() {
        let op = SyncOperation::new(1, &devices(&["a"]), SyncMode::PushAndPull, false);
        op.merge_status("a", SyncStatus::SendFinished, false);
        assert_eq!(
            op.merge_status("a", SyncStatus::RecvFinished, true),
            Some(SyncStatus::EKeyRevokedFailure)
        );
    }

    #[test]
    fn key_revoked_while_syncing_is_not_promoted() {
        assert_eq!(
            promote(SyncStatus::Syncing, SyncStatus::SendFinished, true),
            SyncStatus::SendFinished
        );
        assert_eq!(
            promote(SyncStatus::Syncing, SyncStatus::FinishedAll, true),
            SyncStatus::FinishedAll
        );
    }

    #[test]
    fn terminal_status_is_sticky() {
        let op = SyncOperation::new(1, &devices(&["a"]), SyncMode::Push, false);
        op.set_status("a", SyncStatus::Timeout);
        op.set_status("a", SyncStatus::Syncing);
        assert_eq!(op.status("a"), Some(SyncStatus::Timeout));
        op.set_status("unknown", SyncStatus::Syncing);
        assert_eq!(op.status("unknown"), None);
    }

    #[test]
    fn killed_operation_ignores_updates() {
        let op = SyncOperation::new(1, &devices(&["a"]), SyncMode::Push, false);
        op.kill();
        op.set_status("a", SyncStatus::FinishedAll);
        assert_eq!(op.status("a"), Some(SyncStatus::Waiting));
    }

    #[test]
    fn callback_fires_once_under_concurrent_finish() {
        let op = SyncOperation::new(7, &devices(&["a", "b"]), SyncMode::Push, false);
        let calls = Arc::new(AtomicUsize::new(0));
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        op.set_user_callback(move |statuses| {
            assert_eq!(statuses.len(), 2);
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&hooks);
        op.set_on_finished(move |sync_id| {
            assert_eq!(sync_id, 7);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        op.set_status("a", SyncStatus::FinishedAll);
        assert!(!op.check_is_all_finished());
        op.set_status("b", SyncStatus::FinishedAll);
        assert!(op.check_is_all_finished());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let op = op.clone();
                thread::spawn(move || op.finished())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_wait_returns_after_finish() {
        let op = SyncOperation::new(1, &devices(&["a"]), SyncMode::Pull, true);
        let waiter = {
            let op = op.clone();
            thread::spawn(move || op.wait_if_needed())
        };
        op.set_status("a", SyncStatus::FinishedAll);
        op.finished();
        waiter.join().unwrap();
        assert!(op.is_finished());
    }

    #[test]
    fn blocking_wait_returns_after_kill() {
        let op = SyncOperation::new(1, &devices(&["a"]), SyncMode::Pull, true);
        let waiter = {
            let op = op.clone();
            thread::spawn(move || op.wait_if_needed())
        };
        op.kill();
        waiter.join().unwrap();
        assert!(!op.is_finished());
    }

    #[test]
    fn push_and_pull_covers_single_directions() {
        assert!(SyncMode::PushAndPull.covers(SyncMode::Push));
        assert!(SyncMode::AutoPush.covers(SyncMode::AutoPush));
        assert!(!SyncMode::AutoPush.covers(SyncMode::AutoPull));
        assert!(!SyncMode::ResponsePull.is_user_selectable());
    }

    fn any_status() -> impl Strategy<Value = SyncStatus> {
        prop_oneof![
            Just(SyncStatus::Waiting),
            Just(SyncStatus::Syncing),
            Just(SyncStatus::SendFinished),
            Just(SyncStatus::RecvFinished),
            Just(SyncStatus::FinishedAll),
            Just(SyncStatus::Failed),
            Just(SyncStatus::Timeout),
            Just(SyncStatus::EKeyRevokedFailure),
            Just(SyncStatus::BusyFailure),
        ]
    }

    proptest! {
        #[test]
        fn terminal_statuses_never_change(
            updates in prop::collection::vec((any_status(), any::<bool>()), 1..32)
        ) {
            let op = SyncOperation::new(1, &devices(&["a"]), SyncMode::PushAndPull, false);
            let mut terminal = None;
            for (status, key_revoked) in updates {
                let result = op.merge_status("a", status, key_revoked).unwrap();
                match terminal {
                    Some(done) => prop_assert_eq!(result, done),
                    None if result.is_terminal() => terminal = Some(result),
                    None => {}
                }
            }
        }
    }
}
