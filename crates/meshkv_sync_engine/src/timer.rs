//! Timer service used for sync session timeouts.
//!
//! Timers repeat until removed. An action that returns an error removes
//! its own timer. The optional finalizer runs exactly once, whichever way
//! the timer goes away.

use crate::error::{SyncError, SyncResult};
use meshkv_core::CoreError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Identifies a timer within one service.
pub type TimerId = u64;

/// Runs on every expiry. Returning an error removes the timer.
pub type TimerAction = Box<dyn FnMut(TimerId) -> SyncResult<()> + Send>;

/// Runs once after the timer is removed.
pub type TimerFinalizer = Box<dyn FnOnce() + Send>;

/// A repeating timer service.
pub trait TimerService: Send + Sync {
    /// Starts a timer firing every `duration`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgs`] for a zero duration.
    fn set_timer(
        &self,
        duration: Duration,
        action: TimerAction,
        finalizer: Option<TimerFinalizer>,
    ) -> SyncResult<TimerId>;

    /// Changes the period of a timer and restarts its countdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer does not exist.
    fn modify_timer(&self, id: TimerId, duration: Duration) -> SyncResult<()>;

    /// Removes a timer. Unknown ids are ignored.
    fn remove_timer(&self, id: TimerId);
}

struct TokioEntry {
    period: watch::Sender<Duration>,
    task: JoinHandle<()>,
    finalizer: Option<TimerFinalizer>,
}

#[derive(Default)]
struct TokioShared {
    entries: Mutex<HashMap<TimerId, TokioEntry>>,
    next_id: AtomicU64,
}

impl TokioShared {
    /// Removes an entry and runs its finalizer. Only the caller that
    /// actually removed the entry finalizes it.
    fn finish(&self, id: TimerId, abort: bool) {
        let entry = self.entries.lock().remove(&id);
        if let Some(entry) = entry {
            if abort {
                entry.task.abort();
            }
            if let Some(finalizer) = entry.finalizer {
                finalizer();
            }
        }
    }
}

/// Timer service backed by a tokio runtime.
pub struct TokioTimer {
    handle: Handle,
    shared: Arc<TokioShared>,
}

impl TokioTimer {
    /// Creates a service spawning its timers on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            shared: Arc::new(TokioShared::default()),
        }
    }

    /// Creates a service on the runtime of the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Internal`] outside a tokio runtime.
    pub fn current() -> SyncResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| SyncError::Internal(format!("no tokio runtime: {e}")))
    }

    /// Number of live timers.
    pub fn timer_count(&self) -> usize {
        self.shared.entries.lock().len()
    }
}

impl TimerService for TokioTimer {
    fn set_timer(
        &self,
        duration: Duration,
        mut action: TimerAction,
        finalizer: Option<TimerFinalizer>,
    ) -> SyncResult<TimerId> {
        if duration.is_zero() {
            return Err(SyncError::invalid_args("timer duration must be positive"));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (period, mut period_rx) = watch::channel(duration);
        let shared: Weak<TokioShared> = Arc::downgrade(&self.shared);

        // The entry is inserted before the task can observe the map.
        let mut entries = self.shared.entries.lock();
        let task = self.handle.spawn(async move {
            loop {
                let current = *period_rx.borrow_and_update();
                tokio::select! {
                    () = tokio::time::sleep(current) => {
                        if let Err(err) = action(id) {
                            debug!(timer_id = id, error = %err, "[Timer] action failed, removing timer");
                            if let Some(shared) = shared.upgrade() {
                                shared.finish(id, false);
                            }
                            return;
                        }
                    }
                    changed = period_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        entries.insert(
            id,
            TokioEntry {
                period,
                task,
                finalizer,
            },
        );
        Ok(id)
    }

    fn modify_timer(&self, id: TimerId, duration: Duration) -> SyncResult<()> {
        if duration.is_zero() {
            return Err(SyncError::invalid_args("timer duration must be positive"));
        }
        let entries = self.shared.entries.lock();
        let entry = entries
            .get(&id)
            .ok_or_else(|| CoreError::not_found(format!("timer {id}")))?;
        entry.period.send_replace(duration);
        Ok(())
    }

    fn remove_timer(&self, id: TimerId) {
        self.shared.finish(id, true);
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        let ids: Vec<TimerId> = self.shared.entries.lock().keys().copied().collect();
        for id in ids {
            self.shared.finish(id, true);
        }
    }
}

impl fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTimer")
            .field("timers", &self.timer_count())
            .finish()
    }
}

struct ManualEntry {
    duration: Duration,
    action: Option<TimerAction>,
    finalizer: Option<TimerFinalizer>,
}

/// Timer service whose timers only fire when the test says so.
#[derive(Default)]
pub struct ManualTimer {
    entries: Mutex<HashMap<TimerId, ManualEntry>>,
    next_id: AtomicU64,
}

impl ManualTimer {
    /// Creates an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires one timer. Returns false if it does not exist or is already
    /// firing.
    pub fn fire(&self, id: TimerId) -> bool {
        let action = self
            .entries
            .lock()
            .get_mut(&id)
            .and_then(|entry| entry.action.take());
        let Some(mut action) = action else {
            return false;
        };
        let result = action(id);

        let mut entries = self.entries.lock();
        match result {
            Ok(()) => {
                if let Some(entry) = entries.get_mut(&id) {
                    entry.action = Some(action);
                }
            }
            Err(_) => {
                let removed = entries.remove(&id);
                drop(entries);
                if let Some(finalizer) = removed.and_then(|entry| entry.finalizer) {
                    finalizer();
                }
            }
        }
        true
    }

    /// Fires every live timer once. Returns how many fired.
    pub fn fire_all(&self) -> usize {
        self.active_timers()
            .into_iter()
            .filter(|id| self.fire(*id))
            .count()
    }

    /// Ids of live timers, ascending.
    pub fn active_timers(&self) -> Vec<TimerId> {
        let mut ids: Vec<_> = self.entries.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current period of a timer.
    pub fn duration(&self, id: TimerId) -> Option<Duration> {
        self.entries.lock().get(&id).map(|entry| entry.duration)
    }
}

impl TimerService for ManualTimer {
    fn set_timer(
        &self,
        duration: Duration,
        action: TimerAction,
        finalizer: Option<TimerFinalizer>,
    ) -> SyncResult<TimerId> {
        if duration.is_zero() {
            return Err(SyncError::invalid_args("timer duration must be positive"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.lock().insert(
            id,
            ManualEntry {
                duration,
                action: Some(action),
                finalizer,
            },
        );
        Ok(id)
    }

    fn modify_timer(&self, id: TimerId, duration: Duration) -> SyncResult<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found(format!("timer {id}")))?;
        entry.duration = duration;
        Ok(())
    }

    fn remove_timer(&self, id: TimerId) {
        let removed = self.entries.lock().remove(&id);
        if let Some(finalizer) = removed.and_then(|entry| entry.finalizer) {
            finalizer();
        }
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimer")
            .field("timers", &self.active_timers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_action(count: &Arc<AtomicUsize>, fail_after: usize) -> TimerAction {
        let count = Arc::clone(count);
        Box::new(move |_| {
            if count.fetch_add(1, Ordering::SeqCst) + 1 >= fail_after {
                return Err(SyncError::Timeout);
            }
            Ok(())
        })
    }

    fn counting_finalizer(count: &Arc<AtomicUsize>) -> Option<TimerFinalizer> {
        let count = Arc::clone(count);
        Some(Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn manual_timer_repeats_until_action_fails() {
        let timer = ManualTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        let id = timer
            .set_timer(
                Duration::from_secs(1),
                counting_action(&fired, 2),
                counting_finalizer(&finalized),
            )
            .unwrap();

        assert!(timer.fire(id));
        assert_eq!(timer.active_timers(), vec![id]);
        assert!(timer.fire(id));
        assert!(timer.active_timers().is_empty());
        assert!(!timer.fire(id));
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manual_timer_remove_finalizes_once() {
        let timer = ManualTimer::new();
        let finalized = Arc::new(AtomicUsize::new(0));
        let id = timer
            .set_timer(
                Duration::from_secs(1),
                Box::new(|_| Ok(())),
                counting_finalizer(&finalized),
            )
            .unwrap();
        timer.modify_timer(id, Duration::from_secs(3)).unwrap();
        assert_eq!(timer.duration(id), Some(Duration::from_secs(3)));

        timer.remove_timer(id);
        timer.remove_timer(id);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(timer.modify_timer(id, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn zero_duration_is_rejected() {
        let timer = ManualTimer::new();
        assert!(matches!(
            timer.set_timer(Duration::ZERO, Box::new(|_| Ok(())), None),
            Err(SyncError::InvalidArgs(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tokio_timer_repeats_and_removes_on_error() {
        let timer = TokioTimer::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        timer
            .set_timer(
                Duration::from_millis(10),
                counting_action(&fired, 3),
                counting_finalizer(&finalized),
            )
            .unwrap();

        for _ in 0..200 {
            if finalized.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(timer.timer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tokio_timer_remove_stops_firing() {
        let timer = TokioTimer::current().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        let id = timer
            .set_timer(
                Duration::from_secs(60),
                counting_action(&fired, usize::MAX),
                counting_finalizer(&finalized),
            )
            .unwrap();
        timer.modify_timer(id, Duration::from_secs(120)).unwrap();
        timer.remove_timer(id);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert!(timer.modify_timer(id, Duration::from_secs(1)).is_err());
    }
}
