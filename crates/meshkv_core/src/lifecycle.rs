//! Shared-object lifecycle: reference counting with an explicit kill phase.
//!
//! Every object shared across threads (listener chains, listeners, sync
//! operations, sync task contexts) is held through a [`RefCounted`]
//! handle:
//!
//! - cloning a handle retains, dropping it releases
//! - [`WeakRef::upgrade`] retains an object that may already be released
//!   and fails with [`CoreError::AlreadyReleased`] once the count hit zero
//! - [`RefCounted::kill`] marks the object dead and runs its on-kill
//!   handlers while the object lock is held; in-flight operations may
//!   finish but no new operation should begin
//! - when the last handle goes away the on-last-ref handlers run, then
//!   the value is dropped
//!
//! # Locking contract
//!
//! On-kill handlers run with the object lock held. They must not call
//! [`RefCounted::lock_object`] on the same object or anything that does.
//! This is a documented contract, not something the type system checks.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::warn;

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Handlers {
    on_kill: Vec<Callback>,
    on_last_ref: Vec<Callback>,
}

struct Shared<T> {
    ref_count: AtomicU32,
    killed: AtomicBool,
    /// The object lock. Guards the handler lists.
    handlers: Mutex<Handlers>,
    waiters: Condvar,
    value: T,
}

/// A counted, killable handle to a shared object.
///
/// Cloning retains. A live handle keeps the count above zero, so a clone
/// can never observe a released object; the retain-at-zero check on
/// `clone` is a `debug_assert` only. Reviving a released object is
/// refused by [`WeakRef::upgrade`], which returns
/// [`CoreError::AlreadyReleased`] in every build.
pub struct RefCounted<T> {
    shared: Arc<Shared<T>>,
}

/// A non-owning reference used for back-pointers (listener → chain,
/// timer → context). Never keeps the object alive.
pub struct WeakRef<T> {
    shared: Weak<Shared<T>>,
}

/// Holds the object lock of a [`RefCounted`] object.
pub struct ObjectGuard<'a> {
    guard: MutexGuard<'a, Handlers>,
}

impl<T> RefCounted<T> {
    /// Wraps `value` with a reference count of one.
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                ref_count: AtomicU32::new(1),
                killed: AtomicBool::new(false),
                handlers: Mutex::new(Handlers::default()),
                waiters: Condvar::new(),
                value,
            }),
        }
    }

    /// Current number of live handles.
    pub fn ref_count(&self) -> u32 {
        self.shared.ref_count.load(Ordering::Acquire)
    }

    /// Returns true once [`RefCounted::kill`] has started.
    pub fn is_killed(&self) -> bool {
        self.shared.killed.load(Ordering::Acquire)
    }

    /// Creates a non-owning reference.
    pub fn downgrade(&self) -> WeakRef<T> {
        WeakRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Returns true if both handles point to the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.shared, &b.shared)
    }

    /// Registers a handler run exactly once when the object is killed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ObjIsKilled`] if the object is already killed;
    /// the handler is dropped without running.
    pub fn on_kill<F>(&self, handler: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut handlers = self.shared.handlers.lock();
        if self.is_killed() {
            return Err(CoreError::ObjIsKilled);
        }
        handlers.on_kill.push(Box::new(handler));
        Ok(())
    }

    /// Registers a handler run exactly once when the last handle is dropped.
    pub fn on_last_ref<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.handlers.lock().on_last_ref.push(Box::new(handler));
    }

    /// Marks the object killed and runs its on-kill handlers under the
    /// object lock. Killing twice is a no-op.
    pub fn kill(&self) {
        let mut handlers = self.shared.handlers.lock();
        if self.shared.killed.swap(true, Ordering::AcqRel) {
            return;
        }
        let on_kill = std::mem::take(&mut handlers.on_kill);
        for handler in on_kill {
            handler();
        }
        drop(handlers);
        self.shared.waiters.notify_all();
    }

    /// Kills the object and releases this handle.
    pub fn kill_and_release(self) {
        self.kill();
    }

    /// Takes the object lock.
    pub fn lock_object(&self) -> ObjectGuard<'_> {
        ObjectGuard {
            guard: self.shared.handlers.lock(),
        }
    }

    /// Blocks until `predicate` holds or `timeout` elapses.
    ///
    /// This is a bounded wait, not a correctness guarantee: on timeout it
    /// logs and returns `false`, and the caller proceeds anyway. Whoever
    /// changes the state `predicate` reads must call
    /// [`RefCounted::notify_waiters`] afterwards.
    pub fn wait_until<P>(&self, guard: &mut ObjectGuard<'_>, mut predicate: P, timeout: Duration) -> bool
    where
        P: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while !predicate() {
            if self
                .shared
                .waiters
                .wait_until(&mut guard.guard, deadline)
                .timed_out()
            {
                if predicate() {
                    return true;
                }
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "[RefObject] wait until safe to kill timed out"
                );
                return false;
            }
        }
        true
    }

    /// Wakes every thread blocked in [`RefCounted::wait_until`].
    pub fn notify_waiters(&self) {
        // Taking the object lock orders this wakeup after any waiter's
        // predicate check, so the wakeup cannot be lost.
        drop(self.shared.handlers.lock());
        self.shared.waiters.notify_all();
    }
}

impl<T> Clone for RefCounted<T> {
    fn clone(&self) -> Self {
        let previous = self.shared.ref_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "retain on a released object");
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for RefCounted<T> {
    fn drop(&mut self) {
        if self.shared.ref_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let on_last_ref = std::mem::take(&mut self.shared.handlers.lock().on_last_ref);
        for handler in on_last_ref {
            handler();
        }
    }
}

impl<T> Deref for RefCounted<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.shared.value
    }
}

impl<T: fmt::Debug> fmt::Debug for RefCounted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCounted")
            .field("ref_count", &self.ref_count())
            .field("killed", &self.is_killed())
            .field("value", &self.shared.value)
            .finish()
    }
}

impl<T> WeakRef<T> {
    /// Retains the object if it is still reachable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyReleased`] if the reference count
    /// already reached zero.
    pub fn upgrade(&self) -> CoreResult<RefCounted<T>> {
        let shared = self.shared.upgrade().ok_or(CoreError::AlreadyReleased)?;
        let mut current = shared.ref_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(CoreError::AlreadyReleased);
            }
            match shared.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(RefCounted { shared }),
                Err(actual) => current = actual,
            }
        }
    }
}

impl<T> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakRef").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct InFlightState {
    count: usize,
    closed: bool,
}

#[derive(Default)]
struct InFlightInner {
    state: Mutex<InFlightState>,
    drained: Condvar,
}

/// Counts reentrant users (timer fires, message callbacks) of an object
/// so teardown can wait for them to drain.
#[derive(Clone, Default)]
pub struct InFlight {
    inner: Arc<InFlightInner>,
}

/// One registered user. Dropping it is the "safe exit".
pub struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl InFlight {
    /// Creates an open counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user unless the counter was closed.
    pub fn enter(&self) -> Option<InFlightGuard> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        state.count += 1;
        Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Refuses every later [`InFlight::enter`].
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
    }

    /// Number of users currently inside.
    pub fn count(&self) -> usize {
        self.inner.state.lock().count
    }

    /// Blocks until every user left or `timeout` elapsed. Bounded wait:
    /// returns `false` (and logs) on timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.count > 0 {
            if self
                .inner
                .drained
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                if state.count == 0 {
                    break;
                }
                warn!(
                    in_flight = state.count,
                    "[RefObject] in-flight users did not drain before timeout"
                );
                return false;
            }
        }
        true
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.count -= 1;
        if state.count == 0 {
            self.inner.drained.notify_all();
        }
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("count", &self.count())
            .finish()
    }
}
