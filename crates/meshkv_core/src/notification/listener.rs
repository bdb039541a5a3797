//! A single subscriber on a listener chain.

use super::chain::ListenerChain;
use super::{EventPayload, EventType};
use crate::config::DEFAULT_WAIT_TIMEOUT;
use crate::lifecycle::{RefCounted, WeakRef};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) type OnEvent = Box<dyn Fn(&EventPayload) + Send + Sync>;

pub(crate) struct ListenerInner {
    event_type: EventType,
    on_event: OnEvent,
    chain: WeakRef<ListenerChain>,
    /// Thread currently inside `on_event`, if any.
    active: Mutex<Option<ThreadId>>,
    idle: Condvar,
}

/// Handle to a registered listener.
///
/// Dropping the handle does not unsubscribe: the listener stays on its
/// chain until [`Listener::detach`] is called or its event type is
/// unregistered. The finalizer passed at registration runs exactly once,
/// after the last handle (including the chain's own) is gone.
#[derive(Clone)]
pub struct Listener {
    inner: RefCounted<ListenerInner>,
}

/// Clears the active marker even if the callback panics.
struct ActiveGuard<'a> {
    listener: &'a Listener,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self.listener.inner.active.lock() = None;
        self.listener.inner.idle.notify_all();
        self.listener.inner.notify_waiters();
    }
}

impl Listener {
    pub(crate) fn new(
        event_type: EventType,
        on_event: OnEvent,
        chain: WeakRef<ListenerChain>,
    ) -> Self {
        Self {
            inner: RefCounted::new(ListenerInner {
                event_type,
                on_event,
                chain,
                active: Mutex::new(None),
                idle: Condvar::new(),
            }),
        }
    }

    pub(crate) fn on_finalize<F>(&self, finalize: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.on_last_ref(finalize);
    }

    /// The event type this listener is subscribed to.
    pub fn event_type(&self) -> EventType {
        self.inner.event_type
    }

    /// Returns true once the listener was detached or its chain torn down.
    pub fn is_detached(&self) -> bool {
        self.inner.is_killed()
    }

    pub(crate) fn same(&self, other: &Listener) -> bool {
        RefCounted::ptr_eq(&self.inner, &other.inner)
    }

    /// Invokes the callback unless the listener was killed.
    ///
    /// Invocations on one listener are serialized. A notification that
    /// reaches the listener again from inside its own callback is skipped.
    pub(crate) fn notify(&self, payload: &EventPayload) {
        let me = thread::current().id();
        {
            let mut active = self.inner.active.lock();
            loop {
                if self.inner.is_killed() {
                    return;
                }
                match *active {
                    Some(id) if id == me => {
                        debug!(
                            event_type = self.inner.event_type,
                            "[Listener] re-entrant notification skipped"
                        );
                        return;
                    }
                    Some(_) => self.inner.idle.wait(&mut active),
                    None => break,
                }
            }
            *active = Some(me);
        }

        let _guard = ActiveGuard { listener: self };
        (self.inner.on_event)(payload);
    }

    /// Removes the listener from its chain and kills it.
    ///
    /// With `wait = true` the caller blocks until an `on_event` running on
    /// another thread returns, bounded by the default wait timeout. Calling
    /// this from inside the listener's own callback never waits.
    pub fn detach(self, wait: bool) {
        if let Ok(chain) = self.inner.chain.upgrade() {
            chain.remove(&self);
        }
        self.inner.kill();
        if wait {
            self.wait_inactive(DEFAULT_WAIT_TIMEOUT);
        }
    }

    pub(crate) fn kill_and_wait(&self, timeout: Duration) {
        self.inner.kill();
        self.wait_inactive(timeout);
    }

    fn wait_inactive(&self, timeout: Duration) -> bool {
        let me = thread::current().id();
        let mut guard = self.inner.lock_object();
        let drained = self.inner.wait_until(
            &mut guard,
            || match *self.inner.active.lock() {
                Some(id) => id == me,
                None => true,
            },
            timeout,
        );
        if !drained {
            warn!(
                event_type = self.inner.event_type,
                "[Listener] callback still running after detach timeout"
            );
        }
        drained
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("event_type", &self.inner.event_type)
            .field("detached", &self.is_detached())
            .finish()
    }
}
