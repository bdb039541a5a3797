//! The listener set of one event type.

use super::listener::Listener;
use super::EventType;
use crate::lifecycle::RefCounted;
use parking_lot::Mutex;
use std::time::Duration;

pub(crate) struct ListenerChain {
    event_type: EventType,
    listeners: Mutex<Vec<Listener>>,
}

impl ListenerChain {
    pub(crate) fn new(event_type: EventType) -> RefCounted<Self> {
        RefCounted::new(Self {
            event_type,
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn event_type(&self) -> EventType {
        self.event_type
    }

    pub(crate) fn add(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn remove(&self, listener: &Listener) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|l| !l.same(listener));
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Point-in-time copy of the listener set.
    pub(crate) fn snapshot(&self) -> Vec<Listener> {
        self.listeners.lock().clone()
    }

    /// Kills the chain, then kills every listener and waits for each to
    /// go idle.
    pub(crate) fn tear_down(chain: &RefCounted<Self>, timeout: Duration) {
        chain.kill();
        let listeners = std::mem::take(&mut *chain.listeners.lock());
        for listener in listeners {
            listener.kill_and_wait(timeout);
        }
    }
}
