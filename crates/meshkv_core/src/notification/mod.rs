//! Typed event bus.
//!
//! A [`NotificationChain`] maps each registered [`EventType`] to a chain
//! of [`Listener`]s. [`NotificationChain::notify_event`] snapshots the
//! listener set under the chain lock and invokes every listener outside
//! of it, so listeners registered during delivery miss that event and
//! listeners detached during delivery still see it unless already killed.
//!
//! One bus is owned by each store context; there is no process-wide bus.

mod chain;
mod listener;

pub use listener::Listener;

use crate::commit_notify::CommitNotifyData;
use crate::config::DEFAULT_WAIT_TIMEOUT;
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::RefCounted;
use chain::ListenerChain;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Small integer key identifying an event kind.
pub type EventType = u32;

/// Payload carried by an event.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// A committed write.
    Commit(Arc<CommitNotifyData>),
    /// The system clock moved by this many microseconds.
    TimeChanged(i64),
}

/// Event bus of one store.
#[derive(Default)]
pub struct NotificationChain {
    chains: Mutex<HashMap<EventType, RefCounted<ListenerChain>>>,
}

impl NotificationChain {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyRegistered`] if the type exists.
    pub fn register_event_type(&self, event_type: EventType) -> CoreResult<()> {
        let mut chains = self.chains.lock();
        if chains.contains_key(&event_type) {
            return Err(CoreError::AlreadyRegistered { event_type });
        }
        chains.insert(event_type, ListenerChain::new(event_type));
        Ok(())
    }

    /// Returns true if `event_type` is registered.
    pub fn is_registered(&self, event_type: EventType) -> bool {
        self.chains.lock().contains_key(&event_type)
    }

    /// Subscribes `on_event` to `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotRegistered`] if the type was never
    /// registered or is being torn down.
    pub fn register_listener<F>(&self, event_type: EventType, on_event: F) -> CoreResult<Listener>
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
    {
        self.register_listener_inner(event_type, Box::new(on_event), None)
    }

    /// Like [`NotificationChain::register_listener`], with a finalizer that
    /// runs exactly once after the listener is gone for good.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotRegistered`] if the type was never
    /// registered. The finalizer runs immediately in that case.
    pub fn register_listener_with_finalizer<F, G>(
        &self,
        event_type: EventType,
        on_event: F,
        on_finalize: G,
    ) -> CoreResult<Listener>
    where
        F: Fn(&EventPayload) + Send + Sync + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.register_listener_inner(event_type, Box::new(on_event), Some(Box::new(on_finalize)))
    }

    fn register_listener_inner(
        &self,
        event_type: EventType,
        on_event: listener::OnEvent,
        on_finalize: Option<Box<dyn FnOnce() + Send>>,
    ) -> CoreResult<Listener> {
        let chain = self.chains.lock().get(&event_type).cloned();
        let chain = match chain {
            Some(chain) if !chain.is_killed() => chain,
            _ => {
                if let Some(finalize) = on_finalize {
                    finalize();
                }
                return Err(CoreError::NotRegistered { event_type });
            }
        };

        let listener = Listener::new(event_type, on_event, chain.downgrade());
        if let Some(finalize) = on_finalize {
            listener.on_finalize(finalize);
        }
        chain.add(listener.clone());
        debug!(
            event_type = chain.event_type(),
            listeners = chain.len(),
            "[NotificationChain] listener registered"
        );
        Ok(listener)
    }

    /// Unregisters `event_type`, killing every listener on it.
    ///
    /// Waits (bounded) for each listener's in-progress callback to return.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the type is not registered.
    pub fn unregister_event_type(&self, event_type: EventType) -> CoreResult<()> {
        let chain = self
            .chains
            .lock()
            .remove(&event_type)
            .ok_or_else(|| CoreError::not_found(format!("event type {event_type}")))?;
        ListenerChain::tear_down(&chain, DEFAULT_WAIT_TIMEOUT);
        Ok(())
    }

    /// Delivers `payload` to every listener of `event_type`.
    ///
    /// A no-op if the type is not registered.
    pub fn notify_event(&self, event_type: EventType, payload: &EventPayload) {
        let chain = self.chains.lock().get(&event_type).cloned();
        let Some(chain) = chain else {
            return;
        };
        if chain.is_killed() {
            return;
        }
        for listener in chain.snapshot() {
            listener.notify(payload);
        }
    }

    /// Number of listeners on `event_type`, zero if not registered.
    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.chains
            .lock()
            .get(&event_type)
            .map_or(0, |chain| chain.len())
    }

    /// Unregisters every event type.
    pub fn close(&self) {
        let chains: Vec<_> = self.chains.lock().drain().map(|(_, chain)| chain).collect();
        for chain in chains {
            ListenerChain::tear_down(&chain, DEFAULT_WAIT_TIMEOUT);
        }
    }
}

impl Drop for NotificationChain {
    fn drop(&mut self) {
        self.close();
    }
}
