//! # MeshKV Core
//!
//! Concurrency primitives shared by the MeshKV store and its sync engine.
//!
//! This crate provides:
//! - Reference-counted objects with an explicit kill phase
//! - A typed event bus with per-listener serialized delivery
//! - An elastic task pool with per-tag serialized queues
//! - The commit notification pipeline
//!
//! ## Architecture
//!
//! A committed write flows through the pipeline like this:
//! 1. The writer builds a [`CommitNotifyData`] and hands it to the
//!    [`CommitNotifier`]
//! 2. The notifier stamps a notify id and schedules delivery on the
//!    [`TaskPool`] under the store's tag
//! 3. A worker calls [`NotificationChain::notify_event`], which invokes
//!    every [`Listener`] outside the chain lock
//!
//! ## Key Invariants
//!
//! - Notifications for one store are delivered in commit order
//! - One listener's callback never runs on two threads at once
//! - Observers never see commits that happened before they registered
//! - Tasks sharing a tag run one at a time, in submission order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod commit_notify;
mod config;
mod error;
mod lifecycle;
mod notification;
mod task_pool;

pub use commit_notify::{
    CommitNotifier, CommitNotifyData, Conflict, Entry, KeyChange, ObserverMode, CONFLICT_EVENT,
    LOCAL_PUT_EVENT, PUT_EVENT, SYNC_EVENT,
};
pub use config::{TaskPoolConfig, DEFAULT_WAIT_TIMEOUT};
pub use error::{CoreError, CoreResult};
pub use lifecycle::{InFlight, InFlightGuard, ObjectGuard, RefCounted, WeakRef};
pub use notification::{EventPayload, EventType, Listener, NotificationChain};
pub use task_pool::{Task, TaskPool};
