//! # MeshKV Sync Engine
//!
//! Device-to-device sync scheduling for MeshKV.
//!
//! This crate provides:
//! - Persisted sync metadata (time offsets, watermarks)
//! - A logical clock that never goes backwards across restarts
//! - Sync operations with per-device status tracking
//! - Per-device task contexts with session timers and teardown
//! - The `Syncer` entry point (`sync`, `stop_sync`, queue limits)
//!
//! ## Architecture
//!
//! A sync request flows through the engine like this:
//! 1. [`Syncer::sync`] validates the request and creates a
//!    [`SyncOperation`] covering every device
//! 2. The [`SyncEngine`] checks permissions and queues the operation on
//!    each device's [`SyncTaskContext`]
//! 3. An idle context schedules itself on the task pool, keyed by device,
//!    and hands the target to the device's [`SyncStateMachine`]
//! 4. The state machine reports per-device statuses back; when every
//!    device is done the operation runs its callback once
//!
//! The protocol itself lives behind [`SyncStateMachine`]; this crate only
//! schedules, times and tears down sessions.
//!
//! ## Key Invariants
//!
//! - Logical timestamps are strictly increasing, even after clock rewinds
//! - New timestamps are always above the newest stored timestamp
//! - A device status never leaves a terminal state
//! - An operation's callback runs at most once
//! - No timer or message callback touches a context after `kill_and_wait`

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod engine;
mod error;
mod metadata;
mod operation;
mod state_machine;
mod syncer;
mod target;
mod time_helper;
mod timer;

pub use config::{SyncConfig, QUEUED_SYNC_LIMIT_DEFAULT, QUEUED_SYNC_LIMIT_MAX, QUEUED_SYNC_LIMIT_MIN};
pub use context::{SyncTaskContext, TaskExecStatus};
pub use engine::{PermissionCheck, PermissionFlag, SyncEngine, SyncRuntime, TIME_CHANGED_EVENT};
pub use error::{SyncError, SyncResult, TaskError};
pub use metadata::{MetaDataValue, Metadata};
pub use operation::{promote, DeviceStatuses, SyncCallback, SyncId, SyncMode, SyncOperation, SyncStatus};
pub use state_machine::{
    MachineCall, MockBehavior, MockFailure, MockStateMachine, StateMachineFactory, SyncMessage,
    SyncStateMachine,
};
pub use syncer::{SyncRequest, Syncer};
pub use target::SyncTarget;
pub use time_helper::{
    ManualClock, SystemClock, TimeHelper, WallClock, MAX_VALID_TIME, MS_TO_100_NS, TO_100_NS,
};
pub use timer::{ManualTimer, TimerAction, TimerFinalizer, TimerId, TimerService, TokioTimer};
