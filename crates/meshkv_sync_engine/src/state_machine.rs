//! Seam to the sync protocol.
//!
//! The protocol itself (message formats, data transfer, watermark
//! negotiation) lives outside this crate. A [`SyncTaskContext`] drives
//! one [`SyncStateMachine`] per remote device and expects the machine to
//! report progress back through
//! [`SyncTaskContext::set_operation_status`] and
//! [`SyncTaskContext::finish_target`].

use crate::context::SyncTaskContext;
use crate::error::{SyncError, SyncResult};
use crate::operation::{SyncId, SyncMode, SyncStatus};
use parking_lot::Mutex;
use std::sync::Arc;

/// A protocol message addressed to one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    /// Session the message belongs to.
    pub session_id: u32,
    /// Position within the session.
    pub sequence_id: u32,
    /// Opaque protocol payload.
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Creates a message.
    pub fn new(session_id: u32, sequence_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            session_id,
            sequence_id,
            payload: payload.into(),
        }
    }
}

/// Protocol state machine of one remote device.
pub trait SyncStateMachine: Send + Sync {
    /// Starts a session for the context's current target.
    ///
    /// # Errors
    ///
    /// An error fails the current target.
    fn start_sync(&self, ctx: &SyncTaskContext) -> SyncResult<()>;

    /// Handles a message from the remote device.
    ///
    /// # Errors
    ///
    /// Errors are logged by the caller.
    fn receive_message(&self, ctx: &SyncTaskContext, message: &SyncMessage) -> SyncResult<()>;

    /// The session timer fired.
    fn time_out(&self, ctx: &SyncTaskContext);

    /// The communicator reported an error for the current session.
    fn comm_err_abort(&self, ctx: &SyncTaskContext);

    /// The context is being torn down.
    fn abort(&self, ctx: &SyncTaskContext);
}

/// Builds the state machine for a device.
pub trait StateMachineFactory: Send + Sync {
    /// Creates a machine for `device`.
    fn create(&self, device: &str) -> Arc<dyn SyncStateMachine>;
}

impl<F> StateMachineFactory for F
where
    F: Fn(&str) -> Arc<dyn SyncStateMachine> + Send + Sync,
{
    fn create(&self, device: &str) -> Arc<dyn SyncStateMachine> {
        self(device)
    }
}

/// How a [`MockStateMachine`] answers `start_sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Reports the status and finishes the target.
    Complete(SyncStatus),
    /// Reports both legs, then finishes the target.
    CompleteLegs,
    /// Does nothing; the session ends by message or timeout.
    Hang,
    /// Fails with the given error kind.
    FailStart(MockFailure),
}

/// Error returned by [`MockBehavior::FailStart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// [`SyncError::Busy`].
    Busy,
    /// [`SyncError::EKeyRevoked`].
    KeyRevoked,
    /// [`SyncError::Internal`].
    Internal,
}

impl MockFailure {
    fn to_error(self) -> SyncError {
        match self {
            MockFailure::Busy => SyncError::busy("remote busy"),
            MockFailure::KeyRevoked => SyncError::EKeyRevoked,
            MockFailure::Internal => SyncError::Internal("mock start failure".into()),
        }
    }
}

/// A call recorded by [`MockStateMachine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineCall {
    /// `start_sync` for a target.
    StartSync {
        /// Sync id of the target.
        sync_id: SyncId,
        /// Mode of the target.
        mode: SyncMode,
    },
    /// `receive_message`.
    ReceiveMessage(SyncMessage),
    /// `time_out`.
    TimeOut,
    /// `comm_err_abort`.
    CommErrAbort,
    /// `abort`.
    Abort,
}

/// A scripted state machine for testing.
#[derive(Debug)]
pub struct MockStateMachine {
    behavior: Mutex<MockBehavior>,
    calls: Mutex<Vec<MachineCall>>,
}

impl MockStateMachine {
    /// Creates a machine with a fixed behavior.
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Changes the behavior for later sessions.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock() = behavior;
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<MachineCall> {
        self.calls.lock().clone()
    }

    /// Number of `start_sync` calls.
    pub fn start_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, MachineCall::StartSync { .. }))
            .count()
    }

    fn record(&self, call: MachineCall) {
        self.calls.lock().push(call);
    }
}

impl Default for MockStateMachine {
    fn default() -> Self {
        Self::new(MockBehavior::Complete(SyncStatus::FinishedAll))
    }
}

impl SyncStateMachine for MockStateMachine {
    fn start_sync(&self, ctx: &SyncTaskContext) -> SyncResult<()> {
        self.record(MachineCall::StartSync {
            sync_id: ctx.sync_id(),
            mode: ctx.mode(),
        });
        let behavior = *self.behavior.lock();
        match behavior {
            MockBehavior::Complete(status) => {
                ctx.set_operation_status(status);
                ctx.finish_target();
            }
            MockBehavior::CompleteLegs => {
                ctx.set_operation_status(SyncStatus::SendFinished);
                ctx.set_operation_status(SyncStatus::RecvFinished);
                ctx.finish_target();
            }
            MockBehavior::Hang => {}
            MockBehavior::FailStart(failure) => return Err(failure.to_error()),
        }
        Ok(())
    }

    fn receive_message(&self, ctx: &SyncTaskContext, message: &SyncMessage) -> SyncResult<()> {
        self.record(MachineCall::ReceiveMessage(message.clone()));
        if ctx.current_target().is_none() {
            return ctx.add_response_target(message.session_id);
        }
        ctx.set_operation_status(SyncStatus::FinishedAll);
        ctx.finish_target();
        Ok(())
    }

    fn time_out(&self, ctx: &SyncTaskContext) {
        self.record(MachineCall::TimeOut);
        if ctx.is_retry_allowed() {
            ctx.inc_retry_time();
            ctx.inc_sequence_id();
            return;
        }
        ctx.set_task_error(SyncError::Timeout.task_error());
        ctx.abort(SyncStatus::Timeout);
        ctx.finish_target();
    }

    fn comm_err_abort(&self, ctx: &SyncTaskContext) {
        self.record(MachineCall::CommErrAbort);
        ctx.abort(ctx.inner_err_status());
        ctx.finish_target();
    }

    fn abort(&self, _ctx: &SyncTaskContext) {
        self.record(MachineCall::Abort);
    }
}
