//! Units of work queued on a task context.

use crate::operation::{SyncId, SyncMode, SyncOperation};

/// One queued session for a device.
#[derive(Debug, Clone)]
pub enum SyncTarget {
    /// A locally requested sync.
    Request(SyncOperation),
    /// An answer to a pull started by the remote device.
    Response {
        /// Session id chosen by the remote device.
        session_id: u32,
    },
}

impl SyncTarget {
    /// Mode of the session.
    pub fn mode(&self) -> SyncMode {
        match self {
            SyncTarget::Request(operation) => operation.mode(),
            SyncTarget::Response { .. } => SyncMode::ResponsePull,
        }
    }

    /// Sync id; zero for responses.
    pub fn sync_id(&self) -> SyncId {
        match self {
            SyncTarget::Request(operation) => operation.sync_id(),
            SyncTarget::Response { .. } => 0,
        }
    }

    /// The operation behind a request.
    pub fn operation(&self) -> Option<&SyncOperation> {
        match self {
            SyncTarget::Request(operation) => Some(operation),
            SyncTarget::Response { .. } => None,
        }
    }

    /// True for auto-sync requests.
    pub fn is_auto_sync(&self) -> bool {
        self.mode().is_auto()
    }

    /// True for responses.
    pub fn is_response(&self) -> bool {
        matches!(self, SyncTarget::Response { .. })
    }

    /// True if the operation behind a request was killed.
    pub fn is_killed(&self) -> bool {
        self.operation().is_some_and(SyncOperation::is_killed)
    }
}
