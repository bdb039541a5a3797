//! Per-tag serialized work queue.

use super::Task;
use std::collections::VecDeque;

/// A FIFO of tasks sharing one tag.
///
/// `locked` is set while a worker runs a task taken from this queue, so
/// at most one task of the tag executes at any instant.
#[derive(Default)]
pub(super) struct TaskQueue {
    tasks: VecDeque<Task>,
    locked: bool,
}

impl TaskQueue {
    pub(super) fn push(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    /// Claims the queue and pops its head, unless another worker holds it.
    pub(super) fn claim(&mut self) -> Option<Task> {
        if self.locked {
            return None;
        }
        let task = self.tasks.pop_front()?;
        self.locked = true;
        Some(task)
    }

    /// Releases the claim. Returns true if more work is waiting.
    pub(super) fn release(&mut self) -> bool {
        self.locked = false;
        !self.tasks.is_empty()
    }

    pub(super) fn is_idle(&self) -> bool {
        !self.locked && self.tasks.is_empty()
    }

    pub(super) fn has_runnable(&self) -> bool {
        !self.locked && !self.tasks.is_empty()
    }
}
