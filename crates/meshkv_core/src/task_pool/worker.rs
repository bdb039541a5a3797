//! Worker thread body.

use super::{PoolState, Shared, Task};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, error, trace};

enum Job {
    Generic(Task),
    Keyed(String, Task),
}

pub(super) fn run(shared: Arc<Shared>) {
    let me = thread::current().id();
    let mut state = shared.state.lock();
    state.workers.insert(me);
    if state.generic_worker.is_none() {
        state.generic_worker = Some(me);
    }
    trace!(threads = state.current_threads, "[TaskPool] worker started");

    loop {
        match next_job(&mut state, me) {
            Some(Job::Generic(task)) => {
                drop(state);
                run_task(task, None);
                state = shared.state.lock();
            }
            Some(Job::Keyed(tag, task)) => {
                drop(state);
                run_task(task, Some(&tag));
                state = shared.state.lock();
                let more = state
                    .queued
                    .get_mut(&tag)
                    .is_some_and(|queue| queue.release());
                if more {
                    shared.has_task.notify_all();
                }
            }
            None => {
                if state.stopping {
                    break;
                }
                let is_generic = state.generic_worker == Some(me);
                state.idle_threads += 1;
                if is_generic {
                    state.generic_worker_idle = true;
                }
                let surplus = state.current_threads > state.min_threads;
                let timed_out = if surplus {
                    let idle_timeout = state.idle_timeout;
                    shared
                        .has_task
                        .wait_for(&mut state, idle_timeout)
                        .timed_out()
                } else {
                    shared.has_task.wait(&mut state);
                    false
                };
                state.idle_threads -= 1;
                if is_generic {
                    state.generic_worker_idle = false;
                }
                if timed_out
                    && state.current_threads > state.min_threads
                    && !has_job(&state, me)
                {
                    debug!(
                        threads = state.current_threads - 1,
                        "[TaskPool] idle worker exiting"
                    );
                    break;
                }
            }
        }
    }

    state.workers.remove(&me);
    if state.generic_worker == Some(me) {
        state.generic_worker = None;
        state.generic_worker_idle = false;
    }
    state.current_threads -= 1;
    if state.current_threads == 0 && state.stopping {
        state.reset_after_stop();
        shared.all_exited.notify_all();
    }
}

fn next_job(state: &mut PoolState, me: ThreadId) -> Option<Job> {
    if let Some(task) = state.generic.pop_front() {
        if state.generic_worker.is_none() {
            state.generic_worker = Some(me);
        }
        return Some(Job::Generic(task));
    }
    if reserved_for_generic(state, me) {
        return None;
    }
    for (tag, queue) in state.queued.iter_mut() {
        if let Some(task) = queue.claim() {
            state.queued_task_count -= 1;
            return Some(Job::Keyed(tag.clone(), task));
        }
    }
    None
}

fn has_job(state: &PoolState, me: ThreadId) -> bool {
    if !state.generic.is_empty() {
        return true;
    }
    !reserved_for_generic(state, me) && state.queued.values().any(|q| q.has_runnable())
}

/// The generic worker keeps away from tagged work while other workers exist.
fn reserved_for_generic(state: &PoolState, me: ThreadId) -> bool {
    state.generic_worker == Some(me) && state.current_threads > 1 && !state.stopping
}

fn run_task(task: Task, tag: Option<&str>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(
            tag = tag.unwrap_or("<generic>"),
            panic = %panic_message(payload.as_ref()),
            "[TaskPool] task panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
