//! Elastic worker pool with generic and tagged queues.
//!
//! Generic tasks run in FIFO order on any worker. Tasks scheduled under
//! the same tag run strictly one at a time and in submission order;
//! different tags may run concurrently. The pool grows from `min_threads`
//! toward `max_threads` when work backs up, and workers above
//! `min_threads` exit after `idle_timeout` without work.
//!
//! A panicking task is caught and logged; the worker survives.
//!
//! # Example
//!
//! ```
//! use meshkv_core::TaskPool;
//!
//! let pool = TaskPool::new();
//! pool.start(1, 4).unwrap();
//! pool.schedule_keyed("store-1", || println!("ordered per store")).unwrap();
//! pool.stop();
//! ```

mod queue;
mod worker;

use crate::config::TaskPoolConfig;
use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use queue::TaskQueue;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    started: bool,
    stopping: bool,
    min_threads: usize,
    max_threads: usize,
    idle_timeout: Duration,
    thread_name: String,
    current_threads: usize,
    idle_threads: usize,
    generic: VecDeque<Task>,
    queued: HashMap<String, TaskQueue>,
    queued_task_count: usize,
    generic_worker: Option<ThreadId>,
    generic_worker_idle: bool,
    workers: HashSet<ThreadId>,
    next_worker_id: usize,
}

impl PoolState {
    fn check_accepting(&self) -> CoreResult<()> {
        if self.stopping {
            return Err(CoreError::stale("task pool is stopping"));
        }
        if !self.started {
            return Err(CoreError::not_permit("task pool is not started"));
        }
        Ok(())
    }

    fn reset_after_stop(&mut self) {
        self.started = false;
        self.stopping = false;
        self.generic_worker = None;
        self.generic_worker_idle = false;
    }
}

struct Shared {
    state: Mutex<PoolState>,
    has_task: Condvar,
    all_exited: Condvar,
}

/// Elastic thread pool.
pub struct TaskPool {
    shared: Arc<Shared>,
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPool {
    /// Creates a stopped pool.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                has_task: Condvar::new(),
                all_exited: Condvar::new(),
            }),
        }
    }

    /// Starts the pool with `min` resident and at most `max` workers.
    ///
    /// # Errors
    ///
    /// See [`TaskPool::start_with_config`].
    pub fn start(&self, min: usize, max: usize) -> CoreResult<()> {
        self.start_with_config(TaskPoolConfig::default().min_threads(min).max_threads(max))
    }

    /// Starts the pool and spawns `min_threads` workers.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidArgs`] if `max_threads == 0` or
    ///   `min_threads > max_threads`
    /// - [`CoreError::AlreadySet`] if the pool is already started
    /// - [`CoreError::OutOfMemory`] if no worker could be spawned
    pub fn start_with_config(&self, config: TaskPoolConfig) -> CoreResult<()> {
        if config.max_threads == 0 {
            return Err(CoreError::invalid_args("max threads must be positive"));
        }
        if config.min_threads > config.max_threads {
            return Err(CoreError::invalid_args(format!(
                "min threads {} exceeds max threads {}",
                config.min_threads, config.max_threads
            )));
        }

        let mut state = self.shared.state.lock();
        if state.started {
            return Err(CoreError::already_set("task pool already started"));
        }
        state.started = true;
        state.min_threads = config.min_threads;
        state.max_threads = config.max_threads;
        state.idle_timeout = config.idle_timeout;
        state.thread_name = config.thread_name;

        for _ in 0..state.min_threads {
            if let Err(err) = self.spawn_worker(&mut state) {
                if state.current_threads == 0 {
                    state.started = false;
                    return Err(err);
                }
                warn!(
                    threads = state.current_threads,
                    error = %err,
                    "[TaskPool] started with fewer workers than requested"
                );
                break;
            }
        }
        info!(
            min = state.min_threads,
            max = state.max_threads,
            "[TaskPool] started"
        );
        Ok(())
    }

    /// Enqueues a task on the generic queue.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotPermit`] if the pool is not started,
    /// [`CoreError::Stale`] if it is stopping. Neither is retryable.
    pub fn schedule<F>(&self, task: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.check_accepting()?;
        state.generic.push_back(Box::new(task));
        self.try_to_spawn_threads(&mut state);
        self.shared.has_task.notify_all();
        Ok(())
    }

    /// Enqueues a task on the queue for `tag`, creating the queue on demand.
    ///
    /// # Errors
    ///
    /// Same as [`TaskPool::schedule`].
    pub fn schedule_keyed<F>(&self, tag: impl Into<String>, task: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        state.check_accepting()?;
        state
            .queued
            .entry(tag.into())
            .or_default()
            .push(Box::new(task));
        state.queued_task_count += 1;
        self.try_to_spawn_threads(&mut state);
        self.shared.has_task.notify_all();
        Ok(())
    }

    /// Stops the pool and blocks until every worker has exited.
    ///
    /// Queued tasks are drained first. Called from a pool worker, it only
    /// flags the pool as stopping.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if !state.started {
            return;
        }
        state.stopping = true;
        self.shared.has_task.notify_all();

        if state.workers.contains(&thread::current().id()) {
            warn!("[TaskPool] stop called from a worker thread, not waiting");
            return;
        }
        if state.current_threads == 0 {
            state.reset_after_stop();
        }
        while state.started {
            self.shared.all_exited.wait(&mut state);
        }
        info!("[TaskPool] stopped");
    }

    /// Drops the queue of `tag` if it is empty and not held by a worker.
    pub fn shrink_memory(&self, tag: &str) {
        let mut state = self.shared.state.lock();
        if state.queued.get(tag).is_some_and(|queue| queue.is_idle()) {
            state.queued.remove(tag);
        }
    }

    /// Returns true between a successful start and the end of stop.
    pub fn is_started(&self) -> bool {
        self.shared.state.lock().started
    }

    /// Number of alive workers.
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().current_threads
    }

    /// Number of workers waiting for work.
    pub fn idle_thread_count(&self) -> usize {
        self.shared.state.lock().idle_threads
    }

    /// Number of tagged tasks not yet started.
    pub fn queued_task_count(&self) -> usize {
        self.shared.state.lock().queued_task_count
    }

    /// Number of tags that currently own a queue.
    pub fn tag_count(&self) -> usize {
        self.shared.state.lock().queued.len()
    }

    fn try_to_spawn_threads(&self, state: &mut PoolState) {
        let backlog = state.queued_task_count + state.generic.len();
        let mut usable_idle = state.idle_threads;
        if state.generic_worker_idle && state.generic.is_empty() && state.current_threads > 1 {
            usable_idle = usable_idle.saturating_sub(1);
        }
        if backlog <= usable_idle || state.current_threads >= state.max_threads {
            return;
        }

        let target = backlog
            .max(state.current_threads + 1)
            .min(state.max_threads);
        while state.current_threads < target {
            if let Err(err) = self.spawn_worker(state) {
                warn!(error = %err, "[TaskPool] could not grow the pool");
                break;
            }
        }
    }

    fn spawn_worker(&self, state: &mut PoolState) -> CoreResult<()> {
        let name = format!("{}-{}", state.thread_name, state.next_worker_id);
        let shared = Arc::clone(&self.shared);
        thread::Builder::new()
            .name(name)
            .spawn(move || worker::run(shared))
            .map_err(|e| CoreError::out_of_memory(format!("spawn worker: {e}")))?;
        state.next_worker_id += 1;
        state.current_threads += 1;
        debug!(threads = state.current_threads, "[TaskPool] worker spawned");
        Ok(())
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("TaskPool")
            .field("started", &state.started)
            .field("stopping", &state.stopping)
            .field("current_threads", &state.current_threads)
            .field("idle_threads", &state.idle_threads)
            .field("queued_task_count", &state.queued_task_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn start_rejects_bad_bounds() {
        let pool = TaskPool::new();
        assert!(matches!(pool.start(0, 0), Err(CoreError::InvalidArgs { .. })));
        assert!(matches!(pool.start(3, 2), Err(CoreError::InvalidArgs { .. })));
        assert!(!pool.is_started());
    }

    #[test]
    fn start_twice_is_already_set() {
        let pool = TaskPool::new();
        pool.start(1, 2).unwrap();
        assert!(matches!(pool.start(1, 2), Err(CoreError::AlreadySet { .. })));
        pool.stop();
    }

    #[test]
    fn schedule_before_start_is_not_permitted() {
        let pool = TaskPool::new();
        let err = pool.schedule(|| {}).unwrap_err();
        assert!(matches!(err, CoreError::NotPermit { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn schedule_after_stop_is_not_permitted() {
        let pool = TaskPool::new();
        pool.start(1, 1).unwrap();
        pool.stop();
        assert!(!pool.is_started());
        assert!(matches!(
            pool.schedule_keyed("t", || {}),
            Err(CoreError::NotPermit { .. })
        ));
    }

    #[test]
    fn generic_tasks_run() {
        let pool = TaskPool::new();
        pool.start(1, 4).unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.schedule(move || tx.send(i).unwrap()).unwrap();
        }
        let mut seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        pool.stop();
    }

    #[test]
    fn same_tag_runs_in_order() {
        let pool = TaskPool::new();
        pool.start(2, 4).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = Arc::clone(&order);
            pool.schedule_keyed("store", move || {
                thread::sleep(Duration::from_millis(1));
                order.lock().push(i);
            })
            .unwrap();
        }

        assert!(wait_for(|| order.lock().len() == 20, Duration::from_secs(5)));
        assert_eq!(*order.lock(), (0..20).collect::<Vec<_>>());
        pool.stop();
    }

    #[test]
    fn stop_drains_queued_work() {
        let pool = TaskPool::new();
        pool.start(1, 2).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::clone(&done);
            pool.schedule_keyed("tag", move || {
                thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.stop();
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.thread_count(), 0);
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let pool = TaskPool::new();
        pool.start(1, 1).unwrap();

        pool.schedule_keyed("tag", || panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.schedule_keyed("tag", move || tx.send(()).unwrap()).unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.thread_count(), 1);
        pool.stop();
    }

    #[test]
    fn stop_from_worker_does_not_deadlock() {
        let pool = Arc::new(TaskPool::new());
        pool.start(1, 1).unwrap();

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&pool);
        pool.schedule(move || {
            inner.stop();
            tx.send(()).unwrap();
        })
        .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(wait_for(|| !pool.is_started(), Duration::from_secs(5)));
    }

    #[test]
    fn shrink_memory_drops_idle_queues() {
        let pool = TaskPool::new();
        pool.start(1, 1).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.schedule_keyed("tag", move || tx.send(()).unwrap()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(wait_for(
            || {
                pool.shrink_memory("tag");
                pool.tag_count() == 0
            },
            Duration::from_secs(5)
        ));
        pool.stop();
    }
}
