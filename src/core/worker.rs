// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker threads and their dispatch loop.
//!
//! A worker cycles through three work sources: its own deque, a batched
//! drain of the global queue, and a capped steal from the busiest other
//! worker. When all three come up empty it parks briefly and re-evaluates
//! the shutdown condition.

use super::deque::LocalDeque;
use super::shared::Shared;
use crate::macros::{log_debug, log_trace};
use crate::task::Task;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Capacity of each worker's local deque.
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 256;

/// How long an idle worker sleeps before rescanning its work sources.
const IDLE_PARK: Duration = Duration::from_micros(100);

/// One worker of a pool: a local deque plus its stealing state.
pub(crate) struct Worker {
    /// Index of this worker in the pool's registry.
    id: usize,
    /// Tasks queued on this worker.
    deque: LocalDeque<LOCAL_QUEUE_CAPACITY>,
    /// Whether this worker is currently inside a steal attempt. Stealers
    /// skip victims that are themselves stealing.
    stealing: AtomicBool,
}

impl Worker {
    /// Creates the worker with the given registry index.
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            deque: LocalDeque::new(),
            stealing: AtomicBool::new(false),
        }
    }

    /// Returns this worker's local deque.
    pub(crate) fn deque(&self) -> &LocalDeque<LOCAL_QUEUE_CAPACITY> {
        &self.deque
    }

    /// Runs the dispatch loop until shutdown.
    fn run(&self, shared: &Shared) {
        loop {
            if let Some(task) = self.next_task(shared) {
                task();
                continue;
            }
            if let Some(task) = self.try_steal(shared) {
                task();
                continue;
            }
            std::thread::park_timeout(IDLE_PARK);
            if self.should_quit(shared) {
                break;
            }
        }
    }

    /// The worker exits once the global queue is closed and both it and the
    /// local deque have drained.
    fn should_quit(&self, shared: &Shared) -> bool {
        shared.global_queue().is_closed()
            && self.deque.is_empty()
            && shared.global_queue().is_empty()
    }

    /// Fetches the next task from the local deque, falling back to a batched
    /// drain of the global queue.
    fn next_task(&self, shared: &Shared) -> Option<Task> {
        if let Some(task) = self.deque.pop() {
            return Some(task);
        }
        self.drain_from_global(shared)
    }

    /// Moves a batch of global tasks into the local deque and returns the
    /// newest of the batch to run immediately.
    fn drain_from_global(&self, shared: &Shared) -> Option<Task> {
        let global = shared.global_queue();
        if global.is_empty() {
            return None;
        }
        let take = self.deque.remaining().min(LOCAL_QUEUE_CAPACITY / 2);
        if take == 0 {
            return None;
        }
        let mut batch = global.try_pop_batch(take)?;
        let task = batch.pop()?;
        if !batch.is_empty() {
            log_trace!(
                "[worker {}] Drained {} tasks from the global queue",
                self.id,
                batch.len() + 1
            );
            self.deque.push_batch(batch);
        }
        Some(task)
    }

    /// Attempts to steal from the busiest other worker, under the pool-wide
    /// cap on concurrent stealers.
    ///
    /// When no worker is worth robbing, tries one pop from the global queue
    /// instead.
    fn try_steal(&self, shared: &Shared) -> Option<Task> {
        if !shared.try_begin_steal() {
            return None;
        }
        self.stealing.store(true, Ordering::Release);

        let mut victim: Option<&Worker> = None;
        let mut victim_size = 0;
        for other in shared.workers() {
            if other.id == self.id || other.stealing.load(Ordering::Acquire) {
                continue;
            }
            let size = other.deque.size();
            if size > victim_size {
                victim_size = size;
                victim = Some(other);
            }
        }
        let task = match victim {
            Some(victim) => {
                let task = victim.deque.be_stolen_by(&self.deque);
                log_debug!(
                    "[worker {}] Stole from worker {}: {}",
                    self.id,
                    victim.id,
                    if task.is_some() { "success" } else { "contended" }
                );
                task
            }
            None => shared.global_queue().try_pop(),
        };

        self.stealing.store(false, Ordering::Release);
        shared.end_steal();
        task
    }
}

thread_local! {
    /// The worker running on this thread, if it is a worker thread.
    static CURRENT_WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Back reference from a worker thread to its pool.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    /// The pool's shared state.
    pub(crate) shared: Arc<Shared>,
    /// Index of the worker in the registry.
    pub(crate) index: usize,
}

/// Returns the worker context of the calling thread, or [`None`] on
/// non-worker threads.
pub(crate) fn current_worker() -> Option<WorkerContext> {
    CURRENT_WORKER.with(|slot| slot.borrow().clone())
}

/// Body of a worker thread: registers the thread-local context, lines up at
/// the startup barrier, dispatches until shutdown, and lines up at the
/// teardown barrier so the pool joins only fully drained workers.
pub(crate) fn run_worker(shared: Arc<Shared>, index: usize) {
    CURRENT_WORKER.with(|slot| {
        *slot.borrow_mut() = Some(WorkerContext {
            shared: shared.clone(),
            index,
        });
    });
    shared.started().wait();
    log_debug!("[worker {index}] Started");

    shared.worker(index).run(&shared);

    CURRENT_WORKER.with(|slot| {
        *slot.borrow_mut() = None;
    });
    log_debug!("[worker {index}] Shut down");
    shared.stopped().wait();
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn note(log: &Arc<Mutex<Vec<usize>>>, value: usize) -> Task {
        let log = log.clone();
        Box::new(move || log.lock().unwrap().push(value))
    }

    #[test]
    fn test_drain_runs_the_newest_of_the_batch_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Shared::new(2);

        for i in 0..10 {
            shared.global_queue().push(note(&log, i)).unwrap();
        }

        let worker = shared.worker(0);
        let task = worker.drain_from_global(&shared).unwrap();
        task();
        assert_eq!(*log.lock().unwrap(), vec![9]);
        assert_eq!(worker.deque().size(), 9);
        assert!(shared.global_queue().is_empty());

        while let Some(task) = worker.deque().pop() {
            task();
        }
        assert_eq!(*log.lock().unwrap(), vec![9, 0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_drain_of_empty_global_returns_none() {
        let shared = Shared::new(2);
        assert!(shared.worker(0).drain_from_global(&shared).is_none());
    }

    #[test]
    fn test_steal_targets_the_busiest_worker() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Shared::new(4);

        for i in 0..2 {
            shared
                .worker(1)
                .deque()
                .push(note(&log, 100 + i), shared.global_queue())
                .unwrap();
        }
        for i in 0..6 {
            shared
                .worker(2)
                .deque()
                .push(note(&log, 200 + i), shared.global_queue())
                .unwrap();
        }

        // Worker 2 has the most tasks, so worker 0 robs it of half.
        let task = shared.worker(0).try_steal(&shared).unwrap();
        task();
        assert_eq!(*log.lock().unwrap(), vec![202]);
        assert_eq!(shared.worker(0).deque().size(), 2);
        assert_eq!(shared.worker(1).deque().size(), 2);
        assert_eq!(shared.worker(2).deque().size(), 3);

        // The steal slot was released.
        assert!(shared.try_begin_steal());
        shared.end_steal();
    }

    #[test]
    fn test_steal_falls_back_to_the_global_queue() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Shared::new(4);

        shared.global_queue().push(note(&log, 7)).unwrap();
        let task = shared.worker(0).try_steal(&shared).unwrap();
        task();
        assert_eq!(*log.lock().unwrap(), vec![7]);
    }

    #[test]
    fn test_steal_rejected_at_the_cap() {
        let shared = Shared::new(4);
        assert!(shared.try_begin_steal());
        assert!(shared.try_begin_steal());

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..6 {
            shared
                .worker(1)
                .deque()
                .push(note(&log, i), shared.global_queue())
                .unwrap();
        }
        assert!(shared.worker(0).try_steal(&shared).is_none());
        assert_eq!(shared.worker(1).deque().size(), 6);

        shared.end_steal();
        shared.end_steal();
    }

    #[test]
    fn test_quit_condition_requires_close_and_empty_queues() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared = Shared::new(2);
        let worker = shared.worker(0);

        assert!(!worker.should_quit(&shared));

        shared.global_queue().push(note(&log, 0)).unwrap();
        shared.global_queue().close();
        assert!(!worker.should_quit(&shared));

        shared.global_queue().try_pop().unwrap()();
        assert!(worker.should_quit(&shared));
    }
}
