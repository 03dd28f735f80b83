// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! State shared by all workers of one pool.

use super::queue::GlobalQueue;
use super::worker::Worker;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;

/// The worker registry, global queue and stealing cap of one pool.
///
/// The registry is built before any worker thread starts and never changes,
/// so workers read it without synchronization.
pub(crate) struct Shared {
    /// All workers, indexed by id.
    workers: Box<[Worker]>,
    /// FIFO of external submissions and local overflow.
    global_queue: GlobalQueue,
    /// Number of workers currently inside a steal attempt.
    active_stealers: CachePadded<AtomicUsize>,
    /// Arrival point for the workers and the constructing thread, so that
    /// every worker is registered before any of them runs.
    started: Barrier,
    /// Arrival point for the workers during teardown.
    stopped: Barrier,
}

impl Shared {
    /// Creates the shared state for `num_workers` workers.
    pub(crate) fn new(num_workers: usize) -> Self {
        assert!(num_workers > 0, "a pool needs at least one worker");
        Self {
            workers: (0..num_workers).map(Worker::new).collect(),
            global_queue: GlobalQueue::new(),
            active_stealers: CachePadded::new(AtomicUsize::new(0)),
            started: Barrier::new(num_workers + 1),
            stopped: Barrier::new(num_workers),
        }
    }

    /// Returns all workers.
    pub(crate) fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Returns the worker with the given id.
    pub(crate) fn worker(&self, id: usize) -> &Worker {
        &self.workers[id]
    }

    /// Returns the global queue.
    pub(crate) fn global_queue(&self) -> &GlobalQueue {
        &self.global_queue
    }

    /// Returns the startup barrier.
    pub(crate) fn started(&self) -> &Barrier {
        &self.started
    }

    /// Returns the teardown barrier.
    pub(crate) fn stopped(&self) -> &Barrier {
        &self.stopped
    }

    /// Ceiling on the number of simultaneously stealing workers. Bounds the
    /// cache-coherence traffic of an all-steal storm.
    pub(crate) fn steal_cap(&self) -> usize {
        self.workers.len() / 2
    }

    /// Tries to enter a steal attempt, failing when the cap is reached.
    ///
    /// The compare-exchange admission means the count never commits above
    /// the cap. A successful call must be paired with
    /// [`end_steal()`](Self::end_steal).
    pub(crate) fn try_begin_steal(&self) -> bool {
        let cap = self.steal_cap();
        let mut current = self.active_stealers.load(Ordering::Acquire);
        loop {
            if current >= cap {
                return false;
            }
            match self.active_stealers.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(now) => current = now,
            }
        }
    }

    /// Leaves a steal attempt entered with [`try_begin_steal()`](Self::try_begin_steal).
    pub(crate) fn end_steal(&self) {
        let previous = self.active_stealers.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0);
    }
}
