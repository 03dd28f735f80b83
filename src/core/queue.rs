// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared FIFO buffering external submissions and local overflow.

use crate::task::Task;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// An unbounded queue of tasks guarded by a single mutex, with a terminal
/// closed state.
///
/// Closing rejects further pushes but keeps the queue drainable: emptiness
/// after close means no more work will ever arrive.
pub(crate) struct GlobalQueue {
    /// The tasks, oldest first.
    queue: Mutex<VecDeque<Task>>,
    /// Whether the queue has been closed.
    closed: AtomicBool,
}

/// Error of pushing into a closed [`GlobalQueue`]. Carries the rejected
/// payload back to the caller so that it is never silently dropped.
pub(crate) struct QueueClosed<T>(pub(crate) T);

impl<T> fmt::Debug for QueueClosed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueClosed")
    }
}

impl GlobalQueue {
    /// Creates an open, empty queue.
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns whether the queue has been closed.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the queue. Terminal: further pushes fail, pops keep draining.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns the number of queued tasks.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns whether the queue holds no tasks.
    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Appends a task, unless the queue is closed.
    pub(crate) fn push(&self, task: Task) -> Result<(), QueueClosed<Task>> {
        if self.is_closed() {
            return Err(QueueClosed(task));
        }
        self.lock().push_back(task);
        Ok(())
    }

    /// Appends a batch of tasks in order, unless the queue is closed.
    pub(crate) fn push_batch(&self, tasks: Vec<Task>) -> Result<(), QueueClosed<Vec<Task>>> {
        if self.is_closed() {
            return Err(QueueClosed(tasks));
        }
        self.lock().extend(tasks);
        Ok(())
    }

    /// Removes and returns the oldest task, if any.
    pub(crate) fn try_pop(&self) -> Option<Task> {
        self.lock().pop_front()
    }

    /// Removes and returns up to `max` of the oldest tasks, in FIFO order,
    /// or [`None`] if the queue is empty.
    pub(crate) fn try_pop_batch(&self, max: usize) -> Option<Vec<Task>> {
        let mut queue = self.lock();
        let count = queue.len().min(max);
        if count == 0 {
            return None;
        }
        Some(queue.drain(..count).collect())
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.queue.lock().unwrap()
    }
}
