// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task-group scorekeeping for structured concurrency.
//!
//! A [`TaskGroup`] counts the tasks outstanding in one [`block_on`] scope:
//! the submitter raises the counter before a task is enqueued, and the
//! task's [`GroupScope`] guard lowers it once the task has run. Because the
//! guard also installs the group into the executing thread's context slot,
//! nested submissions inherit the group and are counted too.
//!
//! [`block_on`]: crate::ThreadPool::block_on

use crossbeam_utils::CachePadded;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// A counter of the tasks outstanding (enqueued or running) in one
/// structured-concurrency scope.
///
/// Counter updates are lock-free; the mutex below only serializes the
/// wake-up handshake of [`wait()`](Self::wait) against the final decrement.
pub(crate) struct TaskGroup {
    /// Number of outstanding tasks.
    running: CachePadded<AtomicU64>,
    /// Serializes waiters against the releasing decrement.
    lock: Mutex<()>,
    /// Signalled when the counter reaches zero.
    on_zero: Condvar,
}

impl TaskGroup {
    /// Creates a group with no outstanding tasks.
    pub(crate) fn new() -> Self {
        Self {
            running: CachePadded::new(AtomicU64::new(0)),
            lock: Mutex::new(()),
            on_zero: Condvar::new(),
        }
    }

    /// Records one more outstanding task.
    pub(crate) fn increment(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the completion of one task, waking all waiters if it was the
    /// last one. The release ordering makes the task's side effects visible
    /// to the woken waiters.
    pub(crate) fn decrement(&self) {
        if self.running.fetch_sub(1, Ordering::Release) == 1 {
            // Taking the lock orders this wake-up after any waiter's
            // re-check of the counter.
            let _guard = self.lock.lock().unwrap();
            self.on_zero.notify_all();
        }
    }

    /// Blocks until the counter reaches zero.
    pub(crate) fn wait(&self) {
        if self.running.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.lock.lock().unwrap();
        while self.running.load(Ordering::Acquire) != 0 {
            guard = self.on_zero.wait(guard).unwrap();
        }
    }
}

thread_local! {
    /// The group this thread is presently acting on behalf of, if any.
    static CURRENT_GROUP: RefCell<Option<Arc<TaskGroup>>> = const { RefCell::new(None) };
}

/// Returns the group installed in this thread's context slot, if any.
pub(crate) fn current_group() -> Option<Arc<TaskGroup>> {
    CURRENT_GROUP.with(|slot| slot.borrow().clone())
}

/// Installs `group` into this thread's context slot and returns the previous
/// occupant.
pub(crate) fn replace_current_group(group: Option<Arc<TaskGroup>>) -> Option<Arc<TaskGroup>> {
    CURRENT_GROUP.with(|slot| slot.replace(group))
}

/// Guard installing a group for the duration of one task's execution.
///
/// On drop, whether the task returned or panicked, the previous context slot
/// value is restored and the group's counter is lowered.
pub(crate) struct GroupScope {
    group: Option<Arc<TaskGroup>>,
    previous: Option<Arc<TaskGroup>>,
}

impl GroupScope {
    /// Saves the calling thread's current group and installs `group` instead.
    pub(crate) fn enter(group: Option<Arc<TaskGroup>>) -> Self {
        let previous = replace_current_group(group.clone());
        Self { group, previous }
    }
}

impl Drop for GroupScope {
    fn drop(&mut self) {
        replace_current_group(self.previous.take());
        if let Some(group) = self.group.take() {
            group.decrement();
        }
    }
}
