// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Task packaging: type erasure, result channels and failure capture.

use crate::core::group::{GroupScope, TaskGroup};
use crossbeam_channel::{bounded, Receiver};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;

/// A type-erased unit of work, executed exactly once by one worker.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Why joining a task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum JoinError {
    /// The task panicked; the panic was captured on the worker and its
    /// payload flattened into this message.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The pool was closed before the task could be enqueued.
    #[error("the pool was closed before the task could run")]
    Closed,
    /// The task was discarded before producing a result.
    #[error("the task was discarded before producing a result")]
    Lost,
}

/// Error of submitting to a pool whose queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the thread pool is closed")]
pub struct PoolClosed;

/// A one-shot handle to the result of a spawned task.
///
/// The worker that executes the task fulfils the handle with the closure's
/// return value, or with a [`JoinError`] if the closure panicked. Handles
/// may be dropped freely: the task still runs.
pub struct TaskHandle<T> {
    result: Receiver<Result<T, JoinError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run and returns its result.
    pub fn join(self) -> Result<T, JoinError> {
        match self.result.recv() {
            Ok(result) => result,
            Err(_) => Err(JoinError::Lost),
        }
    }

    /// Returns whether a result is ready, without blocking.
    pub fn is_finished(&self) -> bool {
        !self.result.is_empty()
    }

    /// Creates a handle that reports [`JoinError::Closed`].
    pub(crate) fn closed() -> Self {
        let (sender, receiver) = bounded(1);
        let _ = sender.send(Err(JoinError::Closed));
        Self { result: receiver }
    }
}

/// Wraps a user closure into an executor task and the handle to its result.
///
/// The task installs `group` into the executing thread's context slot for
/// the duration of the closure, so that nested submissions inherit it; the
/// scope guard lowers the group's counter on every exit path. Panics are
/// captured and forwarded through the handle, never unwound into the worker.
pub(crate) fn package<F, T>(f: F, group: Option<Arc<TaskGroup>>) -> (Task, TaskHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (sender, receiver) = bounded(1);
    let task: Task = Box::new(move || {
        let _scope = GroupScope::enter(group);
        let result = panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| JoinError::Panicked(panic_message(payload.as_ref())));
        // The submitter may have dropped the handle; that's fine.
        let _ = sender.send(result);
    });
    (task, TaskHandle { result: receiver })
}

/// Flattens a panic payload into a printable message.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
