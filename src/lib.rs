// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]

mod core;
mod macros;
mod task;
mod thread_pool;

pub use task::{JoinError, PoolClosed, TaskHandle};
pub use thread_pool::{CpuPinningPolicy, ThreadCount, ThreadPool, ThreadPoolBuilder};

use std::sync::OnceLock;

/// The process-wide pool backing the free functions, created on first use
/// with one worker per hardware thread.
static GLOBAL_POOL: OnceLock<ThreadPool> = OnceLock::new();

fn global_pool() -> &'static ThreadPool {
    GLOBAL_POOL.get_or_init(|| {
        ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    })
}

/// Submits a closure to the process-wide pool and returns a handle to its
/// result.
///
/// The pool is created on first use. After [`close_and_join()`] the handle
/// resolves to [`JoinError::Closed`]. See [`ThreadPool::spawn()`].
///
/// ```
/// let handle = tasklight::spawn(|| 6 * 7);
/// assert_eq!(handle.join().unwrap(), 42);
/// ```
pub fn spawn<F, T>(f: F) -> TaskHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    global_pool().spawn(f)
}

/// Submits a closure to the process-wide pool and blocks until it and every
/// task transitively spawned from it have finished.
///
/// See [`ThreadPool::block_on()`].
pub fn block_on<F, T>(f: F) -> Result<(), PoolClosed>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    global_pool().block_on(f)
}

/// Closes the process-wide pool and joins its workers.
///
/// A no-op if the pool was never used. See [`ThreadPool::close_and_join()`].
pub fn close_and_join() {
    if let Some(pool) = GLOBAL_POOL.get() {
        pool.close_and_join();
    }
}

/// Joins each given [`TaskHandle`] in order and returns the tuple of their
/// results.
///
/// Each tuple element is the corresponding handle's [`join()`] result; a
/// single handle yields a one-element tuple.
///
/// ```
/// use tasklight::{spawn, wait};
///
/// let (a, b) = wait!(spawn(|| 1), spawn(|| 2.5));
/// assert_eq!(a.unwrap(), 1);
/// assert_eq!(b.unwrap(), 2.5);
/// ```
///
/// [`join()`]: TaskHandle::join
#[macro_export]
macro_rules! wait {
    ( $( $handle:expr ),+ $(,)? ) => {
        ( $( $handle.join(), )+ )
    };
}
