// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The thread pool: worker bring-up, task submission and shutdown.

use crate::core::group::{self, TaskGroup};
use crate::core::shared::Shared;
use crate::core::worker;
use crate::macros::{log_debug, log_error, log_warn};
use crate::task::{self, PoolClosed, TaskHandle};
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Number of threads to spawn in a thread pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a thread pool will panic.
    Always,
}

/// A builder for [`ThreadPool`].
pub struct ThreadPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl ThreadPoolBuilder {
    /// Spawns a thread pool.
    ///
    /// ```
    /// # use tasklight::{CpuPinningPolicy, ThreadCount, ThreadPoolBuilder};
    /// let pool = ThreadPoolBuilder {
    ///     num_threads: ThreadCount::try_from(4).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build();
    ///
    /// let handle = pool.spawn(|| 2 + 2);
    /// assert_eq!(handle.join().unwrap(), 4);
    /// pool.close_and_join();
    /// ```
    pub fn build(&self) -> ThreadPool {
        ThreadPool::new(self)
    }
}

/// A fixed-size pool of worker threads executing spawned tasks.
///
/// The handle is cheaply clonable; every clone drives the same pool, so
/// tasks can capture a clone and spawn further work. Dropping the last clone
/// closes the pool and joins its workers.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

/// State owned by the pool handle(s).
struct PoolInner {
    /// State shared with the worker threads.
    shared: Arc<Shared>,
    /// Handles to all the worker threads in the pool.
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Creates a new thread pool using the given parameters.
    fn new(builder: &ThreadPoolBuilder) -> Self {
        let num_threads: usize = match builder.num_threads {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed")
                .into(),
            ThreadCount::Count(count) => count.into(),
        };
        let cpu_pinning = builder.cpu_pinning;

        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        match cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        let shared = Arc::new(Shared::new(num_threads));
        let threads = (0..num_threads)
            .map(|id| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("tasklight-worker-{id}"))
                    .spawn(move || {
                        #[cfg(all(
                            not(miri),
                            any(
                                target_os = "android",
                                target_os = "dragonfly",
                                target_os = "freebsd",
                                target_os = "linux"
                            )
                        ))]
                        match cpu_pinning {
                            CpuPinningPolicy::No => (),
                            CpuPinningPolicy::IfSupported => {
                                let mut cpu_set = CpuSet::new();
                                if let Err(_e) = cpu_set.set(id) {
                                    log_warn!("Failed to set CPU affinity for worker #{id}: {_e}");
                                } else if let Err(_e) =
                                    sched_setaffinity(Pid::from_raw(0), &cpu_set)
                                {
                                    log_warn!("Failed to set CPU affinity for worker #{id}: {_e}");
                                } else {
                                    log_debug!("Pinned worker #{id} to CPU #{id}");
                                }
                            }
                            CpuPinningPolicy::Always => {
                                let mut cpu_set = CpuSet::new();
                                if let Err(e) = cpu_set.set(id) {
                                    panic!("Failed to set CPU affinity for worker #{id}: {e}");
                                } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set)
                                {
                                    panic!("Failed to set CPU affinity for worker #{id}: {e}");
                                } else {
                                    log_debug!("Pinned worker #{id} to CPU #{id}");
                                }
                            }
                        }
                        worker::run_worker(shared, id);
                    })
                    .expect("Spawning a worker thread failed")
            })
            .collect();

        // Wait until every worker has registered itself, so submissions and
        // steals find a complete registry.
        shared.started().wait();
        log_debug!("[pool] Spawned {num_threads} worker threads");

        Self {
            inner: Arc::new(PoolInner {
                shared,
                threads: Mutex::new(threads),
            }),
        }
    }

    /// Returns the number of worker threads that have been spawned in this
    /// thread pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.inner.shared.workers().len().try_into().unwrap()
    }

    /// Submits a closure for execution and returns a handle to its result.
    ///
    /// Fails if the pool has been closed. If the calling thread is one of
    /// this pool's workers, the task goes to that worker's own deque
    /// (spilling to the shared queue on overflow); otherwise it goes to the
    /// shared queue.
    ///
    /// If the calling thread is executing a task that belongs to a task
    /// group, the new task joins the same group.
    pub fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>, PoolClosed>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let group = group::current_group();
        if let Some(group) = &group {
            group.increment();
        }
        let (task, handle) = task::package(f, group.clone());

        let enqueued = match worker::current_worker() {
            Some(context) if Arc::ptr_eq(&context.shared, &self.inner.shared) => context
                .shared
                .worker(context.index)
                .deque()
                .push(task, context.shared.global_queue()),
            _ => self.inner.shared.global_queue().push(task),
        };

        match enqueued {
            Ok(()) => Ok(handle),
            Err(rejected) => {
                // The task never entered a queue: discard it and give the
                // group its count back, otherwise a pending block_on would
                // wait forever.
                drop(rejected);
                if let Some(group) = &group {
                    group.decrement();
                }
                log_warn!("[pool] Rejected a submission: the pool is closed");
                Err(PoolClosed)
            }
        }
    }

    /// Submits a closure for execution, reporting failures through the
    /// returned handle instead of synchronously.
    ///
    /// On a closed pool the handle resolves to [`JoinError::Closed`].
    ///
    /// [`JoinError::Closed`]: crate::JoinError::Closed
    pub fn spawn<F, T>(&self, f: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.submit(f)
            .unwrap_or_else(|PoolClosed| TaskHandle::closed())
    }

    /// Submits a closure and blocks until it *and every task transitively
    /// spawned from it* have finished.
    ///
    /// The closure's return value is discarded; use [`spawn()`](Self::spawn)
    /// for results. Children that panic still count as finished, so this
    /// returns even when parts of the tree failed.
    ///
    /// Calling this from inside a task is allowed and waits for the nested
    /// tree only, but pins the executing worker until then (see the crate
    /// docs on blocking).
    pub fn block_on<F, T>(&self, f: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let group = Arc::new(TaskGroup::new());
        // Install the fresh group only for the duration of the submission:
        // the root task inherits it there, and restoring the slot right
        // after keeps unrelated submissions from this thread out of it.
        let previous = group::replace_current_group(Some(group.clone()));
        let submitted = self.submit(f).map(drop);
        group::replace_current_group(previous);
        submitted?;
        group.wait();
        Ok(())
    }

    /// Closes the pool and joins all worker threads.
    ///
    /// New submissions are rejected from this point on, but every task
    /// already accepted (including tasks they spawn) still runs; this
    /// returns once the last of them has finished. Idempotent.
    ///
    /// Must not be called from a task running on this pool: a worker cannot
    /// join itself.
    pub fn close_and_join(&self) {
        self.inner.shutdown();
    }
}

impl PoolInner {
    /// Closes the queue and joins all the threads in the pool.
    fn shutdown(&self) {
        self.shared.global_queue().close();
        log_debug!("[pool] Closed; joining worker threads...");
        let mut threads = self.threads.lock().unwrap();
        for (_i, thread) in threads.drain(..).enumerate() {
            let result = thread.join();
            match result {
                Ok(_) => log_debug!("[pool] Worker thread {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[pool] Worker thread {_i} joined with result: {result:?}"),
            }
        }
        log_debug!("[pool] Joined worker threads.");
    }
}

impl Drop for PoolInner {
    /// Closes the pool if the user didn't, and joins the workers.
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pool_of(n: usize) -> ThreadPool {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(n).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
    }

    #[test]
    fn test_thread_count_try_from_usize() {
        assert!(ThreadCount::try_from(0).is_err());
        assert_eq!(
            ThreadCount::try_from(1),
            Ok(ThreadCount::Count(NonZeroUsize::try_from(1).unwrap()))
        );
    }

    #[test]
    fn test_num_threads() {
        let pool = pool_of(3);
        assert_eq!(pool.num_threads(), NonZeroUsize::try_from(3).unwrap());
        pool.close_and_join();
    }

    #[test]
    fn test_build_thread_pool_available_parallelism() {
        let pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build();
        assert_eq!(
            pool.num_threads(),
            std::thread::available_parallelism().unwrap()
        );
        assert_eq!(pool.spawn(|| 1).join().unwrap(), 1);
        pool.close_and_join();
    }

    #[test]
    fn test_build_thread_pool_cpu_pinning_if_supported() {
        let pool = ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::IfSupported,
        }
        .build();
        assert_eq!(pool.spawn(|| 1).join().unwrap(), 1);
        pool.close_and_join();
    }

    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    #[test]
    fn test_build_thread_pool_cpu_pinning_always() {
        let pool = ThreadPoolBuilder {
            num_threads: ThreadCount::AvailableParallelism,
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build();
        assert_eq!(pool.spawn(|| 1).join().unwrap(), 1);
        pool.close_and_join();
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    #[should_panic = "Pinning threads to CPUs is not implemented on this platform."]
    fn test_build_thread_pool_cpu_pinning_always_not_supported() {
        ThreadPoolBuilder {
            num_threads: ThreadCount::try_from(2).unwrap(),
            cpu_pinning: CpuPinningPolicy::Always,
        }
        .build();
    }

    #[test]
    fn test_close_and_join_is_idempotent() {
        let pool = pool_of(2);
        pool.close_and_join();
        pool.close_and_join();
        assert!(pool.submit(|| 1).is_err());
    }

    #[test]
    fn test_drop_joins_the_workers() {
        let handle;
        {
            let pool = pool_of(2);
            handle = pool.spawn(|| 41 + 1);
        }
        // The pool was dropped, but the accepted task still ran.
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn test_clones_drive_the_same_pool() {
        let pool = pool_of(2);
        let clone = pool.clone();
        assert_eq!(clone.spawn(|| 7).join().unwrap(), 7);
        pool.close_and_join();
        assert!(clone.submit(|| 7).is_err());
    }
}
