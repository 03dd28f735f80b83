// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bounded single-producer multi-consumer deque with lock-free stealing.
//!
//! Each worker owns one [`LocalDeque`]. The owner pushes and pops at will;
//! other workers transfer half of the pending tasks into their own deque via
//! [`be_stolen_by()`](LocalDeque::be_stolen_by). The head of the ring is
//! split into a steal cursor and a consume cursor packed into a single
//! `AtomicU64`, so that one compare-exchange publishes a steal reservation
//! without ever blocking the owner.

use super::queue::{GlobalQueue, QueueClosed};
use crate::task::Task;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A bounded ring buffer of tasks owned by one worker thread.
///
/// `CAPACITY` must be a power of two. Cursors increase monotonically and wrap
/// modulo 2^32; a cursor maps to the slot `cursor & (CAPACITY - 1)`.
///
/// At any quiescent moment: `steal <= consume <= tail` and
/// `tail - steal <= CAPACITY` (all modulo 2^32). Slots in `[consume, tail)`
/// hold tasks awaiting execution, slots in `[steal, consume)` are being
/// copied out by a stealer, and every other slot is vacant.
pub(crate) struct LocalDeque<const CAPACITY: usize = 256> {
    /// Packed steal and consume cursors.
    head: AtomicSplitHead,
    /// Producer cursor, written only by the owner.
    tail: CachePadded<AtomicU32>,
    /// Fixed ring of task slots.
    slots: Box<[UnsafeCell<MaybeUninit<Task>>]>,
}

/// SAFETY: Tasks are `Send` and the cursor protocol hands every slot to
/// exactly one thread at a time.
unsafe impl<const CAPACITY: usize> Send for LocalDeque<CAPACITY> {}
/// SAFETY: All shared mutation goes through the atomic cursors; a slot is
/// only read or written by the single thread that holds its reservation.
unsafe impl<const CAPACITY: usize> Sync for LocalDeque<CAPACITY> {}

impl<const CAPACITY: usize> LocalDeque<CAPACITY> {
    const MASK: u32 = (CAPACITY - 1) as u32;
    const HALF: u32 = (CAPACITY / 2) as u32;

    /// Creates an empty deque.
    pub(crate) fn new() -> Self {
        assert!(
            CAPACITY.is_power_of_two(),
            "deque capacity must be a power of two"
        );
        assert!(CAPACITY >= 2, "deque capacity must be at least 2");
        assert!(
            CAPACITY <= 1 << 30,
            "deque capacity must fit well within a 32-bit cursor"
        );
        Self {
            head: AtomicSplitHead::new(SplitHead::default()),
            tail: CachePadded::new(AtomicU32::new(0)),
            slots: (0..CAPACITY)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }

    /// Returns the number of tasks awaiting execution.
    ///
    /// The value is approximate under concurrent steals: it is consistent
    /// with some past serialization point.
    pub(crate) fn size(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head.consume()) as usize
    }

    /// Returns the number of vacant slots, counting slots still reserved by
    /// an in-flight steal as occupied.
    pub(crate) fn remaining(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        CAPACITY - tail.wrapping_sub(head.steal()) as usize
    }

    /// Returns whether the deque holds no pending tasks.
    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Appends a task at the tail. Owner only.
    ///
    /// When the deque is full and no steal is in flight, the oldest
    /// `CAPACITY / 2` tasks plus the incoming one are moved to `overflow` as
    /// one batch. When the deque is full while a steal is in flight, the
    /// incoming task alone is diverted to `overflow`: the owner never waits
    /// on a stealer.
    ///
    /// Fails with the task handed back if it had to be diverted to
    /// `overflow` but the queue was closed. Tasks already in the deque are
    /// never lost.
    pub(crate) fn push(&self, task: Task, overflow: &GlobalQueue) -> Result<(), QueueClosed<Task>> {
        let mut task = task;
        let tail = loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if tail.wrapping_sub(head.steal()) < CAPACITY as u32 {
                break tail;
            }
            if head.is_contended() {
                // Full while a stealer holds a reservation: the steal will
                // free slots, but not on the owner's schedule.
                return overflow.push(task);
            }
            match self.spill_half(head, task, overflow) {
                Ok(()) => return Ok(()),
                // A stealer won the race for the head; re-evaluate.
                Err(SpillFailure::Contended(t)) => task = t,
                Err(SpillFailure::Closed(t)) => return Err(QueueClosed(t)),
            }
        };
        // SAFETY: slot `tail` lies outside `[steal, tail)`, so no other
        // thread touches it until the store below publishes the new tail.
        unsafe { self.write_slot(tail, task) };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Appends a batch of tasks at the tail. Owner only.
    ///
    /// The caller must have checked that [`remaining()`](Self::remaining) is
    /// at least `tasks.len()`.
    pub(crate) fn push_batch(&self, tasks: Vec<Task>) {
        debug_assert!(tasks.len() <= self.remaining());
        let mut tail = self.tail.load(Ordering::Acquire);
        for task in tasks {
            // SAFETY: the capacity precondition keeps `tail` outside
            // `[steal, tail)`; the slot is unpublished until the store below.
            unsafe { self.write_slot(tail, task) };
            tail = tail.wrapping_add(1);
        }
        self.tail.store(tail, Ordering::Release);
    }

    /// Removes and returns the oldest pending task, or [`None`] if the deque
    /// is empty. Owner only, but contended by stealers on the head word.
    pub(crate) fn pop(&self) -> Option<Task> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if head.consume() == tail {
                return None;
            }
            let next_consume = head.consume().wrapping_add(1);
            // Keep the cursors paired while no steal is in flight; otherwise
            // the steal cursor belongs to the stealer and stays put.
            let next = if head.is_contended() {
                SplitHead::new(head.steal(), next_consume)
            } else {
                SplitHead::new(next_consume, next_consume)
            };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                // SAFETY: the consume cursor moved past this slot while any
                // steal reservation ends at or before it, so the owner is
                // the only thread left that can read it.
                Ok(()) => return Some(unsafe { self.take_slot(head.consume()) }),
                Err(current) => head = current,
            }
        }
    }

    /// Transfers half of this deque's tasks into `dst` and returns the last
    /// transferred task directly. Invoked by the thread owning `dst`.
    ///
    /// Returns [`None`] if another steal is in flight on this deque, if
    /// there are fewer than two pending tasks, or if `dst` has less than
    /// half its capacity free.
    pub(crate) fn be_stolen_by(&self, dst: &LocalDeque<CAPACITY>) -> Option<Task> {
        let dst_head = dst.head.load(Ordering::Acquire);
        let dst_tail = dst.tail.load(Ordering::Acquire);
        let dst_occupancy = dst_tail.wrapping_sub(dst_head.steal());
        if dst_occupancy > Self::HALF {
            return None;
        }

        // Phase 1: reserve the oldest half by advancing the consume cursor
        // while the steal cursor stays behind, marking the steal in flight.
        let mut head = self.head.load(Ordering::Acquire);
        let (start, len) = loop {
            if head.is_contended() {
                return None;
            }
            let tail = self.tail.load(Ordering::Acquire);
            let len = tail.wrapping_sub(head.consume()) / 2;
            if len == 0 {
                return None;
            }
            let reserved = SplitHead::new(head.steal(), head.consume().wrapping_add(len));
            match self.head.compare_exchange_weak(
                head,
                reserved,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(()) => break (head.consume(), len),
                Err(current) => head = current,
            }
        };
        debug_assert!(dst_occupancy.wrapping_add(len) <= CAPACITY as u32);

        // Phase 2: the reservation `[start, start + len)` is exclusive to
        // this stealer, so the copies need no further synchronization. The
        // last task is handed to the caller instead of being stored.
        for i in 0..len - 1 {
            // SAFETY: the source slot is covered by the reservation and the
            // destination slot lies beyond `dst_tail`, unpublished until the
            // store below; this thread owns `dst`.
            unsafe {
                let task = self.take_slot(start.wrapping_add(i));
                dst.write_slot(dst_tail.wrapping_add(i), task);
            }
        }
        // SAFETY: covered by the same reservation.
        let task = unsafe { self.take_slot(start.wrapping_add(len - 1)) };
        if len > 1 {
            dst.tail
                .store(dst_tail.wrapping_add(len - 1), Ordering::Release);
        }

        // Phase 3: let the steal cursor catch up with the consume cursor.
        // Only the owner competes here (by popping), so the loop always
        // makes progress.
        let mut current = SplitHead::new(start, start.wrapping_add(len));
        loop {
            let next = SplitHead::new(current.consume(), current.consume());
            match self.head.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(()) => break,
                Err(now) => current = now,
            }
        }
        Some(task)
    }

    /// Moves the oldest half of the deque plus `task` to the overflow queue.
    ///
    /// The caller observed `head` with paired cursors and a full ring.
    fn spill_half(
        &self,
        head: SplitHead,
        task: Task,
        overflow: &GlobalQueue,
    ) -> Result<(), SpillFailure> {
        debug_assert!(!head.is_contended());
        let start = head.consume();
        let claimed = start.wrapping_add(Self::HALF);
        // Claiming the prefix and keeping the cursors paired in one shot
        // means a concurrent stealer either sees the old head (and races
        // this CAS) or the new one (and only finds the remaining half).
        let next = SplitHead::new(claimed, claimed);
        if self
            .head
            .compare_exchange_weak(head, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Err(SpillFailure::Contended(task));
        }
        let mut batch = Vec::with_capacity(Self::HALF as usize + 1);
        for i in 0..Self::HALF {
            // SAFETY: the claimed prefix is below both cursors and only the
            // owner (this thread) can recycle those slots.
            batch.push(unsafe { self.take_slot(start.wrapping_add(i)) });
        }
        batch.push(task);
        match overflow.push_batch(batch) {
            Ok(()) => Ok(()),
            Err(QueueClosed(mut batch)) => {
                // The queue closed in between. Put the reserved half back
                // (the claim freed exactly enough room) and fail only the
                // incoming task.
                let task = batch.pop().expect("spilled batch is never empty");
                self.push_batch(batch);
                Err(SpillFailure::Closed(task))
            }
        }
    }

    /// Stores a task in the slot designated by `cursor`.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive reservation for that slot, and the
    /// slot must be vacant.
    unsafe fn write_slot(&self, cursor: u32, task: Task) {
        let slot = &self.slots[(cursor & Self::MASK) as usize];
        unsafe { (*slot.get()).write(task) };
    }

    /// Moves the task out of the slot designated by `cursor`.
    ///
    /// # Safety
    ///
    /// The caller must hold the exclusive reservation for that slot, the
    /// slot must be initialized, and it must not be read again.
    unsafe fn take_slot(&self, cursor: u32) -> Task {
        let slot = &self.slots[(cursor & Self::MASK) as usize];
        unsafe { (*slot.get()).assume_init_read() }
    }
}

impl<const CAPACITY: usize> Drop for LocalDeque<CAPACITY> {
    /// Drops any task that was never executed.
    fn drop(&mut self) {
        while let Some(task) = self.pop() {
            drop(task);
        }
    }
}

/// Why a spill can fail, with the incoming task handed back.
enum SpillFailure {
    /// A stealer reserved the head first; the push must re-evaluate.
    Contended(Task),
    /// The overflow queue is closed; the deque content was restored.
    Closed(Task),
}

/// A (steal, consume) cursor pair packed into a `u64`, so that it can be
/// loaded and compare-exchanged atomically. The steal cursor occupies the
/// high 32 bits, the consume cursor the low 32 bits.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
struct SplitHead(u64);

impl SplitHead {
    /// Packs the given cursor pair.
    #[inline(always)]
    fn new(steal: u32, consume: u32) -> Self {
        Self(((steal as u64) << 32) | consume as u64)
    }

    /// Reads the steal cursor.
    #[inline(always)]
    fn steal(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Reads the consume cursor.
    #[inline(always)]
    fn consume(self) -> u32 {
        self.0 as u32
    }

    /// Returns whether a steal is in flight, i.e. the cursors differ.
    #[inline(always)]
    fn is_contended(self) -> bool {
        self.steal() != self.consume()
    }
}

/// A [`SplitHead`] that can atomically be modified.
struct AtomicSplitHead(CachePadded<AtomicU64>);

impl AtomicSplitHead {
    /// Creates a new atomic head.
    #[inline(always)]
    fn new(head: SplitHead) -> Self {
        AtomicSplitHead(CachePadded::new(AtomicU64::new(head.0)))
    }

    /// Atomically loads the head.
    #[inline(always)]
    fn load(&self, order: Ordering) -> SplitHead {
        SplitHead(self.0.load(order))
    }

    /// Atomically compares and exchanges the head. In case of failure, the
    /// head contained in the atomic variable is returned.
    #[inline(always)]
    fn compare_exchange_weak(
        &self,
        before: SplitHead,
        after: SplitHead,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), SplitHead> {
        match self
            .0
            .compare_exchange_weak(before.0, after.0, success, failure)
        {
            Ok(_) => Ok(()),
            Err(e) => Err(SplitHead(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Mutex};

    /// Makes a task that appends `value` to the shared log when it runs.
    fn note(log: &Arc<Mutex<Vec<usize>>>, value: usize) -> Task {
        let log = log.clone();
        Box::new(move || log.lock().unwrap().push(value))
    }

    /// Asserts the quiescent cursor invariants.
    fn assert_quiescent<const CAPACITY: usize>(deque: &LocalDeque<CAPACITY>) {
        let head = deque.head.load(Ordering::Acquire);
        let tail = deque.tail.load(Ordering::Acquire);
        assert!(!head.is_contended());
        assert!(tail.wrapping_sub(head.steal()) as usize <= CAPACITY);
    }

    #[test]
    fn test_split_head_round_trips() {
        for steal in [0, 1, 7, u32::MAX - 1, u32::MAX] {
            for consume in [0, 1, 7, u32::MAX - 1, u32::MAX] {
                let head = SplitHead::new(steal, consume);
                assert_eq!(head.steal(), steal);
                assert_eq!(head.consume(), consume);
                assert_eq!(head.is_contended(), steal != consume);
            }
        }
    }

    #[test]
    fn test_push_pop_is_fifo() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let deque = LocalDeque::<8>::new();
        let global = GlobalQueue::new();

        for i in 0..5 {
            deque.push(note(&log, i), &global).unwrap();
        }
        assert_eq!(deque.size(), 5);
        assert_eq!(deque.remaining(), 3);

        while let Some(task) = deque.pop() {
            task();
        }
        assert!(deque.is_empty());
        assert!(global.is_empty());
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_quiescent(&deque);
    }

    #[test]
    fn test_cursors_wrap_around() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let deque = LocalDeque::<4>::new();
        let global = GlobalQueue::new();

        // Many more pushes than the capacity, interleaved with pops, so the
        // cursors lap the ring repeatedly.
        for round in 0..100 {
            for i in 0..3 {
                deque.push(note(&log, round * 3 + i), &global).unwrap();
            }
            for _ in 0..3 {
                deque.pop().unwrap()();
            }
        }
        assert!(deque.is_empty());
        assert_eq!(*log.lock().unwrap(), (0..300).collect::<Vec<_>>());
        assert_quiescent(&deque);
    }

    #[test]
    fn test_overflow_spills_exactly_at_capacity_plus_one() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let deque = LocalDeque::<8>::new();
        let global = GlobalQueue::new();

        // Filling the deque exactly doesn't spill.
        for i in 0..8 {
            deque.push(note(&log, i), &global).unwrap();
        }
        assert_eq!(deque.size(), 8);
        assert!(global.is_empty());

        // One more push moves the oldest half plus the new task out.
        deque.push(note(&log, 8), &global).unwrap();
        assert_eq!(deque.size(), 4);
        assert_eq!(global.len(), 5);

        while let Some(task) = deque.pop() {
            task();
        }
        while let Some(task) = global.try_pop() {
            task();
        }
        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
        assert_quiescent(&deque);
    }

    #[test]
    fn test_full_push_diverts_to_global_while_steal_in_flight() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let deque = LocalDeque::<8>::new();
        let global = GlobalQueue::new();

        for i in 0..8 {
            deque.push(note(&log, i), &global).unwrap();
        }
        // Pretend a stealer reserved the two oldest slots.
        let paired = deque.head.load(Ordering::Acquire);
        deque
            .head
            .0
            .store(SplitHead::new(paired.steal(), paired.consume().wrapping_add(2)).0, Ordering::Release);

        deque.push(note(&log, 8), &global).unwrap();
        assert_eq!(global.len(), 1);

        // Roll the reservation back and drain everything.
        deque.head.0.store(paired.0, Ordering::Release);
        while let Some(task) = deque.pop() {
            task();
        }
        global.try_pop().unwrap()();
        let mut seen = log.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn test_steal_transfers_half_and_returns_the_newest_stolen() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let src = LocalDeque::<8>::new();
        let dst = LocalDeque::<8>::new();
        let global = GlobalQueue::new();

        for i in 0..6 {
            src.push(note(&log, i), &global).unwrap();
        }

        // Half of 6 is 3: tasks 0 and 1 land in `dst`, task 2 comes back.
        let task = src.be_stolen_by(&dst).unwrap();
        task();
        assert_eq!(src.size(), 3);
        assert_eq!(dst.size(), 2);
        assert_eq!(*log.lock().unwrap(), vec![2]);

        while let Some(task) = dst.pop() {
            task();
        }
        while let Some(task) = src.pop() {
            task();
        }
        assert_eq!(*log.lock().unwrap(), vec![2, 0, 1, 3, 4, 5]);
        assert_quiescent(&src);
        assert_quiescent(&dst);
    }

    #[test]
    fn test_steal_of_single_task_returns_none() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let src = LocalDeque::<8>::new();
        let dst = LocalDeque::<8>::new();
        let global = GlobalQueue::new();

        assert!(src.be_stolen_by(&dst).is_none());

        src.push(note(&log, 0), &global).unwrap();
        assert!(src.be_stolen_by(&dst).is_none());
        assert_eq!(src.size(), 1);
    }

    #[test]
    fn test_steal_rejected_when_destination_is_half_full() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let src = LocalDeque::<8>::new();
        let dst = LocalDeque::<8>::new();
        let global = GlobalQueue::new();

        for i in 0..6 {
            src.push(note(&log, i), &global).unwrap();
        }
        for i in 0..5 {
            dst.push(note(&log, 10 + i), &global).unwrap();
        }
        assert!(src.be_stolen_by(&dst).is_none());
        assert_eq!(src.size(), 6);
        assert_eq!(dst.size(), 5);
    }

    #[test]
    fn test_steal_rejected_while_another_steal_is_in_flight() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let src = LocalDeque::<8>::new();
        let dst = LocalDeque::<8>::new();
        let global = GlobalQueue::new();

        for i in 0..6 {
            src.push(note(&log, i), &global).unwrap();
        }
        let paired = src.head.load(Ordering::Acquire);
        src.head
            .0
            .store(SplitHead::new(paired.steal(), paired.consume().wrapping_add(2)).0, Ordering::Release);
        assert!(src.be_stolen_by(&dst).is_none());
        src.head.0.store(paired.0, Ordering::Release);
    }

    #[test]
    fn test_owner_pops_while_stealers_steal() {
        #[cfg(not(miri))]
        const NUM_TASKS: usize = 20_000;
        #[cfg(miri)]
        const NUM_TASKS: usize = 300;
        const NUM_STEALERS: usize = 3;

        let deque = LocalDeque::<64>::new();
        let global = GlobalQueue::new();
        let executed = Arc::new(AtomicUsize::new(0));
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            for _ in 0..NUM_STEALERS {
                s.spawn(|| {
                    let dst = LocalDeque::<64>::new();
                    while !done.load(Ordering::Acquire) {
                        if let Some(task) = deque.be_stolen_by(&dst) {
                            task();
                            while let Some(task) = dst.pop() {
                                task();
                            }
                        } else {
                            std::thread::yield_now();
                        }
                    }
                });
            }

            for _ in 0..NUM_TASKS {
                let executed = executed.clone();
                let task: Task = Box::new(move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                });
                deque.push(task, &global).unwrap();
                if let Some(task) = deque.pop() {
                    task();
                }
            }
            // Drain whatever the stealers left behind, including spills.
            while executed.load(Ordering::Relaxed) < NUM_TASKS {
                if let Some(task) = deque.pop() {
                    task();
                } else if let Some(task) = global.try_pop() {
                    task();
                } else {
                    std::thread::yield_now();
                }
            }
            done.store(true, Ordering::Release);
        });

        assert_eq!(executed.load(Ordering::Relaxed), NUM_TASKS);
        assert!(deque.is_empty());
        assert!(global.is_empty());
        assert_quiescent(&deque);
    }

    #[test]
    fn test_drop_releases_pending_tasks() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let global = GlobalQueue::new();
        {
            let deque = LocalDeque::<8>::new();
            for _ in 0..5 {
                let dropped = dropped.clone();
                let holder = DropCounter(dropped);
                let task: Task = Box::new(move || {
                    let _ = &holder;
                });
                deque.push(task, &global).unwrap();
            }
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 5);
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}
