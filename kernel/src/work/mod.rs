// Copyright (c) 2026 Anillo OS Developers.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Deferred work: asynchronous, delayable, cancellable, reschedulable
//! units run by a pool of kernel threads. Built on timers for the
//! delay, a semaphore for the hand-off to workers and a wait queue
//! for completion.

extern crate alloc;
use crate::{
    config,
    error::{Error, Result},
    interrupt,
    sync::{semaphore::Semaphore, spinlock::SpinLock, waitq::WaitQueue},
    thread::{self, ThreadKind},
    time::{TimerService, TIMER_ID_INVALID},
    types::{Arc, ArcList, AtomicUint, Link, Uint},
};
use alloc::boxed::Box;
use anillo_arch as arch;
use anillo_infra::link_adapter;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

link_adapter!(ViaRunNode, Work, run_node);

pub type WorkRef = Arc<Work>;
type RunList = ArcList<Work, ViaRunNode>;

pub const IDLE: Uint = 0;
pub const PENDING: Uint = 1;
pub const RUNNING: Uint = 2;
pub const FINISHED: Uint = 3;
pub const CANCELLED: Uint = 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WorkFlags: u32 {
        /// Scheduling while the work runs queues one extra run (at
        /// most one).
        const ALLOW_RESCHEDULE = 1 << 0;
        /// Every schedule while running adds a run, every cancel
        /// removes one; the balance runs after completion.
        const REPEATED_RESCHEDULE = 1 << 1;
        /// Same bookkeeping, but the balance coalesces into exactly
        /// one extra run.
        const BALANCED_RESCHEDULE = 1 << 2;
    }
}

pub struct Work {
    pub run_node: Link<Work, ViaRunNode>,
    state: AtomicUint,
    flags: WorkFlags,
    /// Runs owed after the current execution completes.
    resched: AtomicUint,
    timer_id: AtomicU64,
    /// Notified on every transition to finished or cancelled.
    pub completion_waitq: WaitQueue,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl core::fmt::Debug for Work {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Work")
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("flags", &self.flags)
            .finish()
    }
}

// run_node is only touched under the pool's ready-list lock.
unsafe impl Sync for Work {}

impl Work {
    /// Creates an idle work item with one reference. The repeated and
    /// balanced flags imply `ALLOW_RESCHEDULE`; requesting both is a
    /// caller bug.
    pub fn new(cb: impl Fn() + Send + Sync + 'static, mut flags: WorkFlags) -> WorkRef {
        debug_assert!(
            !flags.contains(WorkFlags::REPEATED_RESCHEDULE | WorkFlags::BALANCED_RESCHEDULE)
        );
        if flags.intersects(WorkFlags::REPEATED_RESCHEDULE | WorkFlags::BALANCED_RESCHEDULE) {
            flags |= WorkFlags::ALLOW_RESCHEDULE;
        }
        Arc::new(Self {
            run_node: Link::new(),
            state: AtomicUint::new(IDLE),
            flags,
            resched: AtomicUint::new(0),
            timer_id: AtomicU64::new(TIMER_ID_INVALID),
            completion_waitq: WaitQueue::new(),
            callback: Box::new(cb),
        })
    }

    #[inline]
    pub fn state(&self) -> Uint {
        self.state.load(Ordering::SeqCst)
    }

    #[inline]
    fn transfer_state(&self, from: Uint, to: Uint) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn flags(&self) -> WorkFlags {
        self.flags
    }

    /// Runs still owed from reschedules during the current execution.
    pub fn pending_reruns(&self) -> usize {
        self.resched.load(Ordering::SeqCst)
    }
}

/// A pool of worker threads fed from a FIFO ready list. Each queued
/// item is matched by one semaphore permit.
pub struct WorkPool {
    ready: SpinLock<RunList>,
    queued: Semaphore,
    timers: &'static TimerService,
}

// The ready list is only touched under its lock.
unsafe impl Send for WorkPool {}
unsafe impl Sync for WorkPool {}

impl WorkPool {
    pub const fn new(timers: &'static TimerService) -> Self {
        Self {
            ready: SpinLock::new(RunList::new()),
            queued: Semaphore::new(0),
            timers,
        }
    }

    /// Spawns the worker threads. Call once, after the scheduler is
    /// up.
    pub fn start_workers(&'static self) -> Result {
        for _ in 0..config::NUM_WORKER_THREADS {
            let pool = self;
            thread::Builder::new(thread::Entry::Closure(Box::new(move || {
                pool.run_worker()
            })))
            .set_kind(ThreadKind::Worker)
            .start()?;
        }
        Ok(())
    }

    fn run_worker(&'static self) {
        loop {
            if self.queued.down().is_ok() {
                let _ = self.run_queued_once();
            }
        }
    }

    fn enqueue(&self, w: WorkRef) {
        {
            let mut g = self.ready.irqsave_lock();
            let ok = g.push_back(w);
            debug_assert!(ok);
        }
        self.queued.up();
    }

    /// Queues `work` to run after `delay_ns` (immediately when zero).
    /// While the work is running this queues extra runs per its
    /// flags; without `ALLOW_RESCHEDULE` it fails on pending or
    /// running work.
    pub fn schedule(&'static self, work: &WorkRef, delay_ns: u64) -> Result {
        loop {
            let st = work.state();
            match st {
                IDLE | FINISHED | CANCELLED => {
                    if !work.transfer_state(st, PENDING) {
                        continue;
                    }
                    break;
                }
                RUNNING => {
                    if !work.flags.contains(WorkFlags::ALLOW_RESCHEDULE) {
                        return Err(Error::AlreadyInProgress);
                    }
                    if work
                        .flags
                        .intersects(WorkFlags::REPEATED_RESCHEDULE | WorkFlags::BALANCED_RESCHEDULE)
                    {
                        work.resched.fetch_add(1, Ordering::SeqCst);
                    } else {
                        // Plain allow: at most one extra run.
                        work.resched.store(1, Ordering::SeqCst);
                    }
                    if work.state() != RUNNING {
                        // The runner completed under us; the owed run
                        // was not observed. Fold it into a fresh
                        // schedule instead.
                        work.resched.store(0, Ordering::SeqCst);
                        continue;
                    }
                    return Ok(());
                }
                PENDING => {
                    if work.flags.contains(WorkFlags::ALLOW_RESCHEDULE) {
                        // Already queued; coalesce.
                        return Ok(());
                    }
                    return Err(Error::AlreadyInProgress);
                }
                _ => unreachable!(),
            }
        }
        if delay_ns == 0 {
            self.enqueue(work.clone());
            return Ok(());
        }
        let pool = self;
        let w = work.clone();
        match self.timers.oneshot(delay_ns, move || {
            w.timer_id.store(TIMER_ID_INVALID, Ordering::SeqCst);
            pool.enqueue(w.clone());
        }) {
            Ok(id) => {
                work.timer_id.store(id, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                let ok = work.transfer_state(PENDING, IDLE);
                debug_assert!(ok);
                Err(e)
            }
        }
    }

    /// Creates and schedules in one go. The returned reference is
    /// optional to keep: the pool holds its own while queued.
    pub fn schedule_new(
        &'static self,
        cb: impl Fn() + Send + Sync + 'static,
        delay_ns: u64,
    ) -> Result<WorkRef> {
        let w = Work::new(cb, WorkFlags::empty());
        self.schedule(&w, delay_ns)?;
        Ok(w)
    }

    /// Cancels pending work, or balances one owed run of running
    /// reschedulable work. Running work without `ALLOW_RESCHEDULE`
    /// cannot be cancelled.
    pub fn cancel(&self, work: &WorkRef) -> Result {
        loop {
            match work.state() {
                PENDING => {
                    let tid = work.timer_id.swap(TIMER_ID_INVALID, Ordering::SeqCst);
                    if tid != TIMER_ID_INVALID {
                        if self.timers.cancel(tid).is_err() {
                            // Fired already; it is on (or about to
                            // hit) the ready list.
                            arch::spin_hint();
                            continue;
                        }
                        if !work.transfer_state(PENDING, CANCELLED) {
                            continue;
                        }
                        work.completion_waitq.wake_all();
                        return Ok(());
                    }
                    {
                        let mut g = self.ready.irqsave_lock();
                        if !g.remove(work) {
                            // Between list and runner; try again on
                            // the new state.
                            drop(g);
                            arch::spin_hint();
                            continue;
                        }
                    }
                    let ok = work.transfer_state(PENDING, CANCELLED);
                    debug_assert!(ok);
                    work.completion_waitq.wake_all();
                    return Ok(());
                }
                RUNNING => {
                    if !work.flags.contains(WorkFlags::ALLOW_RESCHEDULE) {
                        return Err(Error::AlreadyInProgress);
                    }
                    let mut n = work.resched.load(Ordering::SeqCst);
                    loop {
                        if n == 0 {
                            return Err(Error::AlreadyInProgress);
                        }
                        match work.resched.compare_exchange_weak(
                            n,
                            n - 1,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        ) {
                            Ok(_) => return Ok(()),
                            Err(cur) => n = cur,
                        }
                    }
                }
                CANCELLED => return Ok(()),
                IDLE | FINISHED => return Err(Error::InvalidArgument),
                _ => unreachable!(),
            }
        }
    }

    /// Waits for `work` to finish or be cancelled. In thread context
    /// this blocks on the completion queue; in interrupt context it
    /// spins (and freezes the CPU if the runner is on this very CPU).
    pub fn wait(&self, work: &WorkRef) -> Result {
        if interrupt::is_in_interrupt() {
            loop {
                match work.state() {
                    FINISHED => return Ok(()),
                    CANCELLED => return Err(Error::Cancelled),
                    IDLE => return Err(Error::InvalidArgument),
                    _ => arch::spin_hint(),
                }
            }
        }
        loop {
            let g = work.completion_waitq.lock();
            match work.state() {
                FINISHED => return Ok(()),
                CANCELLED => return Err(Error::Cancelled),
                IDLE => return Err(Error::InvalidArgument),
                _ => {
                    thread::wait_locked(&work.completion_waitq, g, None)?;
                }
            }
        }
    }

    /// One dequeue-execute cycle; the body of the worker loop.
    /// Returns false when the ready list was empty.
    pub(crate) fn run_queued_once(&'static self) -> bool {
        let popped = self.ready.irqsave_lock().pop_front();
        let Some(w) = popped else {
            return false;
        };
        let ok = w.transfer_state(PENDING, RUNNING);
        debug_assert!(ok, "queued work must be pending");
        (w.callback)();
        let again = if w.flags.contains(WorkFlags::BALANCED_RESCHEDULE) {
            w.resched.swap(0, Ordering::SeqCst) > 0
        } else if w.flags.contains(WorkFlags::REPEATED_RESCHEDULE) {
            let mut n = w.resched.load(Ordering::SeqCst);
            loop {
                if n == 0 {
                    break false;
                }
                match w
                    .resched
                    .compare_exchange_weak(n, n - 1, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => break true,
                    Err(cur) => n = cur,
                }
            }
        } else {
            w.resched.swap(0, Ordering::SeqCst) > 0
        };
        if again {
            let ok = w.transfer_state(RUNNING, PENDING);
            debug_assert!(ok);
            self.enqueue(w.clone());
        } else {
            let ok = w.transfer_state(RUNNING, FINISHED);
            debug_assert!(ok);
            w.completion_waitq.wake_all();
        }
        true
    }

    pub fn queued_len(&self) -> usize {
        self.ready.irqsave_lock().len()
    }
}

static POOL: WorkPool = WorkPool::new(&crate::time::TIMERS);

/// The kernel-wide worker pool.
pub fn default_pool() -> &'static WorkPool {
    &POOL
}

/// Spawns the default pool's worker threads.
pub fn init() -> Result {
    POOL.start_workers()
}

pub fn schedule(work: &WorkRef, delay_ns: u64) -> Result {
    POOL.schedule(work, delay_ns)
}

pub fn schedule_new(cb: impl Fn() + Send + Sync + 'static, delay_ns: u64) -> Result<WorkRef> {
    POOL.schedule_new(cb, delay_ns)
}

pub fn cancel(work: &WorkRef) -> Result {
    POOL.cancel(work)
}

pub fn wait(work: &WorkRef) -> Result {
    POOL.wait(work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::waitq::Waiter;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::sync::{Arc as StdArc, Mutex, OnceLock};

    fn pool() -> &'static WorkPool {
        let svc: &'static TimerService = Box::leak(Box::new(TimerService::new()));
        Box::leak(Box::new(WorkPool::new(svc)))
    }

    #[test]
    fn immediate_schedule_runs_once_and_finishes() {
        let _s = crate::testing::serial();
        let p = pool();
        let runs = StdArc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let w = Work::new(
            move || {
                r.fetch_add(1, O::SeqCst);
            },
            WorkFlags::empty(),
        );
        assert_eq!(w.state(), IDLE);
        p.schedule(&w, 0).unwrap();
        assert_eq!(w.state(), PENDING);
        assert_eq!(p.queued_len(), 1);
        assert!(p.run_queued_once());
        assert_eq!(runs.load(O::SeqCst), 1);
        assert_eq!(w.state(), FINISHED);
        assert!(!p.run_queued_once());
    }

    #[test]
    fn finished_work_can_be_scheduled_again() {
        let _s = crate::testing::serial();
        let p = pool();
        let runs = StdArc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let w = Work::new(
            move || {
                r.fetch_add(1, O::SeqCst);
            },
            WorkFlags::empty(),
        );
        for _ in 0..3 {
            p.schedule(&w, 0).unwrap();
            assert!(p.run_queued_once());
        }
        assert_eq!(runs.load(O::SeqCst), 3);
    }

    #[test]
    fn completion_notifies_waiters() {
        let _s = crate::testing::serial();
        let p = pool();
        let w = Work::new(|| {}, WorkFlags::empty());
        let notified = StdArc::new(AtomicUsize::new(0));
        let n = notified.clone();
        w.completion_waitq.add(Waiter::new(move |_| {
            n.fetch_add(1, O::SeqCst);
        }));
        p.schedule(&w, 0).unwrap();
        p.run_queued_once();
        assert_eq!(notified.load(O::SeqCst), 1);
    }

    #[test]
    fn schedule_while_pending_needs_allow_flag() {
        let _s = crate::testing::serial();
        let p = pool();
        let strict = Work::new(|| {}, WorkFlags::empty());
        p.schedule(&strict, 0).unwrap();
        assert_eq!(p.schedule(&strict, 0), Err(Error::AlreadyInProgress));
        let lax = Work::new(|| {}, WorkFlags::ALLOW_RESCHEDULE);
        p.schedule(&lax, 0).unwrap();
        // Coalesces into the already-queued run.
        assert!(p.schedule(&lax, 0).is_ok());
        assert_eq!(p.queued_len(), 2);
        p.run_queued_once();
        p.run_queued_once();
        assert_eq!(lax.state(), FINISHED);
    }

    #[test]
    fn cancel_of_queued_work_prevents_the_run() {
        let _s = crate::testing::serial();
        let p = pool();
        let runs = StdArc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let w = Work::new(
            move || {
                r.fetch_add(1, O::SeqCst);
            },
            WorkFlags::empty(),
        );
        p.schedule(&w, 0).unwrap();
        p.cancel(&w).unwrap();
        assert_eq!(w.state(), CANCELLED);
        // The permit outlives the item; a drained queue just yields
        // nothing.
        assert!(!p.run_queued_once());
        assert_eq!(runs.load(O::SeqCst), 0);
        // Idempotent.
        assert!(p.cancel(&w).is_ok());
    }

    #[test]
    fn cancel_of_timer_armed_work() {
        let _s = crate::testing::serial();
        let p = pool();
        struct NullBackend;
        impl crate::time::TimerBackend for NullBackend {
            fn name(&self) -> &'static str {
                "null"
            }
            fn precision_ns(&self) -> u64 {
                1
            }
            fn schedule(&self, _d: u64) {}
            fn cancel(&self) {}
            fn timestamp(&self) -> u64 {
                0
            }
            fn delta_to_ns(&self, s: u64, e: u64) -> u64 {
                e - s
            }
        }
        p.timers.register_backend(&NullBackend).unwrap();
        let w = Work::new(|| {}, WorkFlags::empty());
        p.schedule(&w, 1_000_000).unwrap();
        assert_eq!(p.queued_len(), 0);
        p.cancel(&w).unwrap();
        assert_eq!(w.state(), CANCELLED);
    }

    #[test]
    fn deferred_schedule_without_backend_fails_cleanly() {
        let _s = crate::testing::serial();
        let p = pool();
        let w = Work::new(|| {}, WorkFlags::empty());
        assert_eq!(p.schedule(&w, 1_000), Err(Error::TemporaryOutage));
        assert_eq!(w.state(), IDLE);
        // An immediate schedule still works.
        p.schedule(&w, 0).unwrap();
        p.run_queued_once();
        assert_eq!(w.state(), FINISHED);
    }

    #[test]
    fn cancel_of_running_strict_work_is_refused() {
        let _s = crate::testing::serial();
        let p = pool();
        static WORK: OnceLock<WorkRef> = OnceLock::new();
        static POOL_SLOT: OnceLock<&'static WorkPool> = OnceLock::new();
        let result = StdArc::new(Mutex::new(None));
        let res = result.clone();
        let w = Work::new(
            move || {
                let me = WORK.get().unwrap();
                let p = POOL_SLOT.get().unwrap();
                *res.lock().unwrap() = Some(p.cancel(me));
            },
            WorkFlags::empty(),
        );
        WORK.set(w.clone()).ok().unwrap();
        POOL_SLOT.set(p).ok().unwrap();
        p.schedule(&w, 0).unwrap();
        p.run_queued_once();
        assert_eq!(
            result.lock().unwrap().unwrap(),
            Err(Error::AlreadyInProgress)
        );
        assert_eq!(w.state(), FINISHED);
    }

    #[test]
    fn balanced_reschedule_coalesces_to_one_extra_run() {
        let _s = crate::testing::serial();
        let p = pool();
        static WORK: OnceLock<WorkRef> = OnceLock::new();
        static POOL_SLOT: OnceLock<&'static WorkPool> = OnceLock::new();
        let runs = StdArc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let w = Work::new(
            move || {
                let n = r.fetch_add(1, O::SeqCst);
                if n == 0 {
                    let me = WORK.get().unwrap();
                    let p = POOL_SLOT.get().unwrap();
                    for _ in 0..5 {
                        p.schedule(me, 0).unwrap();
                    }
                    for _ in 0..2 {
                        p.cancel(me).unwrap();
                    }
                    assert_eq!(me.pending_reruns(), 3);
                }
            },
            WorkFlags::BALANCED_RESCHEDULE,
        );
        WORK.set(w.clone()).ok().unwrap();
        POOL_SLOT.set(p).ok().unwrap();
        p.schedule(&w, 0).unwrap();
        while p.run_queued_once() {}
        // Five schedules minus two cancels coalesce into exactly one
        // extra run, and the counter resets.
        assert_eq!(runs.load(O::SeqCst), 2);
        assert_eq!(w.pending_reruns(), 0);
        assert_eq!(w.state(), FINISHED);
    }

    #[test]
    fn repeated_reschedule_runs_the_balance() {
        let _s = crate::testing::serial();
        let p = pool();
        static WORK: OnceLock<WorkRef> = OnceLock::new();
        static POOL_SLOT: OnceLock<&'static WorkPool> = OnceLock::new();
        let runs = StdArc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let w = Work::new(
            move || {
                let n = r.fetch_add(1, O::SeqCst);
                if n == 0 {
                    let me = WORK.get().unwrap();
                    let p = POOL_SLOT.get().unwrap();
                    for _ in 0..5 {
                        p.schedule(me, 0).unwrap();
                    }
                    for _ in 0..2 {
                        p.cancel(me).unwrap();
                    }
                }
            },
            WorkFlags::REPEATED_RESCHEDULE,
        );
        WORK.set(w.clone()).ok().unwrap();
        POOL_SLOT.set(p).ok().unwrap();
        p.schedule(&w, 0).unwrap();
        while p.run_queued_once() {}
        // k - j = 3 additional runs.
        assert_eq!(runs.load(O::SeqCst), 4);
        assert_eq!(w.state(), FINISHED);
    }

    #[test]
    fn plain_allow_queues_at_most_one_extra() {
        let _s = crate::testing::serial();
        let p = pool();
        static WORK: OnceLock<WorkRef> = OnceLock::new();
        static POOL_SLOT: OnceLock<&'static WorkPool> = OnceLock::new();
        let runs = StdArc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let w = Work::new(
            move || {
                let n = r.fetch_add(1, O::SeqCst);
                if n == 0 {
                    let me = WORK.get().unwrap();
                    let p = POOL_SLOT.get().unwrap();
                    for _ in 0..4 {
                        p.schedule(me, 0).unwrap();
                    }
                }
            },
            WorkFlags::ALLOW_RESCHEDULE,
        );
        WORK.set(w.clone()).ok().unwrap();
        POOL_SLOT.set(p).ok().unwrap();
        p.schedule(&w, 0).unwrap();
        while p.run_queued_once() {}
        assert_eq!(runs.load(O::SeqCst), 2);
    }

    #[test]
    fn implied_allow_flag_is_set() {
        let _s = crate::testing::serial();
        let w = Work::new(|| {}, WorkFlags::REPEATED_RESCHEDULE);
        assert!(w.flags().contains(WorkFlags::ALLOW_RESCHEDULE));
        let v = Work::new(|| {}, WorkFlags::BALANCED_RESCHEDULE);
        assert!(v.flags().contains(WorkFlags::ALLOW_RESCHEDULE));
    }

    #[test]
    fn cancel_of_idle_work_is_an_illegal_state() {
        let _s = crate::testing::serial();
        let p = pool();
        let w = Work::new(|| {}, WorkFlags::empty());
        assert_eq!(p.cancel(&w), Err(Error::InvalidArgument));
    }
}
