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

extern crate alloc;
use super::TimerBackend;
use crate::{
    config::{MAX_TIMER_BACKENDS, MIN_SCHED_DELAY_NS},
    error::{Error, Result},
    sync::spinlock::SpinLock,
    types::Arc,
};
use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub type TimerId = u64;
pub const TIMER_ID_INVALID: TimerId = 0;

/// One pending one-shot. `remaining_ns` and `stamp` are only mutated
/// under the service's queue lock; they are atomics so the entry can
/// sit in a shared heap.
struct Timer {
    id: TimerId,
    remaining_ns: AtomicU64,
    /// Timestamp of the last remaining-delay recalculation.
    stamp: AtomicU64,
    disabled: AtomicBool,
    callback: SpinLock<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Timer {
    #[inline]
    fn remaining(&self) -> u64 {
        self.remaining_ns.load(Ordering::Relaxed)
    }

    #[inline]
    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.id)
            .field("remaining_ns", &self.remaining())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// Binary min-heap keyed by remaining delay. Root is always the next
/// enabled timer to fire, or a disabled entry about to be reaped.
#[derive(Debug, Default)]
struct TimerQueue {
    heap: Vec<Arc<Timer>>,
}

impl TimerQueue {
    const fn new() -> Self {
        Self { heap: Vec::new() }
    }

    fn push(&mut self, t: Arc<Timer>) {
        self.heap.push(t);
        self.sift_up(self.heap.len() - 1);
    }

    fn peek(&self) -> Option<&Arc<Timer>> {
        self.heap.first()
    }

    fn pop_root(&mut self) -> Option<Arc<Timer>> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let root = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        root
    }

    fn index_of(&self, id: TimerId) -> Option<usize> {
        self.heap.iter().position(|t| t.id == id)
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].remaining() >= self.heap[parent].remaining() {
                break;
            }
            self.heap.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut smallest = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.heap.len()
                    && self.heap[child].remaining() < self.heap[smallest].remaining()
                {
                    smallest = child;
                }
            }
            if smallest == i {
                return;
            }
            self.heap.swap(i, smallest);
            i = smallest;
        }
    }
}

struct BackendTable {
    slots: [Option<&'static dyn TimerBackend>; MAX_TIMER_BACKENDS],
    active: Option<usize>,
    /// Timestamp on the active backend when it became active.
    epoch: u64,
    /// Monotonic nanoseconds accumulated on previous backends.
    base_ns: u64,
}

impl BackendTable {
    const fn new() -> Self {
        Self {
            slots: [None; MAX_TIMER_BACKENDS],
            active: None,
            epoch: 0,
            base_ns: 0,
        }
    }

    fn active_backend(&self) -> Option<&'static dyn TimerBackend> {
        self.active.and_then(|i| self.slots[i])
    }
}

/// The timer service proper. Two locks, always in this order: the
/// backend lock, then the queue lock. Callbacks run with both
/// dropped.
pub struct TimerService {
    backends: SpinLock<BackendTable>,
    queue: SpinLock<TimerQueue>,
    next_id: AtomicU64,
}

impl TimerService {
    pub const fn new() -> Self {
        Self {
            backends: SpinLock::new(BackendTable::new()),
            queue: SpinLock::new(TimerQueue::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Brings every entry's remaining delay current against `b`'s
    /// clock. Subtracting the same elapsed time (clamped at zero)
    /// preserves heap order. Returns the timestamp used.
    fn recalc(q: &mut TimerQueue, b: &dyn TimerBackend) -> u64 {
        let now = b.timestamp();
        for t in q.heap.iter() {
            let elapsed = b.delta_to_ns(t.stamp.load(Ordering::Relaxed), now);
            let left = t.remaining().saturating_sub(elapsed);
            t.remaining_ns.store(left, Ordering::Relaxed);
            t.stamp.store(now, Ordering::Relaxed);
        }
        now
    }

    fn arm(b: &dyn TimerBackend, q: &TimerQueue) {
        if let Some(root) = q.peek() {
            // The floor keeps a burst of due timers from re-arming
            // the hardware at zero over and over.
            b.schedule(root.remaining().saturating_add(MIN_SCHED_DELAY_NS));
        }
    }

    /// Schedules `cb` to run once, at least `delay_ns` from now.
    /// Fails with [`Error::TemporaryOutage`] until a backend is
    /// registered.
    pub fn oneshot(&self, delay_ns: u64, cb: impl Fn() + Send + Sync + 'static) -> Result<TimerId> {
        let tbl = self.backends.irqsave_lock();
        let Some(backend) = tbl.active_backend() else {
            return Err(Error::TemporaryOutage);
        };
        let mut q = self.queue.irqsave_lock();
        let now = Self::recalc(&mut q, backend);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        q.push(Arc::new(Timer {
            id,
            remaining_ns: AtomicU64::new(delay_ns),
            stamp: AtomicU64::new(now),
            disabled: AtomicBool::new(false),
            callback: SpinLock::new(Some(Box::new(cb))),
        }));
        Self::arm(backend, &q);
        Ok(id)
    }

    /// Marks the timer disabled; it will be reaped by the next fire
    /// without running its callback.
    pub fn cancel(&self, id: TimerId) -> Result {
        if id == TIMER_ID_INVALID {
            return Err(Error::InvalidArgument);
        }
        let tbl = self.backends.irqsave_lock();
        let mut q = self.queue.irqsave_lock();
        let Some(i) = q.index_of(id) else {
            return Err(Error::NoSuchResource);
        };
        let t = &q.heap[i];
        t.disabled.store(true, Ordering::Relaxed);
        // Release whatever the callback captured right away.
        let _cb = t.callback.irqsave_lock().take();
        if i == 0 {
            if let Some(b) = tbl.active_backend() {
                b.cancel();
                // Fire soon so the dead root gets reaped and the next
                // entry armed.
                b.schedule(MIN_SCHED_DELAY_NS);
            }
        }
        Ok(())
    }

    /// Backend interrupt entry point: runs every due timer, reaps
    /// disabled entries, re-arms for the new root. Callbacks run with
    /// both service locks dropped and never nest on one CPU.
    pub fn handle_fire(&self) {
        loop {
            let tbl = self.backends.irqsave_lock();
            let Some(backend) = tbl.active_backend() else {
                return;
            };
            let mut q = self.queue.irqsave_lock();
            Self::recalc(&mut q, backend);
            let Some(root) = q.peek() else {
                return;
            };
            let due = root.remaining() == 0;
            let disabled = root.is_disabled();
            if !due && !disabled {
                Self::arm(backend, &q);
                return;
            }
            let t = q.pop_root().expect("non-empty heap has a root");
            Self::arm(backend, &q);
            drop(q);
            drop(tbl);
            if !disabled {
                let cb = t.callback.irqsave_lock().take();
                if let Some(cb) = cb {
                    cb();
                }
            }
        }
    }

    /// Adds a backend. The service switches over only when the new
    /// backend is strictly more precise; pending deadlines carry over
    /// against monotonic time.
    pub fn register_backend(&self, b: &'static dyn TimerBackend) -> Result {
        let mut tbl = self.backends.irqsave_lock();
        let idx = tbl
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Error::TemporaryOutage)?;
        tbl.slots[idx] = Some(b);
        let switch = match tbl.active_backend() {
            None => true,
            Some(cur) => b.precision_ns() < cur.precision_ns(),
        };
        if !switch {
            return Ok(());
        }
        let mut q = self.queue.irqsave_lock();
        if let Some(old) = tbl.active_backend() {
            // Bring remainders current on the old clock, then retire
            // it from the monotonic baseline.
            Self::recalc(&mut q, old);
            old.cancel();
            tbl.base_ns += old.delta_to_ns(tbl.epoch, old.timestamp());
        }
        tbl.active = Some(idx);
        tbl.epoch = b.timestamp();
        for t in q.heap.iter() {
            t.stamp.store(tbl.epoch, Ordering::Relaxed);
        }
        Self::arm(b, &q);
        log::info!(
            "timer backend switched to {} ({} ns precision)",
            b.name(),
            b.precision_ns()
        );
        Ok(())
    }

    /// Monotonic nanoseconds; zero until the first backend registers.
    pub fn now_ns(&self) -> u64 {
        let tbl = self.backends.irqsave_lock();
        match tbl.active_backend() {
            Some(b) => tbl.base_ns + b.delta_to_ns(tbl.epoch, b.timestamp()),
            None => 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn heap_snapshot(&self) -> Vec<(TimerId, u64, bool)> {
        let q = self.queue.irqsave_lock();
        q.heap
            .iter()
            .map(|t| (t.id, t.remaining(), t.is_disabled()))
            .collect()
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct MockBackend {
        name: &'static str,
        precision: u64,
        now: AtomicU64,
        armed: Mutex<Vec<u64>>,
        cancels: AtomicUsize,
    }

    impl MockBackend {
        fn install(name: &'static str, precision: u64) -> &'static MockBackend {
            Box::leak(Box::new(MockBackend {
                name,
                precision,
                now: AtomicU64::new(0),
                armed: Mutex::new(Vec::new()),
                cancels: AtomicUsize::new(0),
            }))
        }

        fn advance(&self, ns: u64) {
            self.now.fetch_add(ns, Ordering::SeqCst);
        }

        fn last_armed(&self) -> Option<u64> {
            self.armed.lock().unwrap().last().copied()
        }
    }

    impl TimerBackend for MockBackend {
        fn name(&self) -> &'static str {
            self.name
        }
        fn precision_ns(&self) -> u64 {
            self.precision
        }
        fn schedule(&self, delay_ns: u64) {
            self.armed.lock().unwrap().push(delay_ns);
        }
        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
        fn timestamp(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
        fn delta_to_ns(&self, start: u64, end: u64) -> u64 {
            end.saturating_sub(start)
        }
    }

    fn service() -> &'static TimerService {
        Box::leak(Box::new(TimerService::new()))
    }

    fn fired_log() -> (
        std::sync::Arc<Mutex<Vec<u32>>>,
        impl Fn(u32) -> Box<dyn Fn() + Send + Sync>,
    ) {
        let log = std::sync::Arc::new(Mutex::new(Vec::new()));
        let mk = {
            let log = log.clone();
            move |tag: u32| {
                let log = log.clone();
                Box::new(move || log.lock().unwrap().push(tag)) as Box<dyn Fn() + Send + Sync>
            }
        };
        (log, mk)
    }

    #[test]
    fn oneshot_without_backend_is_temporary_outage() {
        let _s = crate::testing::serial();
        let svc = service();
        assert_eq!(svc.oneshot(1_000, || {}).unwrap_err(), Error::TemporaryOutage);
    }

    #[test]
    fn ids_start_at_one_and_grow() {
        let _s = crate::testing::serial();
        let svc = service();
        let b = MockBackend::install("mock", 1_000);
        svc.register_backend(b).unwrap();
        let a = svc.oneshot(10, || {}).unwrap();
        let c = svc.oneshot(10, || {}).unwrap();
        assert_ne!(a, TIMER_ID_INVALID);
        assert!(c > a);
    }

    #[test]
    fn fire_runs_due_timers_in_deadline_order() {
        let _s = crate::testing::serial();
        let svc = service();
        let b = MockBackend::install("mock", 1_000);
        svc.register_backend(b).unwrap();
        let (log, mk) = fired_log();
        // Inserted out of order on purpose.
        svc.oneshot(3_000_000, mk(3)).unwrap();
        svc.oneshot(1_000_000, mk(1)).unwrap();
        svc.oneshot(2_000_000, mk(2)).unwrap();
        // Root must be the 1 ms timer.
        assert_eq!(svc.heap_snapshot()[0].1, 1_000_000);
        b.advance(1_000_000);
        svc.handle_fire();
        assert_eq!(*log.lock().unwrap(), [1]);
        b.advance(2_100_000);
        svc.handle_fire();
        assert_eq!(*log.lock().unwrap(), [1, 2, 3]);
        assert!(svc.heap_snapshot().is_empty());
    }

    #[test]
    fn no_early_fire() {
        let _s = crate::testing::serial();
        let svc = service();
        let b = MockBackend::install("mock", 1_000);
        svc.register_backend(b).unwrap();
        let (log, mk) = fired_log();
        svc.oneshot(5_000_000, mk(5)).unwrap();
        b.advance(4_999_999);
        svc.handle_fire();
        assert!(log.lock().unwrap().is_empty());
        // Re-armed for the residue plus the floor.
        assert_eq!(b.last_armed(), Some(1 + MIN_SCHED_DELAY_NS));
        b.advance(1);
        svc.handle_fire();
        assert_eq!(*log.lock().unwrap(), [5]);
    }

    #[test]
    fn cancelled_timer_never_runs() {
        let _s = crate::testing::serial();
        let svc = service();
        let b = MockBackend::install("mock", 1_000);
        svc.register_backend(b).unwrap();
        let (log, mk) = fired_log();
        svc.oneshot(1_000_000, mk(1)).unwrap();
        let two = svc.oneshot(2_000_000, mk(2)).unwrap();
        svc.oneshot(3_000_000, mk(3)).unwrap();
        svc.cancel(two).unwrap();
        b.advance(5_000_000);
        svc.handle_fire();
        assert_eq!(*log.lock().unwrap(), [1, 3]);
        assert_eq!(svc.cancel(two).unwrap_err(), Error::NoSuchResource);
    }

    #[test]
    fn cancel_of_root_cancels_backend_and_reaps_lazily() {
        let _s = crate::testing::serial();
        let svc = service();
        let b = MockBackend::install("mock", 1_000);
        svc.register_backend(b).unwrap();
        let (log, mk) = fired_log();
        let root = svc.oneshot(1_000_000, mk(1)).unwrap();
        svc.oneshot(2_000_000, mk(2)).unwrap();
        svc.cancel(root).unwrap();
        assert_eq!(b.cancels.load(Ordering::SeqCst), 1);
        // Disabled root still in the heap until a fire reaps it.
        assert!(svc.heap_snapshot()[0].2);
        svc.handle_fire();
        assert_eq!(svc.heap_snapshot().len(), 1);
        assert!(log.lock().unwrap().is_empty());
        b.advance(2_000_000);
        svc.handle_fire();
        assert_eq!(*log.lock().unwrap(), [2]);
    }

    #[test]
    fn root_is_minimum_after_inserts_and_removals() {
        let _s = crate::testing::serial();
        let svc = service();
        let b = MockBackend::install("mock", 1_000);
        svc.register_backend(b).unwrap();
        let delays = [7u64, 3, 9, 1, 5, 8, 2, 6, 4];
        let mut ids = Vec::new();
        for d in delays {
            ids.push(svc.oneshot(d * 1_000, || {}).unwrap());
        }
        assert_eq!(svc.heap_snapshot()[0].1, 1_000);
        // Disable a few; the enabled minimum must win the root or the
        // root is disabled and about to be reaped.
        svc.cancel(ids[3]).unwrap(); // the 1_000 ns entry, at the root
        svc.handle_fire(); // reap
        let snap = svc.heap_snapshot();
        let min_enabled = snap
            .iter()
            .filter(|e| !e.2)
            .map(|e| e.1)
            .min()
            .unwrap();
        assert!(snap[0].2 || snap[0].1 == min_enabled);
        assert_eq!(min_enabled, 2_000);
    }

    #[test]
    fn at_most_once_per_scheduling() {
        let _s = crate::testing::serial();
        let svc = service();
        let b = MockBackend::install("mock", 1_000);
        svc.register_backend(b).unwrap();
        let (log, mk) = fired_log();
        svc.oneshot(1_000, mk(1)).unwrap();
        b.advance(10_000);
        svc.handle_fire();
        svc.handle_fire();
        assert_eq!(*log.lock().unwrap(), [1]);
    }

    #[test]
    fn arm_includes_min_delay_floor() {
        let _s = crate::testing::serial();
        let svc = service();
        let b = MockBackend::install("mock", 1_000);
        svc.register_backend(b).unwrap();
        svc.oneshot(0, || {}).unwrap();
        assert_eq!(b.last_armed(), Some(MIN_SCHED_DELAY_NS));
    }

    #[test]
    fn less_precise_backend_does_not_take_over() {
        let _s = crate::testing::serial();
        let svc = service();
        let fine = MockBackend::install("fine", 1_000);
        let coarse = MockBackend::install("coarse", 10_000);
        svc.register_backend(fine).unwrap();
        svc.register_backend(coarse).unwrap();
        svc.oneshot(1_000_000, || {}).unwrap();
        // Armed on the fine backend, not the coarse one.
        assert!(fine.last_armed().is_some());
        assert!(coarse.last_armed().is_none());
    }

    #[test]
    fn backend_upgrade_carries_deadlines_over() {
        let _s = crate::testing::serial();
        let svc = service();
        let coarse = MockBackend::install("coarse", 10_000);
        svc.register_backend(coarse).unwrap();
        let (log, mk) = fired_log();
        svc.oneshot(5_000_000, mk(5)).unwrap();
        svc.oneshot(2_000_000, mk(2)).unwrap();
        svc.oneshot(9_000_000, mk(9)).unwrap();
        // 1.5 ms pass on the coarse clock before the upgrade.
        coarse.advance(1_500_000);
        let fine = MockBackend::install("fine", 1_000);
        svc.register_backend(fine).unwrap();
        // The old backend was cancelled and the new one armed for the
        // soonest residue (0.5 ms) plus the floor.
        assert_eq!(coarse.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(fine.last_armed(), Some(500_000 + MIN_SCHED_DELAY_NS));
        // Nothing fires before its original deadline.
        fine.advance(499_999);
        svc.handle_fire();
        assert!(log.lock().unwrap().is_empty());
        fine.advance(1);
        svc.handle_fire();
        assert_eq!(*log.lock().unwrap(), [2]);
        fine.advance(7_500_000);
        svc.handle_fire();
        assert_eq!(*log.lock().unwrap(), [2, 5, 9]);
    }

    #[test]
    fn now_ns_is_monotonic_across_switch() {
        let _s = crate::testing::serial();
        let svc = service();
        let coarse = MockBackend::install("coarse", 10_000);
        svc.register_backend(coarse).unwrap();
        coarse.advance(3_000);
        assert_eq!(svc.now_ns(), 3_000);
        let fine = MockBackend::install("fine", 1_000);
        svc.register_backend(fine).unwrap();
        assert_eq!(svc.now_ns(), 3_000);
        fine.advance(500);
        assert_eq!(svc.now_ns(), 3_500);
    }

    #[test]
    fn backend_table_fills_up() {
        let _s = crate::testing::serial();
        let svc = service();
        for i in 0..MAX_TIMER_BACKENDS {
            let b = MockBackend::install("b", 1_000 + i as u64);
            svc.register_backend(b).unwrap();
        }
        let extra = MockBackend::install("extra", 10);
        assert_eq!(svc.register_backend(extra).unwrap_err(), Error::TemporaryOutage);
    }
}
