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

//! Composable wake-notification lists. A [`Waiter`] is a refcounted
//! node carrying a wakeup callback; it belongs to at most one
//! [`WaitQueue`] at a time. Callbacks always run with the queue lock
//! dropped and receive the waiter itself, so a waiter may re-add
//! itself from its own wakeup.

extern crate alloc;

use crate::{
    sync::spinlock::{SpinLock, SpinLockGuard},
    types::{Arc, ArcList, Link},
};
use alloc::boxed::Box;
use anillo_infra::link_adapter;
use core::{
    fmt,
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

link_adapter!(ViaWaitNode, Waiter, wait_node);

pub type WaiterRef = Arc<Waiter>;
pub(crate) type WaitList = ArcList<Waiter, ViaWaitNode>;

type WakeFn = Box<dyn Fn(&WaiterRef) + Send + Sync>;

pub struct Waiter {
    pub wait_node: Link<Waiter, ViaWaitNode>,
    wake: WakeFn,
    // Owning queue while linked; the back-reference is only valid for
    // as long as the waiter stays on that queue.
    queue: AtomicPtr<WaitQueue>,
}

impl Waiter {
    pub fn new(wake: impl Fn(&WaiterRef) + Send + Sync + 'static) -> WaiterRef {
        Arc::new(Self {
            wait_node: Link::new(),
            wake: Box::new(wake),
            queue: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Runs the wakeup callback. Callers must not hold any wait-queue
    /// lock.
    #[inline]
    pub(crate) fn fire(this: &WaiterRef) {
        (this.wake)(this);
    }

    #[inline]
    pub fn is_queued(this: &WaiterRef) -> bool {
        !this.queue.load(Ordering::Acquire).is_null()
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("queued", &!self.queue.load(Ordering::Relaxed).is_null())
            .finish()
    }
}

#[derive(Debug)]
pub struct WaitQueue {
    waiters: SpinLock<WaitList>,
}

// List nodes are only touched under the queue lock.
unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(WaitList::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.waiters.irqsave_lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The queue lock, for callers that must keep the queue stable
    /// across their own state changes (semaphore counts, parking).
    #[inline]
    pub(crate) fn lock(&self) -> SpinLockGuard<'_, WaitList> {
        self.waiters.irqsave_lock()
    }

    pub fn add(&self, w: WaiterRef) -> bool {
        let mut g = self.lock();
        self.add_locked(&mut g, w)
    }

    pub(crate) fn add_locked(&self, g: &mut SpinLockGuard<'_, WaitList>, w: WaiterRef) -> bool {
        if !g.push_back(w.clone()) {
            return false;
        }
        w.queue
            .store(self as *const _ as *mut WaitQueue, Ordering::Release);
        true
    }

    pub(crate) fn pop_locked(g: &mut SpinLockGuard<'_, WaitList>) -> Option<WaiterRef> {
        let w = g.pop_front()?;
        w.queue.store(ptr::null_mut(), Ordering::Release);
        Some(w)
    }

    /// Takes `w` off whatever queue it is linked on, without invoking
    /// its callback. Fails if it is not linked anywhere.
    pub fn remove(w: &WaiterRef) -> bool {
        loop {
            let q = w.queue.load(Ordering::Acquire);
            if q.is_null() {
                return false;
            }
            // The queue outlives its linked waiters, so the pointer is
            // dereferenceable until we observe it cleared.
            let qref = unsafe { &*q };
            let mut g = qref.waiters.irqsave_lock();
            if w.queue.load(Ordering::Relaxed) != q {
                // Woken and possibly re-added while we took the lock.
                continue;
            }
            let ok = g.remove(w);
            debug_assert!(ok);
            w.queue.store(ptr::null_mut(), Ordering::Release);
            return true;
        }
    }

    /// Wakes up to `n` waiters in FIFO order, invoking each callback
    /// with the lock dropped. Returns how many were woken.
    ///
    /// The pass is capped at the waiter count observed on entry, so a
    /// waiter that re-adds itself from its own callback is not woken
    /// twice in the same pass. A waiter that removes itself between
    /// pops can still cause one spurious wake of a later waiter; that
    /// is accepted behavior.
    pub fn wake_many(&self, n: usize) -> usize {
        let mut woken = 0;
        let mut g = self.lock();
        let mut budget = n.min(g.len());
        while budget > 0 {
            let Some(w) = Self::pop_locked(&mut g) else {
                break;
            };
            drop(g);
            Waiter::fire(&w);
            woken += 1;
            g = self.lock();
            budget -= 1;
        }
        woken
    }

    pub fn wake_one(&self) -> bool {
        self.wake_many(1) == 1
    }

    pub fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }

    /// Removes `w` from this queue and invokes its callback with the
    /// lock dropped. Fails if `w` is not on this queue.
    pub fn wake_specific(&self, w: &WaiterRef) -> bool {
        {
            let mut g = self.lock();
            if w.queue.load(Ordering::Relaxed) != self as *const _ as *mut WaitQueue {
                return false;
            }
            let ok = g.remove(w);
            debug_assert!(ok);
            w.queue.store(ptr::null_mut(), Ordering::Release);
        }
        Waiter::fire(w);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc as StdArc, Mutex};

    fn recording_waiter(log: &StdArc<Mutex<Vec<usize>>>, id: usize) -> WaiterRef {
        let log = log.clone();
        Waiter::new(move |_w| log.lock().unwrap().push(id))
    }

    #[test]
    fn wake_order_is_fifo() {
        let _s = crate::testing::serial();
        let q = WaitQueue::new();
        let log = StdArc::new(Mutex::new(Vec::new()));
        for id in 0..3 {
            assert!(q.add(recording_waiter(&log, id)));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.wake_many(2), 2);
        assert_eq!(*log.lock().unwrap(), [0, 1]);
        assert_eq!(q.wake_all(), 1);
        assert_eq!(*log.lock().unwrap(), [0, 1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn wake_many_caps_at_queue_length() {
        let _s = crate::testing::serial();
        let q = WaitQueue::new();
        let log = StdArc::new(Mutex::new(Vec::new()));
        q.add(recording_waiter(&log, 1));
        assert_eq!(q.wake_many(100), 1);
        assert_eq!(q.wake_many(100), 0);
    }

    #[test]
    fn readding_waiter_not_woken_twice_in_one_pass() {
        let _s = crate::testing::serial();
        static QUEUE: WaitQueue = WaitQueue::new();
        let log = StdArc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        // Re-adds itself from inside its own wakeup.
        let sticky = Waiter::new(move |w| {
            log2.lock().unwrap().push(7);
            assert!(QUEUE.add(w.clone()));
        });
        let plain = recording_waiter(&log, 1);
        assert!(QUEUE.add(sticky.clone()));
        assert!(QUEUE.add(plain));
        // Snapshot is 2: the re-added sticky waiter stays queued.
        assert_eq!(QUEUE.wake_all(), 2);
        assert_eq!(*log.lock().unwrap(), [7, 1]);
        assert_eq!(QUEUE.len(), 1);
        assert!(Waiter::is_queued(&sticky));
        // Next pass wakes it again, once.
        assert_eq!(QUEUE.wake_all(), 1);
        assert_eq!(*log.lock().unwrap(), [7, 1, 7]);
        assert!(QUEUE.is_empty());
    }

    #[test]
    fn remove_prevents_wake() {
        let _s = crate::testing::serial();
        let q = WaitQueue::new();
        let log = StdArc::new(Mutex::new(Vec::new()));
        let a = recording_waiter(&log, 1);
        let b = recording_waiter(&log, 2);
        q.add(a.clone());
        q.add(b.clone());
        assert!(Waiter::is_queued(&a));
        assert!(WaitQueue::remove(&a));
        assert!(!Waiter::is_queued(&a));
        assert!(!WaitQueue::remove(&a));
        assert_eq!(q.wake_all(), 1);
        assert_eq!(*log.lock().unwrap(), [2]);
    }

    #[test]
    fn wake_specific_skips_the_queue_order() {
        let _s = crate::testing::serial();
        let q = WaitQueue::new();
        let log = StdArc::new(Mutex::new(Vec::new()));
        let a = recording_waiter(&log, 1);
        let b = recording_waiter(&log, 2);
        q.add(a.clone());
        q.add(b.clone());
        assert!(q.wake_specific(&b));
        assert!(!q.wake_specific(&b));
        assert_eq!(*log.lock().unwrap(), [2]);
        assert_eq!(q.len(), 1);
        q.wake_all();
    }

    #[test]
    fn wake_specific_rejects_foreign_waiter() {
        let _s = crate::testing::serial();
        let q1 = WaitQueue::new();
        let q2 = WaitQueue::new();
        let w = Waiter::new(|_| {});
        q1.add(w.clone());
        assert!(!q2.wake_specific(&w));
        assert!(WaitQueue::remove(&w));
    }

    #[test]
    fn waiter_is_reusable_after_wake() {
        let _s = crate::testing::serial();
        let q = WaitQueue::new();
        let log = StdArc::new(Mutex::new(Vec::new()));
        let w = recording_waiter(&log, 3);
        q.add(w.clone());
        q.wake_all();
        assert!(q.add(w.clone()));
        q.wake_all();
        assert_eq!(*log.lock().unwrap(), [3, 3]);
    }
}
