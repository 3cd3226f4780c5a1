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

use crate::{
    error::Result,
    interrupt,
    sync::waitq::{WaitQueue, Waiter, WaiterRef},
    thread::{self, TimeoutKind},
};
use core::cell::Cell;

/// Counting semaphore. An `up` with waiters present hands the permit
/// straight to the oldest waiter instead of bumping the count, so
/// wakeups cannot be stolen by a racing `try_down`.
#[derive(Debug)]
pub struct Semaphore {
    // The pending queue's lock protects the count as well.
    count: Cell<usize>,
    pending: WaitQueue,
}

// Count accesses all happen under the pending queue's lock.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn const_new(count: usize) -> Self {
        Self {
            count: Cell::new(count),
            pending: WaitQueue::new(),
        }
    }

    pub const fn new(count: usize) -> Self {
        Self::const_new(count)
    }

    /// Releases one permit: wakes the oldest waiter if any, else
    /// increments the count.
    pub fn up(&self) {
        let mut g = self.pending.lock();
        match WaitQueue::pop_locked(&mut g) {
            Some(w) => {
                drop(g);
                // The wakeup carries the permit; the count stays put.
                Waiter::fire(&w);
                crate::scheduler::yield_now_or_later();
            }
            None => {
                let old = self.count.get();
                self.count.set(old.checked_add(1).expect("semaphore count overflow"));
            }
        }
    }

    /// Takes a permit without blocking.
    pub fn try_down(&self) -> bool {
        let _g = self.pending.lock();
        let old = self.count.get();
        if old == 0 {
            return false;
        }
        self.count.set(old - 1);
        true
    }

    /// Takes a permit, blocking the calling thread until one is
    /// handed over. Thread context only.
    pub fn down(&self) -> Result {
        debug_assert!(!interrupt::is_in_interrupt());
        let g = self.pending.lock();
        let old = self.count.get();
        if old > 0 {
            self.count.set(old - 1);
            return Ok(());
        }
        // Parked under the queue lock; a permit handed to our waiter
        // is ours, no recheck of the count.
        thread::wait_locked(&self.pending, g, None)
    }

    /// Like [`down`](Self::down) with a deadline; [`Error::Timeout`]
    /// when no permit arrived in time.
    ///
    /// [`Error::Timeout`]: crate::error::Error::Timeout
    pub fn down_timeout(&self, delay: u64, kind: TimeoutKind) -> Result {
        debug_assert!(!interrupt::is_in_interrupt());
        let g = self.pending.lock();
        let old = self.count.get();
        if old > 0 {
            self.count.set(old - 1);
            return Ok(());
        }
        thread::wait_locked(&self.pending, g, Some((delay, kind)))
    }

    /// The acquire-or-enqueue half of `down`, with a caller-supplied
    /// waiter: a permit either comes back immediately (true) or will
    /// be handed to `w`'s wakeup later (false). For callers composing
    /// their own wait, e.g. waiting on several sources at once.
    pub fn down_with(&self, w: WaiterRef) -> bool {
        let mut g = self.pending.lock();
        let old = self.count.get();
        if old > 0 {
            self.count.set(old - 1);
            return true;
        }
        let ok = self.pending.add_locked(&mut g, w);
        debug_assert!(ok);
        false
    }

    pub fn count(&self) -> usize {
        let _g = self.pending.lock();
        self.count.get()
    }

    pub fn waiter_count(&self) -> usize {
        self.pending.len()
    }
}
