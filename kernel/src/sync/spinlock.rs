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

use crate::interrupt::InterruptGuard;
use anillo_arch as arch;
use core::ops::{Deref, DerefMut};
use spin::{Mutex, MutexGuard};

#[cfg(feature = "debugging_spinlock")]
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "debugging_spinlock")]
const NO_OWNER: usize = usize::MAX;

/// Busy-wait mutual exclusion. `lock()` gives the plain variant;
/// `irqsave_lock()` the interrupt-safe variant, which disables
/// interrupts through the per-CPU count for as long as the guard
/// lives. Any lock that can be taken from interrupt context must only
/// ever be taken through `irqsave_lock()`.
///
/// Recursion is not supported; re-acquiring on the same CPU deadlocks
/// (caught with the `debugging_spinlock` feature).
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    #[cfg(feature = "debugging_spinlock")]
    owner_cpu: AtomicUsize,
    lock: Mutex<T>,
}

// Field order matters: the inner lock is released before interrupts
// are re-enabled.
// See https://doc.rust-lang.org/reference/destructors.html#r-destructors.operation
#[derive(Debug)]
#[repr(C)]
pub struct SpinLockGuard<'a, T: ?Sized> {
    mutex_guard: MutexGuard<'a, T>,
    irq_guard: Option<InterruptGuard>,
    #[cfg(feature = "debugging_spinlock")]
    owner_cpu: &'a AtomicUsize,
}

impl<T> SpinLock<T> {
    pub const fn const_new(val: T) -> Self {
        Self {
            #[cfg(feature = "debugging_spinlock")]
            owner_cpu: AtomicUsize::new(NO_OWNER),
            lock: Mutex::new(val),
        }
    }

    pub const fn new(val: T) -> Self {
        Self::const_new(val)
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let mutex_guard = self.lock.try_lock()?;
        #[cfg(feature = "debugging_spinlock")]
        self.owner_cpu
            .store(arch::current_cpu_id(), Ordering::Relaxed);
        Some(SpinLockGuard {
            mutex_guard,
            irq_guard: None,
            #[cfg(feature = "debugging_spinlock")]
            owner_cpu: &self.owner_cpu,
        })
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(g) = self.try_lock() {
                return g;
            }
            self.check_recursion();
            arch::spin_hint();
        }
    }

    pub fn try_irqsave_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let irq_guard = InterruptGuard::new();
        let mut guard = self.try_lock()?;
        debug_assert!(guard.irq_guard.is_none());
        guard.irq_guard = Some(irq_guard);
        Some(guard)
    }

    pub fn irqsave_lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            if let Some(g) = self.try_irqsave_lock() {
                return g;
            }
            self.check_recursion();
            arch::spin_hint();
        }
    }

    #[cfg(feature = "debugging_spinlock")]
    #[inline]
    fn check_recursion(&self) {
        if self.owner_cpu.load(Ordering::Relaxed) == arch::current_cpu_id() {
            panic!("spinlock re-acquired on the owning CPU");
        }
    }

    #[cfg(not(feature = "debugging_spinlock"))]
    #[inline]
    fn check_recursion(&self) {}
}

impl<'a, T: 'a + ?Sized> SpinLockGuard<'a, T> {
    /// Moves the saved interrupt state from `other` into this guard.
    #[inline]
    pub fn take_irq_guard<'s, S>(&mut self, other: &mut SpinLockGuard<'s, S>) {
        self.irq_guard = other.irq_guard.take();
    }

    /// Leaks the saved interrupt state. The context-switch path calls
    /// this when the switched-in thread is resumed with interrupts
    /// already re-enabled by the arch layer.
    pub fn forget_irq(&mut self) {
        if let Some(g) = self.irq_guard.take() {
            core::mem::forget(g);
        }
    }
}

impl<'a, T: 'a + ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        self.mutex_guard.deref()
    }
}

impl<'a, T: 'a + ?Sized> DerefMut for SpinLockGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.mutex_guard.deref_mut()
    }
}

#[cfg(feature = "debugging_spinlock")]
impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        self.owner_cpu.store(NO_OWNER, Ordering::Relaxed);
    }
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lock_excludes() {
        let l = SpinLock::new(0u32);
        {
            let mut g = l.lock();
            *g += 1;
            assert!(l.try_lock().is_none());
        }
        assert_eq!(*l.lock(), 1);
    }

    #[test]
    fn irqsave_disables_and_balances() {
        let _s = crate::testing::serial();
        let l = SpinLock::new(());
        assert!(!arch::interrupts_masked());
        {
            let _g = l.irqsave_lock();
            assert!(arch::interrupts_masked());
            assert_eq!(crate::interrupt::save(), 1);
        }
        assert!(!arch::interrupts_masked());
        assert_eq!(crate::interrupt::save(), 0);
    }

    #[test]
    fn irqsave_nests_across_locks() {
        let _s = crate::testing::serial();
        let a = SpinLock::new(1u32);
        let b = SpinLock::new(2u32);
        {
            let ga = a.irqsave_lock();
            let gb = b.irqsave_lock();
            assert_eq!(crate::interrupt::save(), 2);
            assert_eq!(*ga + *gb, 3);
        }
        assert_eq!(crate::interrupt::save(), 0);
    }

    #[test]
    fn try_irqsave_backs_out_cleanly() {
        let _s = crate::testing::serial();
        let l = SpinLock::new(());
        let g = l.irqsave_lock();
        // Contended try must restore the interrupt state it took.
        assert!(l.try_irqsave_lock().is_none());
        assert_eq!(crate::interrupt::save(), 1);
        drop(g);
        assert_eq!(crate::interrupt::save(), 0);
    }

    #[test]
    fn forget_irq_leaves_count_raised() {
        let _s = crate::testing::serial();
        let l = SpinLock::new(());
        {
            let mut g = l.irqsave_lock();
            g.forget_irq();
        }
        assert_eq!(crate::interrupt::save(), 1);
        crate::interrupt::restore(0);
    }
}
