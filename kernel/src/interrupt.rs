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

//! Nestable interrupt disabling. Every CPU keeps a count of
//! outstanding disables; the hardware mask is touched only on the
//! 0 -> 1 and 1 -> 0 edges. `disable`/`enable` and `save`/`restore`
//! must not be mixed on the same path.

use crate::{config, cpu};
use anillo_arch as arch;
use core::sync::atomic::Ordering;

/// Masks interrupts on this CPU and bumps the disable count.
#[inline]
pub fn disable() {
    // Mask before the count moves off zero; the other order leaves a
    // window where an interrupt sees count != 0 with the mask clear.
    arch::mask_interrupts();
    let old = cpu::current()
        .irq_disable_count
        .fetch_add(1, Ordering::Relaxed);
    if old == usize::MAX {
        panic!("interrupt-disable count overflow");
    }
}

/// Drops one disable; unmasks when the count returns to zero.
#[inline]
pub fn enable() {
    let cpu = cpu::current();
    let old = cpu.irq_disable_count.fetch_sub(1, Ordering::Relaxed);
    if old == 0 {
        panic!("interrupt-disable count underflow");
    }
    if old == 1 {
        check_unmask_policy(cpu);
        arch::unmask_interrupts();
    }
}

/// Current disable count, for a later [`restore`].
#[inline]
pub fn save() -> usize {
    cpu::current().irq_disable_count.load(Ordering::Relaxed)
}

/// Forces the count to `saved` and syncs the hardware mask to it.
#[inline]
pub fn restore(saved: usize) {
    let cpu = cpu::current();
    cpu.irq_disable_count.store(saved, Ordering::Relaxed);
    if saved == 0 {
        check_unmask_policy(cpu);
        arch::unmask_interrupts();
    } else {
        arch::mask_interrupts();
    }
}

#[inline]
fn check_unmask_policy(cpu: &cpu::CpuLocal) {
    if !config::ALLOW_NESTED_INTERRUPTS && cpu.irq_nest.load(Ordering::Relaxed) != 0 {
        panic!("interrupts re-enabled inside an interrupt frame");
    }
}

/// Called by the interrupt entry path, before any handler runs.
#[inline]
pub fn enter_interrupt() {
    let old = cpu::current().irq_nest.fetch_add(1, Ordering::Relaxed);
    if !config::ALLOW_NESTED_INTERRUPTS && old != 0 {
        panic!("nested interrupt on a CPU that forbids nesting");
    }
    disable();
}

/// Called by the interrupt exit path, after the handler returns.
#[inline]
pub fn leave_interrupt() {
    let old = cpu::current().irq_nest.fetch_sub(1, Ordering::Relaxed);
    assert_ne!(old, 0, "interrupt exit without a matching entry");
    // The nest count is already down, so this enable may legally
    // unmask.
    enable();
}

#[inline]
pub fn is_in_interrupt() -> bool {
    cpu::current().irq_nest.load(Ordering::Relaxed) != 0
}

/// A context switch hands the CPU to a thread that resumes with no
/// outstanding disables; the hardware side is synced by the arch
/// restore. Called from the switch finish hook only.
#[inline]
pub(crate) fn reset_after_switch() {
    cpu::current()
        .irq_disable_count
        .store(0, Ordering::Relaxed);
}

/// RAII disable; the form every locking path consumes.
#[derive(Debug)]
pub struct InterruptGuard(());

impl InterruptGuard {
    #[inline]
    pub fn new() -> Self {
        disable();
        Self(())
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    #[inline]
    fn drop(&mut self) {
        enable();
    }
}
