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

//! Hosted port. Backs the unit tests and any build for a target with an
//! OS: the interrupt mask is modelled as per-CPU state, pokes and
//! pending switches are counters the tests can observe, and a context
//! switch runs the kernel's finish hook synchronously. There is one
//! logical CPU (id 0).

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const MAX_CPUS: usize = 8;

// "Hardware" mask state. false = interrupts deliverable.
static MASKED: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];
static POKES: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];
static PENDING_SWITCH: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];
static FINISH_HOOK: AtomicUsize = AtomicUsize::new(0);

/// Registers the kernel's switch-completion function. The hosted port
/// has no assembly stub to hard-wire it, so the switch entry points
/// call through this.
pub fn set_context_switch_finish(f: crate::ContextSwitchFinishFn) {
    FINISH_HOOK.store(f as usize, Ordering::SeqCst);
}

fn finish_hook() -> crate::ContextSwitchFinishFn {
    let raw = FINISH_HOOK.load(Ordering::SeqCst);
    assert_ne!(raw, 0, "context switch before the kernel registered its finish hook");
    unsafe { core::mem::transmute::<usize, crate::ContextSwitchFinishFn>(raw) }
}

#[inline]
pub fn current_cpu_id() -> usize {
    0
}

#[inline]
pub fn mask_interrupts() {
    MASKED[current_cpu_id()].store(true, Ordering::SeqCst);
}

#[inline]
pub fn unmask_interrupts() {
    MASKED[current_cpu_id()].store(false, Ordering::SeqCst);
}

#[inline]
pub fn interrupts_masked() -> bool {
    MASKED[current_cpu_id()].load(Ordering::SeqCst)
}

#[inline]
pub fn spin_hint() {
    core::hint::spin_loop();
}

#[inline]
pub fn idle() {
    core::hint::spin_loop();
}

pub fn cross_cpu_poke(cpu: usize) {
    POKES[cpu].fetch_add(1, Ordering::SeqCst);
}

/// Observed poke count; test-facing.
pub fn poke_count(cpu: usize) -> usize {
    POKES[cpu].load(Ordering::SeqCst)
}

pub fn pend_switch_context() {
    PENDING_SWITCH[current_cpu_id()].store(true, Ordering::SeqCst);
}

/// Consumes a pending switch request; test-facing.
pub fn take_pending_switch() -> bool {
    PENDING_SWITCH[current_cpu_id()].swap(false, Ordering::SeqCst)
}

#[inline]
pub fn current_sp() -> usize {
    let probe = 0usize;
    &probe as *const _ as usize
}

/// Saved register file of a parked thread. The hosted port never
/// executes one; the layout only has to satisfy the kernel's stack
/// carving and entry wiring.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub pc: usize,
    pub args: [usize; 4],
    pub flags: usize,
}

impl Context {
    pub fn init(&mut self) -> &mut Self {
        *self = Self::default();
        self
    }

    pub fn set_return_address(&mut self, pc: usize) -> &mut Self {
        self.pc = pc;
        self
    }

    pub fn set_arg(&mut self, n: usize, val: usize) -> &mut Self {
        self.args[n] = val;
        self
    }
}

/// Saves into `from_sp`, restores `to_sp`, and runs the kernel finish
/// hook in between. Hosted rendition: the hook runs synchronously and
/// control returns to the caller as if the outgoing thread had been
/// rescheduled immediately; the incoming side resumes with interrupts
/// deliverable, like a real restore would leave it.
///
/// # Safety
///
/// `hook` must point at a live hook holder the finish hook understands.
pub unsafe fn switch_context_with_hook(
    _from_sp: *mut u8,
    _to_sp: usize,
    hook: *mut core::ffi::c_void,
) {
    mask_interrupts();
    finish_hook()(hook);
    unmask_interrupts();
}

/// Restore-only half used for bootstrap and retire; never returns on
/// hardware. The hosted port has no context to enter, so reaching the
/// end is fatal.
///
/// # Safety
///
/// See [`switch_context_with_hook`].
pub unsafe fn restore_context_with_hook(_to_sp: usize, hook: *mut core::ffi::c_void) -> ! {
    mask_interrupts();
    finish_hook()(hook);
    unmask_interrupts();
    panic!("hosted port cannot enter a thread context");
}
