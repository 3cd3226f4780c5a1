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

//! AArch64 port. IRQ masking through DAIF, CPU identity through
//! MPIDR_EL1, cross-CPU pokes as SGI 0 through the GIC system register
//! interface, context switches over the callee-saved frame below.

use core::arch::{asm, global_asm};

#[inline]
pub fn current_cpu_id() -> usize {
    let mpidr: usize;
    unsafe { asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack)) };
    // Aff0 is the core index on every board we target.
    mpidr & 0xff
}

#[inline]
pub fn mask_interrupts() {
    unsafe { asm!("msr daifset, #2", options(nomem, nostack)) };
}

#[inline]
pub fn unmask_interrupts() {
    unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
}

#[inline]
pub fn interrupts_masked() -> bool {
    let daif: usize;
    unsafe { asm!("mrs {}, daif", out(reg) daif, options(nomem, nostack)) };
    daif & (1 << 7) != 0
}

#[inline]
pub fn spin_hint() {
    aarch64_cpu::asm::sev(); // paired with wfe in the unlock path
    core::hint::spin_loop();
}

#[inline]
pub fn idle() {
    aarch64_cpu::asm::wfi();
}

pub fn cross_cpu_poke(cpu: usize) {
    // SGI 0 to Aff0 == cpu, IRM = 0 (targeted).
    let sgi: u64 = 1u64 << (cpu & 0xf);
    unsafe {
        asm!(
            "msr icc_sgi1r_el1, {}",
            "isb",
            in(reg) sgi,
            options(nomem, nostack)
        )
    };
}

pub fn pend_switch_context() {
    // No PendSV on this architecture; a self-poke reaches the
    // dispatch check on interrupt exit.
    cross_cpu_poke(current_cpu_id());
}

#[inline]
pub fn current_sp() -> usize {
    let sp: usize;
    unsafe { asm!("mov {}, sp", out(reg) sp, options(nomem, nostack)) };
    sp
}

/// Callee-saved frame, matching the layout the switch stubs push:
/// x19..x30 in order. A fresh thread's x30 points at the entry
/// trampoline, which forwards x19/x20 as the first two arguments to
/// the target in x21.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct Context {
    pub regs: [usize; 12],
}

impl Context {
    pub fn init(&mut self) -> &mut Self {
        self.regs = [0; 12];
        self.regs[11] = anillo_thread_entry_trampoline as usize; // x30
        self
    }

    pub fn set_return_address(&mut self, pc: usize) -> &mut Self {
        self.regs[2] = pc; // x21, consumed by the trampoline
        self
    }

    pub fn set_arg(&mut self, n: usize, val: usize) -> &mut Self {
        debug_assert!(n < 2);
        self.regs[n] = val; // x19 / x20
        self
    }
}

extern "C" {
    fn anillo_switch_context(from_sp: *mut u8, to_sp: usize, hook: *mut core::ffi::c_void);
    fn anillo_restore_context(to_sp: usize, hook: *mut core::ffi::c_void) -> !;
    fn anillo_thread_entry_trampoline();
}

/// The switch stubs branch to `anillo_context_switch_finish` by name;
/// registration is a no-op on this port.
pub fn set_context_switch_finish(_f: crate::ContextSwitchFinishFn) {}

/// # Safety
///
/// `from_sp` must point at the outgoing thread's saved-sp slot, `to_sp`
/// at a frame pushed by these stubs (or carved by `Context::init`), and
/// `hook` at a live hook holder.
pub unsafe fn switch_context_with_hook(
    from_sp: *mut u8,
    to_sp: usize,
    hook: *mut core::ffi::c_void,
) {
    anillo_switch_context(from_sp, to_sp, hook);
}

/// # Safety
///
/// See [`switch_context_with_hook`].
pub unsafe fn restore_context_with_hook(to_sp: usize, hook: *mut core::ffi::c_void) -> ! {
    anillo_restore_context(to_sp, hook)
}

global_asm!(
    r#"
.global anillo_switch_context
.global anillo_restore_context
.global anillo_thread_entry_trampoline

// x0: &mut saved_sp of outgoing, x1: incoming sp, x2: hook
anillo_switch_context:
    msr daifset, #2
    sub sp, sp, #96
    stp x19, x20, [sp, #0]
    stp x21, x22, [sp, #16]
    stp x23, x24, [sp, #32]
    stp x25, x26, [sp, #48]
    stp x27, x28, [sp, #64]
    stp x29, x30, [sp, #80]
    mov x9, sp
    str x9, [x0]
    // From here on we run on the incoming stack.
    mov sp, x1
    mov x0, x2
    bl anillo_context_switch_finish
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    add sp, sp, #96
    msr daifclr, #2
    ret

// x0: incoming sp, x1: hook. No outgoing context to save.
anillo_restore_context:
    msr daifset, #2
    mov sp, x0
    mov x0, x1
    bl anillo_context_switch_finish
    ldp x19, x20, [sp, #0]
    ldp x21, x22, [sp, #16]
    ldp x23, x24, [sp, #32]
    ldp x25, x26, [sp, #48]
    ldp x27, x28, [sp, #64]
    ldp x29, x30, [sp, #80]
    add sp, sp, #96
    msr daifclr, #2
    ret

anillo_thread_entry_trampoline:
    mov x0, x19
    mov x1, x20
    br x21
"#
);
