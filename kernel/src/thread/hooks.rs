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

//! Manager-installed thread callbacks. Each thread carries a small
//! fixed table of hook slots invoked in precedence order (slot 0
//! first, reserved for the thread manager). Lifecycle hooks run with
//! the thread lock held; fault and interrupt hooks with it released.

use super::{Thread, ThreadNode};
use crate::{config, error::Error, error::Result};

/// What a hook reports back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    /// Handled; keep invoking lower-precedence hooks.
    Ok,
    /// Fully handled; stop dispatching.
    Handled,
    /// Not handled here; keep looking.
    Unknown,
}

pub type HookFn = fn(context: usize, thread: &ThreadNode) -> HookStatus;

/// One hook slot. Owners install at most one; reinstalling under the
/// same owner id replaces the previous table.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadHook {
    pub owner_id: usize,
    pub context: usize,
    pub on_suspend: Option<HookFn>,
    pub on_resume: Option<HookFn>,
    pub on_kill: Option<HookFn>,
    pub on_block: Option<HookFn>,
    pub on_unblock: Option<HookFn>,
    pub on_interrupt_enter: Option<HookFn>,
    pub on_interrupt_exit: Option<HookFn>,
    pub on_bus_error: Option<HookFn>,
    pub on_page_fault: Option<HookFn>,
    pub on_fp_exception: Option<HookFn>,
    pub on_illegal_instruction: Option<HookFn>,
    pub on_debug_trap: Option<HookFn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookEvent {
    Suspend,
    Resume,
    Kill,
    Block,
    Unblock,
    InterruptEnter,
    InterruptExit,
    Fault(FaultKind),
}

/// Synchronous faults a thread can take; delivered through the hook
/// table, fatal when nothing claims them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    BusError,
    PageFault,
    FpException,
    IllegalInstruction,
    DebugTrap,
}

impl ThreadHook {
    fn callback_for(&self, ev: HookEvent) -> Option<HookFn> {
        match ev {
            HookEvent::Suspend => self.on_suspend,
            HookEvent::Resume => self.on_resume,
            HookEvent::Kill => self.on_kill,
            HookEvent::Block => self.on_block,
            HookEvent::Unblock => self.on_unblock,
            HookEvent::InterruptEnter => self.on_interrupt_enter,
            HookEvent::InterruptExit => self.on_interrupt_exit,
            HookEvent::Fault(FaultKind::BusError) => self.on_bus_error,
            HookEvent::Fault(FaultKind::PageFault) => self.on_page_fault,
            HookEvent::Fault(FaultKind::FpException) => self.on_fp_exception,
            HookEvent::Fault(FaultKind::IllegalInstruction) => self.on_illegal_instruction,
            HookEvent::Fault(FaultKind::DebugTrap) => self.on_debug_trap,
        }
    }
}

/// Runs `ev` through a hook table snapshot. Returns whether any hook
/// claimed the event.
pub(crate) fn dispatch(
    table: &[Option<ThreadHook>; config::MAX_THREAD_HOOKS],
    t: &ThreadNode,
    ev: HookEvent,
) -> bool {
    let mut handled = false;
    for slot in table.iter().flatten() {
        let Some(f) = slot.callback_for(ev) else {
            continue;
        };
        match f(slot.context, t) {
            HookStatus::Ok => handled = true,
            HookStatus::Handled => return true,
            HookStatus::Unknown => {}
        }
    }
    handled
}

impl Thread {
    /// Installs (or replaces, keyed by owner id) a hook table. Owner
    /// id [`config::THREAD_MANAGER_HOOK_OWNER`] lands in slot 0; other
    /// owners take slots in installation order. Returns the slot.
    pub fn install_hook(&self, hook: ThreadHook) -> Result<usize> {
        let mut inner = self.lock();
        if hook.owner_id == config::THREAD_MANAGER_HOOK_OWNER {
            inner.hooks[0] = Some(hook);
            return Ok(0);
        }
        // Replace an existing table from the same owner first.
        for (i, slot) in inner.hooks.iter_mut().enumerate().skip(1) {
            if matches!(slot, Some(h) if h.owner_id == hook.owner_id) {
                *slot = Some(hook);
                return Ok(i);
            }
        }
        for (i, slot) in inner.hooks.iter_mut().enumerate().skip(1) {
            if slot.is_none() {
                *slot = Some(hook);
                return Ok(i);
            }
        }
        Err(Error::TemporaryOutage)
    }

    pub fn remove_hook(&self, owner_id: usize) -> Result {
        let mut inner = self.lock();
        for slot in inner.hooks.iter_mut() {
            if matches!(slot, Some(h) if h.owner_id == owner_id) {
                *slot = None;
                return Ok(());
            }
        }
        Err(Error::NoSuchResource)
    }
}

/// Delivers a fault to the thread's hooks, lock released. An
/// unhandled fault is a kernel invariant violation.
pub fn deliver_fault(t: &ThreadNode, kind: FaultKind) {
    let table = t.lock().hooks;
    if !dispatch(&table, t, HookEvent::Fault(kind)) {
        panic!("unhandled {:?} on thread {:#x}", kind, Thread::id(t));
    }
}

/// Interrupt entry notification; lock released, may be unhandled.
pub fn interrupt_entered(t: &ThreadNode) {
    let table = t.lock().hooks;
    let _ = dispatch(&table, t, HookEvent::InterruptEnter);
}

/// Interrupt exit notification; lock released, may be unhandled.
pub fn interrupt_exited(t: &ThreadNode) {
    let table = t.lock().hooks;
    let _ = dispatch(&table, t, HookEvent::InterruptExit);
}
