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
use crate::{
    config, interrupt, scheduler,
    support::{align_down, Region, RegionalObjectBuilder},
    sync::{
        spinlock::{SpinLock, SpinLockGuard},
        waitq::{WaitList, WaitQueue, Waiter, WaiterRef},
    },
    time,
    types::{Arc, AtomicUint, Link, Uint},
};
use crate::error::{Error, Result};
use alloc::boxed::Box;
use anillo_arch as arch;
use anillo_infra::link_adapter;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

mod builder;
pub mod hooks;

pub use builder::*;
pub use hooks::{
    deliver_fault, interrupt_entered, interrupt_exited, FaultKind, HookFn, HookStatus, ThreadHook,
};

pub type ThreadNode = Arc<Thread>;

pub enum Entry {
    C(extern "C" fn()),
    Closure(Box<dyn FnOnce()>),
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Entry::C(_) => f.write_str("Entry::C"),
            Entry::Closure(_) => f.write_str("Entry::Closure"),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum ThreadKind {
    Idle,
    Worker,
    #[default]
    Normal,
}

/// Lifecycle states. A fresh thread starts suspended; the scheduler
/// moves it through ready/running, waits park it as blocked, and kill
/// or self-exit retires it to dead.
pub const SUSPENDED: Uint = 0;
pub const READY: Uint = 1;
pub const RUNNING: Uint = 2;
pub const BLOCKED: Uint = 3;
pub const DEAD: Uint = 4;

// Why a wait ended; stored by whoever unlinks the waiter.
pub(crate) const WAIT_NONE: Uint = 0;
pub(crate) const WAIT_OK: Uint = 1;
pub(crate) const WAIT_TIMEOUT: Uint = 2;
pub(crate) const WAIT_CANCELLED: Uint = 3;
pub(crate) const WAIT_SIGNALED: Uint = 4;

bitflags! {
    /// Orthogonal state bits, independent of the lifecycle machine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Deferred preemption or signal delivery requested.
        const INTERRUPTED = 1 << 0;
        const KERNEL_STACK = 1 << 1;
        const HAS_USERSPACE = 1 << 2;
        const DEALLOCATE_STACK_ON_EXIT = 1 << 3;
        /// Kill requested while running on another CPU; completed at
        /// that CPU's next dispatch boundary.
        const KILL_PENDING = 1 << 4;
        /// Same, for suspension.
        const SUSPEND_PENDING = 1 << 5;
    }
}

link_adapter!(ViaGlobal, Thread, global);
link_adapter!(ViaSchedNode, Thread, sched_node);

/// Where the thread currently sits, kept alongside the state machine
/// so queue removal does not have to scan every CPU.
pub(crate) const CPU_NONE: usize = usize::MAX;
pub(crate) const CPU_SUSPENDED_QUEUE: usize = usize::MAX - 1;

#[derive(Debug, Copy, Clone)]
#[repr(align(16))]
pub struct AlignedStackStorage([u8; config::DEFAULT_STACK_SIZE]);

#[derive(Debug)]
pub enum Stack {
    Raw { base: usize, size: usize },
    Boxed(Box<AlignedStackStorage>),
}

impl Default for Stack {
    fn default() -> Self {
        Stack::Raw { base: 0, size: 0 }
    }
}

impl Stack {
    pub fn base(&self) -> usize {
        match self {
            Self::Boxed(b) => b.0.as_ptr() as usize,
            Self::Raw { base, .. } => *base,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Boxed(b) => b.0.len(),
            Self::Raw { size, .. } => *size,
        }
    }
}

/// Protected by the scheduler's dispatch path.
#[derive(Debug, Default)]
pub struct ThreadStats {
    dispatches: u64,
}

impl ThreadStats {
    pub const fn new() -> Self {
        Self { dispatches: 0 }
    }

    pub fn count_dispatch(&mut self) {
        self.dispatches += 1;
    }

    pub fn dispatches(&self) -> u64 {
        self.dispatches
    }
}

#[derive(Debug)]
pub struct Thread {
    /// Registry membership; owned by the scheduler's registry.
    pub global: Link<Thread, ViaGlobal>,
    /// Ready-queue or suspended-queue membership; owned by whichever
    /// queue the thread is on.
    pub sched_node: Link<Thread, ViaSchedNode>,
    state: AtomicUint,
    flags: AtomicU32,
    wait_status: AtomicUint,
    wait_timer: AtomicU64,
    pub(crate) queued_cpu: AtomicUsize,
    preempt_count: AtomicUint,
    /// Notified once, on the transition to dead.
    pub death_waitq: WaitQueue,
    /// Notified when the last reference drops, right before the
    /// backing memory is reclaimed.
    pub destroy_waitq: WaitQueue,
    // The lock protects everything in ThreadInner; the atomics above
    // stay outside it.
    inner: SpinLock<ThreadInner>,
}

#[derive(Debug)]
pub struct ThreadInner {
    pub(crate) kind: ThreadKind,
    stack: Stack,
    saved_sp: usize,
    // Runs on thread retirement, on a transient stack.
    cleanup: Option<Entry>,
    pub(crate) hooks: [Option<ThreadHook>; config::MAX_THREAD_HOOKS],
    pub(crate) current_waiter: Option<WaiterRef>,
    pub(crate) stats: ThreadStats,
}

extern "C" fn run_simple_c(f: extern "C" fn()) {
    f();
    scheduler::retire_me();
}

extern "C" fn run_closure(raw: *mut Box<dyn FnOnce()>) {
    unsafe { Box::from_raw(raw)() };
    scheduler::retire_me();
}

impl Thread {
    pub(crate) const fn const_new(kind: ThreadKind) -> Self {
        Self {
            global: Link::new(),
            sched_node: Link::new(),
            state: AtomicUint::new(SUSPENDED),
            flags: AtomicU32::new(0),
            wait_status: AtomicUint::new(WAIT_NONE),
            wait_timer: AtomicU64::new(0),
            queued_cpu: AtomicUsize::new(CPU_NONE),
            preempt_count: AtomicUint::new(0),
            death_waitq: WaitQueue::new(),
            destroy_waitq: WaitQueue::new(),
            inner: SpinLock::new(ThreadInner {
                kind,
                stack: Stack::Raw { base: 0, size: 0 },
                saved_sp: 0,
                cleanup: None,
                hooks: [None; config::MAX_THREAD_HOOKS],
                current_waiter: None,
                stats: ThreadStats::new(),
            }),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, ThreadInner> {
        self.inner.irqsave_lock()
    }

    #[inline]
    pub fn id(me: &ThreadNode) -> usize {
        Arc::handle(me) as usize
    }

    /// Retains this thread unless its last reference is already gone,
    /// in which case the handle is permanently stale.
    pub fn retain(&self) -> Result<ThreadNode> {
        unsafe { Arc::try_retain(self) }.ok_or(Error::PermanentOutage)
    }

    #[inline]
    pub fn state(&self) -> Uint {
        self.state.load(Ordering::SeqCst)
    }

    pub fn state_to_str(&self) -> &'static str {
        match self.state() {
            SUSPENDED => "suspended",
            READY => "ready",
            RUNNING => "running",
            BLOCKED => "blocked",
            DEAD => "dead",
            _ => "unknown",
        }
    }

    #[inline]
    pub fn transfer_state(&self, from: Uint, to: Uint) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    ///
    /// Bypasses the state machine; only for construction paths.
    #[inline]
    pub unsafe fn set_state(&self, to: Uint) -> &Self {
        self.state.store(to, Ordering::SeqCst);
        self
    }

    #[inline]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn set_flags(&self, f: ThreadFlags) {
        self.flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn clear_flags(&self, f: ThreadFlags) {
        self.flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    #[inline]
    pub fn has_flags(&self, f: ThreadFlags) -> bool {
        self.flags().contains(f)
    }

    #[inline]
    pub(crate) fn set_wait_status(&self, s: Uint) {
        self.wait_status.store(s, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn swap_wait_status(&self, s: Uint) -> Uint {
        self.wait_status.swap(s, Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_wait_timer(&self, id: u64) {
        self.wait_timer.store(id, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn take_wait_timer(&self) -> u64 {
        self.wait_timer.swap(0, Ordering::SeqCst)
    }

    pub fn kind(&self) -> ThreadKind {
        self.lock().kind
    }

    /// Address of the saved-sp slot, handed to the context-switch
    /// primitive which writes it without taking the lock. The slot
    /// sits inline in the control block, so the pointer stays valid
    /// after the guard is gone.
    #[inline]
    pub(crate) fn saved_sp_ptr(&self) -> *mut u8 {
        let mut inner = self.lock();
        &raw mut inner.saved_sp as *mut u8
    }

    #[inline]
    pub fn saved_sp(&self) -> usize {
        self.lock().saved_sp
    }

    pub fn stack_base(&self) -> usize {
        self.lock().stack.base()
    }

    pub fn stack_size(&self) -> usize {
        self.lock().stack.size()
    }

    pub fn validate_saved_sp(&self) -> bool {
        let inner = self.lock();
        let sp = inner.saved_sp;
        sp >= inner.stack.base() && sp <= inner.stack.base() + inner.stack.size()
    }

    #[inline]
    pub fn disable_preempt(&self) -> bool {
        self.preempt_count.fetch_add(1, Ordering::Acquire) == 0
    }

    #[inline]
    pub fn enable_preempt(&self) -> bool {
        self.preempt_count.fetch_sub(1, Ordering::Acquire) == 1
    }

    #[inline]
    pub fn is_preemptable(&self) -> bool {
        self.preempt_count.load(Ordering::Relaxed) == 0
    }

    #[inline]
    pub(crate) fn try_preempt_me() -> PreemptGuard {
        let current = scheduler::current_thread();
        let status = current.disable_preempt();
        PreemptGuard { t: current, status }
    }
}

impl ThreadInner {
    /// Adopts `stack`, carves the initial register frame at its top
    /// and wires the entry point into it.
    pub(crate) fn init(&mut self, stack: Stack, entry: Entry) -> &mut Self {
        self.stack = stack;
        let base = self.stack.base();
        let top = align_down(base + self.stack.size(), 16);
        let mut b = RegionalObjectBuilder::new(Region {
            base,
            size: top - base,
        });
        let ctx: &mut arch::Context = b.zeroed_at_end().expect("stack too small for a context");
        self.saved_sp = ctx as *mut _ as usize;
        ctx.init();
        match entry {
            Entry::C(f) => {
                ctx.set_return_address(run_simple_c as usize)
                    .set_arg(0, f as usize);
            }
            Entry::Closure(boxed) => {
                // Double-box: a fat pointer does not fit one argument
                // register.
                let raw = Box::into_raw(Box::new(boxed));
                ctx.set_return_address(run_closure as usize)
                    .set_arg(0, raw as usize);
            }
        }
        self
    }

    #[inline]
    pub(crate) fn take_cleanup(&mut self) -> Option<Entry> {
        self.cleanup.take()
    }

    #[inline]
    pub fn set_cleanup(&mut self, cleanup: Entry) {
        self.cleanup = Some(cleanup);
    }

    /// Drops a boxed stack early, for threads flagged to release it on
    /// exit before the handle itself dies.
    pub(crate) fn release_stack(&mut self) {
        self.stack = Stack::Raw { base: 0, size: 0 };
    }

    #[inline]
    pub fn stats(&self) -> &ThreadStats {
        &self.stats
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        debug_assert!(!self.sched_node.is_linked());
        debug_assert!(!self.global.is_linked());
        // Let destructor observers run before the memory goes away.
        self.destroy_waitq.wake_all();
        self.death_waitq.wake_all();
    }
}

// ThreadInner is only reached through the thread lock.
unsafe impl Sync for Thread {}

pub(crate) struct PreemptGuard {
    t: ThreadNode,
    status: bool,
}

impl PreemptGuard {
    #[inline(always)]
    pub fn preemptable(&self) -> bool {
        self.status
    }
}

impl Drop for PreemptGuard {
    #[inline]
    fn drop(&mut self) {
        self.t.enable_preempt();
    }
}

/// How a wait deadline is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    RelativeNs,
    AbsoluteNs,
    AbsoluteMonotonic,
}

/// Parks the current thread on `q` until woken. Thread context only.
pub fn wait(q: &WaitQueue) -> Result {
    let guard = q.lock();
    wait_locked(q, guard, None)
}

/// Parks the current thread on `q` with a deadline. Distinguishes a
/// wake ([`Ok`]) from deadline expiry ([`Error::Timeout`]).
pub fn wait_timeout(q: &WaitQueue, delay: u64, kind: TimeoutKind) -> Result {
    let guard = q.lock();
    wait_locked(q, guard, Some((delay, kind)))
}

/// The already-locked variant: registers the waiter and keeps `guard`
/// held until the thread is fully parked, so no wake can slip between
/// queue registration and the context switch.
pub fn wait_locked(
    q: &WaitQueue,
    mut guard: SpinLockGuard<'_, WaitList>,
    timeout: Option<(u64, TimeoutKind)>,
) -> Result {
    debug_assert!(!interrupt::is_in_interrupt());
    let me = scheduler::current_thread();
    me.set_wait_status(WAIT_NONE);
    let waiter = {
        let t = me.clone();
        Waiter::new(move |_| {
            let _ = unblock(&t, WAIT_OK);
        })
    };
    {
        let mut inner = me.lock();
        inner.current_waiter = Some(waiter.clone());
        let table = inner.hooks;
        hooks::dispatch(&table, &me, hooks::HookEvent::Block);
    }
    let ok = q.add_locked(&mut guard, waiter.clone());
    debug_assert!(ok);
    // The timer is armed after the park completes; arming it earlier
    // could fire before our context is saved.
    let arm: Option<Box<dyn FnOnce()>> = timeout.map(|(delay, kind)| {
        let t = me.clone();
        let w = waiter;
        Box::new(move || {
            let delay_ns = match kind {
                TimeoutKind::RelativeNs => delay,
                TimeoutKind::AbsoluteNs | TimeoutKind::AbsoluteMonotonic => {
                    delay.saturating_sub(time::now_ns())
                }
            };
            let cb_t = t.clone();
            match time::oneshot(delay_ns, move || {
                // Unlinking the waiter decides the race against a
                // regular wake: whoever removes it owns the outcome.
                if WaitQueue::remove(&w) {
                    let _ = unblock(&cb_t, WAIT_TIMEOUT);
                }
            }) {
                Ok(id) => t.set_wait_timer(id),
                Err(_) => {
                    log::warn!("wait deadline requested with no timer backend; waiting forever")
                }
            }
        }) as Box<dyn FnOnce()>
    });
    scheduler::park_current(guard, arm);
    let status = me.swap_wait_status(WAIT_NONE);
    {
        let mut inner = me.lock();
        inner.current_waiter = None;
        let table = inner.hooks;
        hooks::dispatch(&table, &me, hooks::HookEvent::Unblock);
    }
    match status {
        WAIT_TIMEOUT => Err(Error::Timeout),
        WAIT_CANCELLED => Err(Error::Cancelled),
        WAIT_SIGNALED => Err(Error::Signaled),
        _ => Ok(()),
    }
}

/// Makes a blocked thread runnable again, recording why. The caller
/// must be the one that unlinked the thread's waiter (or cancelled
/// its wait another way); that is what makes the outcome unique.
pub(crate) fn unblock(t: &ThreadNode, status: Uint) -> bool {
    t.set_wait_status(status);
    let timer = t.take_wait_timer();
    if status != WAIT_TIMEOUT && timer != 0 {
        let _ = time::cancel(timer);
    }
    scheduler::queue_ready_thread(BLOCKED, t.clone())
}
