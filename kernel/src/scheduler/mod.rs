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

//! Preemptive per-CPU scheduler. One FIFO ready ring per CPU, one
//! shared suspended queue, one current-thread slot per CPU. Quantum
//! expiry is driven through the timer service; the context switch
//! itself is an arch primitive that calls back into
//! [`anillo_context_switch_finish`] on the incoming stack.

extern crate alloc;
use crate::{
    config, interrupt,
    sync::spinlock::{SpinLock, SpinLockGuard},
    sync::waitq::{WaitList, WaitQueue},
    thread::{
        self, hooks, Entry, Thread, ThreadFlags, ThreadNode, CPU_NONE, CPU_SUSPENDED_QUEUE,
    },
    time,
    types::{Arc, ArcList, Uint},
};
use crate::error::{Error, Result};
use alloc::boxed::Box;
use anillo_arch as arch;
use core::{
    ffi::c_void,
    sync::atomic::{compiler_fence, AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

mod idle;

type ThreadList = ArcList<Thread, thread::ViaSchedNode>;
type RegistryList = ArcList<Thread, thread::ViaGlobal>;

/// Per-CPU scheduler state.
struct SchedInfo {
    ready: SpinLock<ThreadList>,
    /// Quantum timer armed for the thread currently dispatched here.
    armed_timer: AtomicU64,
    active: AtomicBool,
}

// The ready ring is only touched under its lock.
unsafe impl Send for SchedInfo {}
unsafe impl Sync for SchedInfo {}

impl SchedInfo {
    const fn new() -> Self {
        Self {
            ready: SpinLock::new(ThreadList::new()),
            armed_timer: AtomicU64::new(0),
            active: AtomicBool::new(false),
        }
    }
}

static SCHED_INFOS: [SchedInfo; config::NUM_CORES] =
    [const { SchedInfo::new() }; config::NUM_CORES];

struct SuspendedQueue {
    list: SpinLock<ThreadList>,
}
unsafe impl Send for SuspendedQueue {}
unsafe impl Sync for SuspendedQueue {}

/// All suspended threads, regardless of which CPU they last ran on.
static SUSPENDED_THREADS: SuspendedQueue = SuspendedQueue {
    list: SpinLock::new(ThreadList::new()),
};

struct Registry {
    list: SpinLock<RegistryList>,
}
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

/// Every live thread, for `find` and `foreach`.
static REGISTRY: Registry = Registry {
    list: SpinLock::new(RegistryList::new()),
};

static CURRENT: [SpinLock<Option<ThreadNode>>; config::NUM_CORES] =
    [const { SpinLock::new(None) }; config::NUM_CORES];

static PLACE_RR: AtomicUsize = AtomicUsize::new(0);

pub fn init() {
    install_finish_hook();
    idle::init_idle_threads();
}

// The hosted port calls the finish hook through a registered pointer;
// asm ports branch to the symbol and ignore this.
#[inline]
fn install_finish_hook() {
    arch::set_context_switch_finish(anillo_context_switch_finish);
}

/// Hands this CPU to the scheduler, dispatching `initial` first. The
/// bootstrap restore has no previous context to save.
pub fn start(initial: ThreadNode) -> ! {
    install_finish_hook();
    let cpu = arch::current_cpu_id();
    SCHED_INFOS[cpu].active.store(true, Ordering::SeqCst);
    let _ = remove_from_suspended_queue(&initial);
    let ok = initial.transfer_state(thread::SUSPENDED, thread::READY);
    assert!(ok, "bootstrap thread must be fresh");
    let to_sp = initial.saved_sp();
    let mut hook = ContextSwitchHookHolder::new(initial);
    unsafe { arch::restore_context_with_hook(to_sp, &mut hook as *mut _ as *mut c_void) }
}

// ---- thread placement ----------------------------------------------------

pub(crate) fn register_thread(t: ThreadNode) {
    let mut g = REGISTRY.list.irqsave_lock();
    let ok = g.push_back(t);
    debug_assert!(ok);
}

fn unregister_thread(t: &ThreadNode) {
    let mut g = REGISTRY.list.irqsave_lock();
    let _ = g.remove(t);
}

pub(crate) fn enqueue_suspended(t: &ThreadNode) {
    let mut g = SUSPENDED_THREADS.list.irqsave_lock();
    let ok = g.push_back(t.clone());
    assert!(ok);
    t.queued_cpu.store(CPU_SUSPENDED_QUEUE, Ordering::SeqCst);
}

fn remove_from_suspended_queue(t: &ThreadNode) -> bool {
    let mut g = SUSPENDED_THREADS.list.irqsave_lock();
    let ok = g.remove(t);
    if ok {
        t.queued_cpu.store(CPU_NONE, Ordering::SeqCst);
    }
    ok
}

fn remove_from_ready_queue(t: &ThreadNode) -> bool {
    loop {
        let cpu = t.queued_cpu.load(Ordering::SeqCst);
        if cpu >= config::NUM_CORES {
            return false;
        }
        let mut g = SCHED_INFOS[cpu].ready.irqsave_lock();
        if t.queued_cpu.load(Ordering::SeqCst) != cpu {
            continue;
        }
        // A running thread records its CPU here too; `remove` fails
        // for it because it is not linked.
        let ok = g.remove(t);
        if ok {
            t.queued_cpu.store(CPU_NONE, Ordering::SeqCst);
        }
        return ok;
    }
}

fn pick_cpu() -> usize {
    for _ in 0..config::NUM_CORES {
        let id = PLACE_RR.fetch_add(1, Ordering::Relaxed) % config::NUM_CORES;
        if SCHED_INFOS[id].active.load(Ordering::Relaxed) {
            return id;
        }
    }
    arch::current_cpu_id()
}

/// Appends `t` to a round-robin-chosen active CPU's ready ring,
/// provided its state still equals `old_state`.
pub fn queue_ready_thread(old_state: Uint, t: ThreadNode) -> bool {
    queue_ready_thread_on(pick_cpu(), old_state, t)
}

/// Same, with the target CPU chosen by the caller.
pub fn queue_ready_thread_on(cpu: usize, old_state: Uint, t: ThreadNode) -> bool {
    assert_ne!(old_state, thread::READY);
    if !t.transfer_state(old_state, thread::READY) {
        return false;
    }
    {
        let mut g = SCHED_INFOS[cpu].ready.irqsave_lock();
        let ok = g.push_back(t.clone());
        assert!(ok);
        t.queued_cpu.store(cpu, Ordering::SeqCst);
    }
    if cpu != arch::current_cpu_id() && SCHED_INFOS[cpu].active.load(Ordering::Relaxed) {
        arch::cross_cpu_poke(cpu);
    }
    true
}

/// Pops the head of this CPU's ready ring.
pub fn next_ready_thread() -> Option<ThreadNode> {
    let cpu = arch::current_cpu_id();
    let mut g = SCHED_INFOS[cpu].ready.irqsave_lock();
    let t = g.pop_front()?;
    t.queued_cpu.store(CPU_NONE, Ordering::SeqCst);
    Some(t)
}

pub fn ready_count_on(cpu: usize) -> usize {
    SCHED_INFOS[cpu].ready.irqsave_lock().len()
}

// ---- current thread ------------------------------------------------------

fn set_current_thread(cpu: usize, t: ThreadNode) -> Option<ThreadNode> {
    debug_assert!(t.validate_saved_sp());
    CURRENT[cpu].irqsave_lock().replace(t)
}

pub fn current_thread_opt() -> Option<ThreadNode> {
    let _g = interrupt::InterruptGuard::new();
    CURRENT[arch::current_cpu_id()].irqsave_lock().clone()
}

pub fn current_thread() -> ThreadNode {
    current_thread_opt().expect("scheduler not started on this CPU")
}

pub fn current_thread_id() -> usize {
    Thread::id(&current_thread())
}

fn current_thread_on(cpu: usize) -> Option<ThreadNode> {
    CURRENT[cpu].irqsave_lock().clone()
}

// ---- context switch plumbing ---------------------------------------------

/// Wait-queue guards carried across a context switch: released on the
/// incoming stack once the outgoing thread is fully parked.
pub(crate) struct WaitGuardDropper<'a, const N: usize = 2> {
    guards: [Option<SpinLockGuard<'a, WaitList>>; N],
    active: usize,
}

impl<'a, const N: usize> WaitGuardDropper<'a, N> {
    pub const fn new() -> Self {
        Self {
            guards: [const { None }; N],
            active: 0,
        }
    }

    pub fn add(&mut self, g: SpinLockGuard<'a, WaitList>) -> bool {
        if self.active == N {
            return false;
        }
        self.guards[self.active] = Some(g);
        self.active += 1;
        true
    }

    pub fn forget_irq(&mut self) {
        for g in self.guards.iter_mut().flatten() {
            g.forget_irq();
        }
    }
}

/// Everything the switch finish hook must do on behalf of the
/// outgoing thread. Lives on that thread's stack; the finish hook
/// moves the contents onto the incoming stack before acting.
pub(crate) struct ContextSwitchHookHolder<'a> {
    next_thread: Option<ThreadNode>,
    ready_thread: Option<ThreadNode>,
    /// Outgoing thread plus the parked state it transfers to.
    pending_thread: Option<(ThreadNode, Uint)>,
    retiring_thread: Option<ThreadNode>,
    closure: Option<Box<dyn FnOnce()>>,
    dropper: Option<WaitGuardDropper<'a, 2>>,
}

impl<'a> ContextSwitchHookHolder<'a> {
    pub fn new(next_thread: ThreadNode) -> Self {
        Self {
            next_thread: Some(next_thread),
            ready_thread: None,
            pending_thread: None,
            retiring_thread: None,
            closure: None,
            dropper: None,
        }
    }

    pub fn set_ready_thread(&mut self, t: ThreadNode) -> &mut Self {
        self.ready_thread = Some(t);
        self
    }

    pub fn set_pending_thread(&mut self, t: ThreadNode, parked_state: Uint) -> &mut Self {
        self.pending_thread = Some((t, parked_state));
        self
    }

    pub fn set_retiring_thread(&mut self, t: ThreadNode) -> &mut Self {
        self.retiring_thread = Some(t);
        self
    }

    pub fn set_closure(&mut self, f: Box<dyn FnOnce()>) -> &mut Self {
        self.closure = Some(f);
        self
    }

    pub fn set_dropper(&mut self, d: WaitGuardDropper<'a, 2>) -> &mut Self {
        self.dropper = Some(d);
        self
    }
}

/// Completes a context switch. Runs on the incoming stack with
/// interrupts masked; called by the arch layer exactly once per
/// switch.
#[no_mangle]
pub extern "C" fn anillo_context_switch_finish(hook: *mut c_void) {
    let hook = hook as *mut ContextSwitchHookHolder;
    let Some(hook) = (unsafe { hook.as_mut() }) else {
        return;
    };
    // The arch layer enters with interrupts masked but no disable on
    // the books; put one there so nested guards cannot unmask early.
    // reset_after_switch() clears it at the end.
    interrupt::disable();
    // Take ownership of every pending action first: the holder sits
    // on the outgoing thread's stack, which may be reused the moment
    // that thread is requeued.
    let ready_thread = hook.ready_thread.take();
    let pending_thread = hook.pending_thread.take();
    let retiring_thread = hook.retiring_thread.take();
    let closure = hook.closure.take();
    let mut dropper = hook.dropper.take();
    let next = hook.next_thread.take();
    compiler_fence(Ordering::SeqCst);
    let Some(next) = next else {
        panic!("next thread must be specified");
    };
    let cpu = arch::current_cpu_id();
    {
        let ok = next.transfer_state(thread::READY, thread::RUNNING);
        assert!(ok);
        next.queued_cpu.store(cpu, Ordering::SeqCst);
        let _old = set_current_thread(cpu, next.clone());
        next.lock().stats.count_dispatch();
        #[cfg(feature = "debugging_scheduler")]
        log::trace!(
            "cpu {} switching to {:#x} (sp {:#x})",
            cpu,
            Thread::id(&next),
            next.saved_sp(),
        );
    }
    compiler_fence(Ordering::SeqCst);
    if let Some(t) = ready_thread {
        let ok = queue_ready_thread_on(cpu, thread::RUNNING, t);
        assert!(ok);
    }
    compiler_fence(Ordering::SeqCst);
    if let Some((t, parked_state)) = pending_thread {
        let ok = t.transfer_state(thread::RUNNING, parked_state);
        assert!(ok);
        if parked_state == thread::SUSPENDED {
            enqueue_suspended(&t);
        } else {
            t.queued_cpu.store(CPU_NONE, Ordering::SeqCst);
        }
    }
    compiler_fence(Ordering::SeqCst);
    // Threads resume with interrupts deliverable; the saved state in
    // these guards must not be replayed.
    if let Some(d) = dropper.as_mut() {
        d.forget_irq();
    }
    drop(dropper);
    compiler_fence(Ordering::SeqCst);
    if let Some(f) = closure {
        f();
    }
    compiler_fence(Ordering::SeqCst);
    if let Some(t) = retiring_thread {
        finish_retire(t);
    }
    arm_quantum(cpu);
    interrupt::reset_after_switch();
}

/// Runs on the incoming stack: the dying thread's teardown never
/// happens on its own stack.
fn finish_retire(t: ThreadNode) {
    let cleanup = t.lock().take_cleanup();
    if let Some(entry) = cleanup {
        match entry {
            Entry::C(f) => f(),
            Entry::Closure(f) => f(),
        }
    }
    let timer = t.take_wait_timer();
    if timer != 0 {
        let _ = time::cancel(timer);
    }
    unregister_thread(&t);
    let ok = t.transfer_state(thread::RUNNING, thread::DEAD);
    assert!(ok);
    t.queued_cpu.store(CPU_NONE, Ordering::SeqCst);
    if t.has_flags(ThreadFlags::DEALLOCATE_STACK_ON_EXIT) {
        t.lock().release_stack();
    }
    t.death_waitq.wake_all();
}

// ---- quantum preemption --------------------------------------------------

fn arm_quantum(cpu: usize) {
    let prev = SCHED_INFOS[cpu].armed_timer.swap(0, Ordering::SeqCst);
    if prev != 0 {
        let _ = time::cancel(prev);
    }
    match time::oneshot(config::SCHED_QUANTUM_NS, move || quantum_expired(cpu)) {
        Ok(id) => SCHED_INFOS[cpu].armed_timer.store(id, Ordering::SeqCst),
        // No backend yet: cooperative until one registers.
        Err(_) => {}
    }
}

fn quantum_expired(cpu: usize) {
    if let Some(cur) = current_thread_on(cpu) {
        cur.set_flags(ThreadFlags::INTERRUPTED);
    }
    if cpu == arch::current_cpu_id() {
        arch::pend_switch_context();
    } else {
        arch::cross_cpu_poke(cpu);
    }
}

// ---- yielding and parking ------------------------------------------------

/// Voluntarily gives up the CPU. Returns once the thread is
/// dispatched again.
pub fn yield_now() {
    debug_assert!(!interrupt::is_in_interrupt());
    handle_pending_requests();
    let pg = Thread::try_preempt_me();
    if !pg.preemptable() {
        return;
    }
    drop(pg);
    yield_unconditionally();
}

/// Yield right away in thread context; from interrupt context, on the
/// innermost interrupt exit.
pub fn yield_now_or_later() {
    arch::pend_switch_context();
}

fn handle_pending_requests() {
    let me = current_thread();
    if me.has_flags(ThreadFlags::KILL_PENDING) {
        me.clear_flags(ThreadFlags::KILL_PENDING | ThreadFlags::INTERRUPTED);
        retire_me();
    }
    if me.has_flags(ThreadFlags::SUSPEND_PENDING) {
        me.clear_flags(ThreadFlags::SUSPEND_PENDING | ThreadFlags::INTERRUPTED);
        suspend_me();
    }
}

fn yield_unconditionally() {
    let Some(next) = next_ready_thread() else {
        arch::idle();
        return;
    };
    let me = current_thread();
    me.clear_flags(ThreadFlags::INTERRUPTED);
    let to_sp = next.saved_sp();
    let from_sp = me.saved_sp_ptr();
    let mut hook = ContextSwitchHookHolder::new(next);
    let idle_t = idle::current_idle_thread();
    if Arc::same(&me, &idle_t) {
        // Idle threads are never queued; flip the state by hand.
        let ok = me.transfer_state(thread::RUNNING, thread::READY);
        assert!(ok);
        drop(me);
    } else {
        hook.set_ready_thread(me);
    }
    unsafe { arch::switch_context_with_hook(from_sp, to_sp, &mut hook as *mut _ as *mut c_void) };
}

/// Parks the current thread as blocked. `g` is the wait-queue guard
/// protecting the just-registered waiter; it stays held until the
/// park is complete. `after` runs on the incoming stack (used to arm
/// wait timers once the context is safely saved).
pub(crate) fn park_current(g: SpinLockGuard<'_, WaitList>, after: Option<Box<dyn FnOnce()>>) {
    let next = next_ready_thread().unwrap_or_else(idle::current_idle_thread);
    let me = current_thread();
    let to_sp = next.saved_sp();
    let from_sp = me.saved_sp_ptr();
    let mut dropper = WaitGuardDropper::new();
    dropper.add(g);
    let mut hook = ContextSwitchHookHolder::new(next);
    hook.set_dropper(dropper);
    hook.set_pending_thread(me.clone(), thread::BLOCKED);
    if let Some(f) = after {
        hook.set_closure(f);
    }
    drop(me);
    unsafe { arch::switch_context_with_hook(from_sp, to_sp, &mut hook as *mut _ as *mut c_void) };
}

/// Parks the current thread onto the shared suspended queue. Returns
/// once a later resume dispatches it again.
pub fn suspend_me() {
    debug_assert!(!interrupt::is_in_interrupt());
    let next = next_ready_thread().unwrap_or_else(idle::current_idle_thread);
    let me = current_thread();
    let to_sp = next.saved_sp();
    let from_sp = me.saved_sp_ptr();
    let mut hook = ContextSwitchHookHolder::new(next);
    hook.set_pending_thread(me.clone(), thread::SUSPENDED);
    drop(me);
    unsafe { arch::switch_context_with_hook(from_sp, to_sp, &mut hook as *mut _ as *mut c_void) };
}

/// Ends the current thread. Teardown happens on the incoming stack.
pub fn retire_me() -> ! {
    debug_assert!(!interrupt::is_in_interrupt());
    let me = current_thread();
    {
        let inner = me.lock();
        let table = inner.hooks;
        hooks::dispatch(&table, &me, hooks::HookEvent::Kill);
    }
    let next = next_ready_thread().unwrap_or_else(idle::current_idle_thread);
    let to_sp = next.saved_sp();
    let mut hook = ContextSwitchHookHolder::new(next);
    hook.set_retiring_thread(me);
    unsafe { arch::restore_context_with_hook(to_sp, &mut hook as *mut _ as *mut c_void) }
}

// ---- cross-thread operations ---------------------------------------------

/// Suspends `t`, wherever it currently is. A thread running on
/// another CPU is marked and poked; the move completes at that CPU's
/// next dispatch boundary.
pub fn suspend_thread(t: &ThreadNode) -> Result {
    {
        let inner = t.lock();
        let table = inner.hooks;
        hooks::dispatch(&table, t, hooks::HookEvent::Suspend);
    }
    loop {
        match t.state() {
            thread::READY => {
                if !remove_from_ready_queue(t) {
                    arch::spin_hint();
                    continue;
                }
                let ok = t.transfer_state(thread::READY, thread::SUSPENDED);
                assert!(ok);
                enqueue_suspended(t);
                return Ok(());
            }
            thread::RUNNING => {
                if let Some(me) = current_thread_opt() {
                    if Arc::same(t, &me) {
                        suspend_me();
                        return Ok(());
                    }
                }
                t.set_flags(ThreadFlags::SUSPEND_PENDING | ThreadFlags::INTERRUPTED);
                let cpu = t.queued_cpu.load(Ordering::SeqCst);
                if cpu < config::NUM_CORES {
                    arch::cross_cpu_poke(cpu);
                }
                return Ok(());
            }
            thread::BLOCKED => {
                let w = t.lock().current_waiter.clone();
                let Some(w) = w else {
                    arch::spin_hint();
                    continue;
                };
                if !WaitQueue::remove(&w) {
                    // Lost the race against a wake; loop on the new
                    // state.
                    arch::spin_hint();
                    continue;
                }
                t.set_wait_status(thread::WAIT_SIGNALED);
                let timer = t.take_wait_timer();
                if timer != 0 {
                    let _ = time::cancel(timer);
                }
                let ok = t.transfer_state(thread::BLOCKED, thread::SUSPENDED);
                assert!(ok);
                enqueue_suspended(t);
                return Ok(());
            }
            thread::SUSPENDED => return Err(Error::InvalidArgument),
            thread::DEAD => return Err(Error::PermanentOutage),
            _ => unreachable!(),
        }
    }
}

/// Makes a suspended thread runnable on `cpu` (or a round-robin
/// choice).
pub fn resume_thread(t: &ThreadNode, cpu: Option<usize>) -> Result {
    {
        let inner = t.lock();
        let table = inner.hooks;
        hooks::dispatch(&table, t, hooks::HookEvent::Resume);
    }
    if let Some(c) = cpu {
        if c >= config::NUM_CORES {
            return Err(Error::InvalidArgument);
        }
    }
    if t.state() != thread::SUSPENDED {
        return Err(Error::InvalidArgument);
    }
    let _ = remove_from_suspended_queue(t);
    let target = cpu.unwrap_or_else(pick_cpu);
    if queue_ready_thread_on(target, thread::SUSPENDED, t.clone()) {
        Ok(())
    } else {
        Err(Error::InvalidArgument)
    }
}

/// Kills `t`. The dying thread's queues are cleaned up immediately
/// except when it is running on another CPU, where the kill completes
/// at that CPU's next dispatch boundary.
pub fn kill_thread(t: &ThreadNode) -> Result {
    if let Some(me) = current_thread_opt() {
        if Arc::same(t, &me) {
            retire_me();
        }
    }
    {
        let inner = t.lock();
        let table = inner.hooks;
        hooks::dispatch(&table, t, hooks::HookEvent::Kill);
    }
    loop {
        match t.state() {
            thread::READY => {
                if !remove_from_ready_queue(t) {
                    arch::spin_hint();
                    continue;
                }
                let ok = t.transfer_state(thread::READY, thread::DEAD);
                assert!(ok);
                finish_kill(t);
                return Ok(());
            }
            thread::SUSPENDED => {
                if !remove_from_suspended_queue(t) {
                    arch::spin_hint();
                    continue;
                }
                let ok = t.transfer_state(thread::SUSPENDED, thread::DEAD);
                assert!(ok);
                finish_kill(t);
                return Ok(());
            }
            thread::BLOCKED => {
                let w = t.lock().current_waiter.clone();
                let Some(w) = w else {
                    arch::spin_hint();
                    continue;
                };
                if !WaitQueue::remove(&w) {
                    arch::spin_hint();
                    continue;
                }
                let ok = t.transfer_state(thread::BLOCKED, thread::DEAD);
                assert!(ok);
                finish_kill(t);
                return Ok(());
            }
            thread::RUNNING => {
                t.set_flags(ThreadFlags::KILL_PENDING | ThreadFlags::INTERRUPTED);
                let cpu = t.queued_cpu.load(Ordering::SeqCst);
                if cpu < config::NUM_CORES {
                    arch::cross_cpu_poke(cpu);
                }
                return Ok(());
            }
            thread::DEAD => return Err(Error::PermanentOutage),
            _ => unreachable!(),
        }
    }
}

fn finish_kill(t: &ThreadNode) {
    let timer = t.take_wait_timer();
    if timer != 0 {
        let _ = time::cancel(timer);
    }
    unregister_thread(t);
    if t.has_flags(ThreadFlags::DEALLOCATE_STACK_ON_EXIT) {
        t.lock().release_stack();
    }
    t.death_waitq.wake_all();
}

/// Preempts `t` as soon as possible. Must be called with `t`'s lock
/// held; when `t` is the current thread the call yields immediately
/// (the guard is released on the switch-out path) and only returns
/// once `t` is dispatched again.
pub fn preempt_thread(t: &ThreadNode, guard: SpinLockGuard<'_, thread::ThreadInner>) {
    t.set_flags(ThreadFlags::INTERRUPTED);
    if let Some(me) = current_thread_opt() {
        if Arc::same(t, &me) {
            drop(guard);
            yield_unconditionally();
            return;
        }
    }
    if t.state() == thread::RUNNING {
        let cpu = t.queued_cpu.load(Ordering::SeqCst);
        if cpu < config::NUM_CORES {
            arch::cross_cpu_poke(cpu);
        }
    }
    drop(guard);
}

/// Asks `cpu` to reconsider its current thread.
pub fn preempt_cpu(cpu: usize) {
    if cpu == arch::current_cpu_id() {
        yield_now_or_later();
    } else {
        arch::cross_cpu_poke(cpu);
    }
}

// ---- lookup --------------------------------------------------------------

/// Returns a retained handle for the live thread with this id.
pub fn find(thread_id: usize) -> Option<ThreadNode> {
    let g = REGISTRY.list.irqsave_lock();
    g.iter().find(|t| Thread::id(t) == thread_id)
}

/// Walks every live thread with the registry lock held: `f` must not
/// call any scheduler mutator on the thread. Return false from `f` to
/// stop early.
pub fn foreach_thread(mut f: impl FnMut(&ThreadNode) -> bool, include_suspended: bool) {
    let g = REGISTRY.list.irqsave_lock();
    for t in g.iter() {
        let st = t.state();
        if st == thread::DEAD {
            continue;
        }
        if !include_suspended && st == thread::SUSPENDED {
            continue;
        }
        if !f(&t) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Builder;

    fn fresh_thread() -> ThreadNode {
        extern "C" fn nop() {}
        Builder::new(Entry::C(nop)).build()
    }

    #[test]
    fn new_thread_is_suspended_and_registered() {
        let _s = crate::testing::serial();
        init();
        let t = fresh_thread();
        assert_eq!(t.state(), thread::SUSPENDED);
        assert_eq!(t.queued_cpu.load(Ordering::SeqCst), CPU_SUSPENDED_QUEUE);
        let found = find(Thread::id(&t)).expect("registered");
        assert!(Arc::same(&found, &t));
        drop(found);
        assert!(kill_thread(&t).is_ok());
        assert_eq!(t.state(), thread::DEAD);
        assert!(find(Thread::id(&t)).is_none());
    }

    #[test]
    fn ready_ring_is_fifo_per_cpu() {
        let _s = crate::testing::serial();
        init();
        let a = fresh_thread();
        let b = fresh_thread();
        let c = fresh_thread();
        for t in [&a, &b, &c] {
            assert!(remove_from_suspended_queue(t));
            assert!(queue_ready_thread_on(0, thread::SUSPENDED, t.clone()));
        }
        assert_eq!(ready_count_on(0), 3);
        // Same queue, same order.
        for expect in [&a, &b, &c] {
            let got = next_ready_thread().unwrap();
            assert!(Arc::same(&got, expect));
            assert_eq!(got.state(), thread::READY);
        }
        // A popped thread is mid-dispatch; park it again before the
        // kill so the cleanup goes through a legal state.
        for t in [a, b, c] {
            unsafe { t.set_state(thread::SUSPENDED) };
            enqueue_suspended(&t);
            assert!(kill_thread(&t).is_ok());
        }
    }

    #[test]
    fn queue_ready_rejects_stale_state() {
        let _s = crate::testing::serial();
        init();
        let t = fresh_thread();
        // Still on the suspended queue and in SUSPENDED state; a
        // caller claiming it was BLOCKED must lose.
        assert!(!queue_ready_thread_on(0, thread::BLOCKED, t.clone()));
        assert!(kill_thread(&t).is_ok());
    }

    #[test]
    fn resume_places_on_named_cpu() {
        let _s = crate::testing::serial();
        init();
        let t = fresh_thread();
        let cpu = config::NUM_CORES - 1;
        assert!(resume_thread(&t, Some(cpu)).is_ok());
        assert_eq!(t.state(), thread::READY);
        assert_eq!(t.queued_cpu.load(Ordering::SeqCst), cpu);
        assert!(resume_thread(&t, Some(cpu)).is_err());
        assert!(kill_thread(&t).is_ok());
        assert_eq!(ready_count_on(cpu), 0);
    }

    #[test]
    fn resume_rejects_bad_cpu() {
        let _s = crate::testing::serial();
        init();
        let t = fresh_thread();
        assert_eq!(
            resume_thread(&t, Some(config::NUM_CORES)),
            Err(Error::InvalidArgument)
        );
        assert!(kill_thread(&t).is_ok());
    }

    #[test]
    fn suspend_ready_thread_moves_to_shared_queue() {
        let _s = crate::testing::serial();
        init();
        let t = fresh_thread();
        assert!(resume_thread(&t, Some(0)).is_ok());
        assert!(suspend_thread(&t).is_ok());
        assert_eq!(t.state(), thread::SUSPENDED);
        assert_eq!(t.queued_cpu.load(Ordering::SeqCst), CPU_SUSPENDED_QUEUE);
        assert_eq!(ready_count_on(0), 0);
        // Suspending twice is an illegal state for the call.
        assert_eq!(suspend_thread(&t), Err(Error::InvalidArgument));
        assert!(kill_thread(&t).is_ok());
    }

    #[test]
    fn kill_notifies_death_waitq() {
        use crate::sync::waitq::Waiter;
        use std::sync::atomic::{AtomicUsize as A, Ordering as O};
        static DEATHS: A = A::new(0);
        let _s = crate::testing::serial();
        init();
        let t = fresh_thread();
        t.death_waitq.add(Waiter::new(|_| {
            DEATHS.fetch_add(1, O::SeqCst);
        }));
        let before = DEATHS.load(O::SeqCst);
        assert!(kill_thread(&t).is_ok());
        assert_eq!(DEATHS.load(O::SeqCst), before + 1);
        assert_eq!(kill_thread(&t), Err(Error::PermanentOutage));
    }

    #[test]
    fn foreach_sees_suspended_only_when_asked() {
        let _s = crate::testing::serial();
        init();
        let t = fresh_thread();
        let id = Thread::id(&t);
        let mut seen = false;
        foreach_thread(
            |x| {
                seen |= Thread::id(x) == id;
                true
            },
            false,
        );
        assert!(!seen);
        foreach_thread(
            |x| {
                seen |= Thread::id(x) == id;
                true
            },
            true,
        );
        assert!(seen);
        assert!(kill_thread(&t).is_ok());
    }

    #[test]
    fn preempt_cpu_pokes_remote() {
        let _s = crate::testing::serial();
        init();
        let victim = 1;
        let before = arch::poke_count(victim);
        preempt_cpu(victim);
        assert_eq!(arch::poke_count(victim), before + 1);
    }
}
