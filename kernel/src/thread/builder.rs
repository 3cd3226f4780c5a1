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
use super::{
    AlignedStackStorage, Entry, Stack, Thread, ThreadFlags, ThreadKind, ThreadNode,
};
use crate::{
    config::SYSTEM_THREAD_STACK_SIZE,
    error::Result,
    scheduler,
    types::{ArcInner, Uint},
};
use alloc::boxed::Box;
use core::cell::UnsafeCell;

/// Spawns a thread running `f` and makes it runnable right away.
pub fn spawn<F>(f: F) -> Result<ThreadNode>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new(Entry::Closure(Box::new(f))).start()
}

pub struct Builder {
    stack: Option<Stack>,
    entry: Entry,
    kind: ThreadKind,
    flags: ThreadFlags,
    cpu: Option<usize>,
}

impl Builder {
    pub fn new(entry: Entry) -> Self {
        Self {
            stack: None,
            entry,
            kind: ThreadKind::Normal,
            flags: ThreadFlags::empty(),
            cpu: None,
        }
    }

    #[inline]
    pub fn set_stack(mut self, stack: Stack) -> Self {
        self.stack = Some(stack);
        self
    }

    #[inline]
    pub fn set_kind(mut self, kind: ThreadKind) -> Self {
        self.kind = kind;
        self
    }

    #[inline]
    pub fn set_flags(mut self, flags: ThreadFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Pins the first dispatch to a CPU; otherwise placement is
    /// round-robin over active CPUs.
    #[inline]
    pub fn set_cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    /// Creates the thread suspended: registered, parked on the shared
    /// suspended queue, waiting for a resume.
    pub fn build(self) -> ThreadNode {
        let t = ThreadNode::new(Thread::const_new(self.kind));
        let mut flags = self.flags;
        let stack = self.stack.unwrap_or_else(|| {
            flags |= ThreadFlags::DEALLOCATE_STACK_ON_EXIT;
            Stack::Boxed(unsafe { Box::<AlignedStackStorage>::new_uninit().assume_init() })
        });
        t.set_flags(flags);
        {
            let mut w = t.lock();
            w.init(stack, self.entry);
        }
        scheduler::register_thread(t.clone());
        scheduler::enqueue_suspended(&t);
        t
    }

    /// Builds and immediately resumes.
    pub fn start(self) -> Result<ThreadNode> {
        let cpu = self.cpu;
        let t = self.build();
        scheduler::resume_thread(&t, cpu)?;
        Ok(t)
    }
}

#[repr(align(16))]
pub(crate) struct SystemThreadStack(UnsafeCell<[u8; SYSTEM_THREAD_STACK_SIZE]>);

// Only the owning thread runs on this stack.
unsafe impl Sync for SystemThreadStack {}

/// Backing storage for threads that must exist before the allocator
/// does (idle threads): control block plus stack, all static.
pub(crate) struct SystemThreadStorage {
    arc: ArcInner<Thread>,
    stack: SystemThreadStack,
}

impl SystemThreadStorage {
    pub(crate) const fn new(kind: ThreadKind) -> Self {
        Self {
            arc: ArcInner::new(Thread::const_new(kind)),
            stack: SystemThreadStack(UnsafeCell::new([0u8; SYSTEM_THREAD_STACK_SIZE])),
        }
    }
}

/// Wires up a thread over static storage. Must be called at most once
/// per storage block.
pub(crate) fn build_static_thread(
    s: &'static SystemThreadStorage,
    init_state: Uint,
    entry: Entry,
) -> ThreadNode {
    let t = unsafe { ThreadNode::from_static(&s.arc) };
    {
        let mut w = t.lock();
        w.init(
            Stack::Raw {
                base: s.stack.0.get() as usize,
                size: SYSTEM_THREAD_STACK_SIZE,
            },
            entry,
        );
    }
    unsafe { t.set_state(init_state) };
    scheduler::register_thread(t.clone());
    t
}
