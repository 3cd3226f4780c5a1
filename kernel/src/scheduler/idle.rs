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

//! Per-CPU idle threads: the dispatch target of last resort. Never on
//! a ready queue; the yield path flips them between ready and running
//! directly.

use crate::{
    config::NUM_CORES,
    sync::spinlock::SpinLock,
    thread::{self, build_static_thread, Entry, SystemThreadStorage, ThreadKind, ThreadNode},
};
use anillo_arch as arch;

static IDLE_STORAGE: [SystemThreadStorage; NUM_CORES] =
    [const { SystemThreadStorage::new(ThreadKind::Idle) }; NUM_CORES];

static IDLE: [SpinLock<Option<ThreadNode>>; NUM_CORES] =
    [const { SpinLock::new(None) }; NUM_CORES];

extern "C" fn run_idle() {
    loop {
        super::yield_now();
        arch::idle();
    }
}

pub(crate) fn init_idle_threads() {
    for (i, slot) in IDLE.iter().enumerate() {
        let mut w = slot.irqsave_lock();
        if w.is_some() {
            continue;
        }
        let t = build_static_thread(&IDLE_STORAGE[i], thread::READY, Entry::C(run_idle));
        *w = Some(t);
    }
}

pub(crate) fn idle_thread_on(cpu: usize) -> ThreadNode {
    IDLE[cpu]
        .irqsave_lock()
        .clone()
        .expect("scheduler not initialized")
}

pub(crate) fn current_idle_thread() -> ThreadNode {
    idle_thread_on(arch::current_cpu_id())
}
