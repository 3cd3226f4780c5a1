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

//! Per-CPU state reached through a runtime accessor. The fields are
//! atomics only so Rust accepts the shared statics; each slot is
//! touched exclusively by its own CPU.

use anillo_arch as arch;
use anillo_kconfig::NUM_CORES;
use core::sync::atomic::AtomicUsize;

pub struct CpuLocal {
    /// Outstanding interrupt disables (component A's counter).
    pub(crate) irq_disable_count: AtomicUsize,
    /// Depth of interrupt frames currently on this CPU's stack.
    pub(crate) irq_nest: AtomicUsize,
}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            irq_disable_count: AtomicUsize::new(0),
            irq_nest: AtomicUsize::new(0),
        }
    }
}

static CPUS: [CpuLocal; NUM_CORES] = [const { CpuLocal::new() }; NUM_CORES];

#[inline]
pub fn current() -> &'static CpuLocal {
    by_id(arch::current_cpu_id())
}

#[inline]
pub fn by_id(id: usize) -> &'static CpuLocal {
    &CPUS[id]
}
