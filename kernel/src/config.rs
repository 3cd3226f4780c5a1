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

pub use anillo_kconfig::{
    ALLOW_NESTED_INTERRUPTS, DEFAULT_STACK_SIZE, MAX_THREAD_HOOKS, MAX_TIMER_BACKENDS, NUM_CORES,
    NUM_WORKER_THREADS, SCHED_QUANTUM_NS, SYSTEM_THREAD_STACK_SIZE,
};

/// Floor added to every backend arm so a burst of short timers cannot
/// drown the CPU in back-to-back fires.
pub const MIN_SCHED_DELAY_NS: u64 = 1_000;

/// Hook slot reserved for the thread manager.
pub const THREAD_MANAGER_HOOK_OWNER: usize = 0;
