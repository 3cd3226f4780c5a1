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

#![no_std]

//! Build-time configuration of the concurrency core. Boards override
//! these by patching this crate; the defaults target a small SMP
//! machine and the hosted test build.

/// Number of CPUs the scheduler manages.
pub const NUM_CORES: usize = 4;

/// Default stack size for threads built without an explicit stack.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

/// Stack size for internal system threads (idle, workers).
pub const SYSTEM_THREAD_STACK_SIZE: usize = 8 * 1024;

/// Hook slots per thread. Slot 0 is reserved for the thread manager.
pub const MAX_THREAD_HOOKS: usize = 4;

/// Capacity of the timer backend registry.
pub const MAX_TIMER_BACKENDS: usize = 4;

/// Threads in the deferred-work pool.
pub const NUM_WORKER_THREADS: usize = 2;

/// Scheduler quantum in nanoseconds.
pub const SCHED_QUANTUM_NS: u64 = 10_000_000;

/// Whether an interrupt handler may itself be interrupted. When false,
/// re-enabling interrupts from inside an interrupt frame is fatal.
pub const ALLOW_NESTED_INTERRUPTS: bool = false;
