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

//! The concurrency substrate of Anillo OS: interrupt-disable
//! accounting, spinlocks, wait queues, semaphores, threads, the
//! per-CPU scheduler, the deadline-ordered timer service and the
//! deferred-work subsystem. Everything else in the kernel is a
//! consumer of these primitives.

#![cfg_attr(not(test), no_std)]

pub extern crate alloc;

pub mod boot;
pub mod config;
pub mod cpu;
pub mod error;
pub mod interrupt;
pub mod scheduler;
mod support;
pub mod sync;
pub mod thread;
pub mod time;
pub mod types;
pub mod work;

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard};

    static SERIAL: Mutex<()> = Mutex::new(());

    // The harness runs tests on several host threads, all of which the
    // hosted arch layer maps to CPU 0. Tests that touch per-CPU or
    // global kernel state take this lock first.
    pub fn serial() -> MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
    // Fatal invariant violation. Console output belongs to the outer
    // kernel; all we can do here is park the CPU.
    anillo_arch::mask_interrupts();
    loop {
        core::hint::spin_loop();
    }
}
