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

//! Bring-up of the concurrency core and the interrupt entry/exit glue
//! ports hang their vectors on.

use crate::{error::Result, interrupt, scheduler, thread, work};

/// Initializes the core on the boot CPU: idle threads and the worker
/// pool. Timer backends register separately, from their drivers.
pub fn init() -> Result {
    scheduler::init();
    work::init()
}

/// Creates the initial kernel thread around `entry` and hands this
/// CPU to the scheduler.
pub fn start(entry: extern "C" fn()) -> ! {
    let t = thread::Builder::new(thread::Entry::C(entry)).build();
    scheduler::start(t)
}

/// Interrupt prologue: call first from every interrupt vector.
pub fn irq_enter() {
    interrupt::enter_interrupt();
    if let Some(t) = scheduler::current_thread_opt() {
        thread::interrupt_entered(&t);
    }
}

/// Interrupt epilogue: call last, after the handler body.
pub fn irq_exit() {
    if let Some(t) = scheduler::current_thread_opt() {
        thread::interrupt_exited(&t);
    }
    interrupt::leave_interrupt();
}
