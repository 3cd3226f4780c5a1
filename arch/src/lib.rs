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

//! Architecture seam of the concurrency core. Every port exposes the
//! same free-function surface:
//!
//! - interrupt mask: `mask_interrupts`, `unmask_interrupts`,
//!   `interrupts_masked`
//! - identity: `current_cpu_id`, `current_sp`
//! - scheduling assists: `spin_hint`, `idle`, `cross_cpu_poke`,
//!   `pend_switch_context`
//! - context switch: [`Context`], `switch_context_with_hook`,
//!   `restore_context_with_hook`
//!
//! The kernel exports `anillo_context_switch_finish` and registers it
//! through [`set_context_switch_finish`]; a port invokes it exactly
//! once per switch, on the incoming stack, with interrupts masked.
//! Ports with assembly switch stubs may instead branch to the symbol
//! directly and keep the registration a no-op.

#![cfg_attr(not(test), no_std)]

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "aarch64", target_os = "none"))] {
        mod aarch64;
        pub use aarch64::*;
    } else {
        mod hosted;
        pub use hosted::*;
    }
}

/// Signature of the kernel's switch-completion entry point.
pub type ContextSwitchFinishFn = unsafe extern "C" fn(*mut core::ffi::c_void);
