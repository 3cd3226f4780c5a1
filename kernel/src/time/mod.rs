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

//! Deadline-ordered timers over pluggable hardware backends.

pub mod timer;

pub use timer::{TimerId, TimerService, TIMER_ID_INVALID};

use crate::error::Result;

/// A hardware one-shot timer driver. Registered at runtime; the
/// service switches to a newly registered backend only when it is
/// strictly more precise than the current one.
///
/// `schedule` arms a single one-shot: the driver's interrupt handler
/// must call [`handle_fire`] (or the owning service's `handle_fire`).
pub trait TimerBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn precision_ns(&self) -> u64;
    fn schedule(&self, delay_ns: u64);
    fn cancel(&self);
    /// Free-running counter value; only deltas are meaningful.
    fn timestamp(&self) -> u64;
    fn delta_to_ns(&self, start: u64, end: u64) -> u64;
}

pub(crate) static TIMERS: TimerService = TimerService::new();

/// The kernel-wide timer service.
pub fn default_service() -> &'static TimerService {
    &TIMERS
}

pub fn register_backend(b: &'static dyn TimerBackend) -> Result {
    TIMERS.register_backend(b)
}

/// Schedules `cb` to run once, at least `delay_ns` from now.
pub fn oneshot(delay_ns: u64, cb: impl Fn() + Send + Sync + 'static) -> Result<TimerId> {
    TIMERS.oneshot(delay_ns, cb)
}

/// Disables a pending timer; its callback will never run.
pub fn cancel(id: TimerId) -> Result {
    TIMERS.cancel(id)
}

/// Monotonic nanoseconds since the first backend registration.
pub fn now_ns() -> u64 {
    TIMERS.now_ns()
}

/// Entry point for the active backend's interrupt handler.
pub fn handle_fire() {
    TIMERS.handle_fire()
}
