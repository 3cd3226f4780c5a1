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

//! Error kinds surfaced by the concurrency core. Callers near the
//! hardware boundary turn [`Error::TemporaryOutage`] into bounded
//! retries; everything else propagates unchanged. Invariant violations
//! do not come through here, they panic.

use core::num::TryFromIntError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Bad pointer, out-of-range value or illegal state for the call.
    InvalidArgument,
    /// Resource unavailable right now (no memory, no backend).
    TemporaryOutage,
    /// The object is gone; a retained handle can never come back.
    PermanentOutage,
    /// No object with that id.
    NoSuchResource,
    /// The work is pending or running and its flags forbid the call.
    AlreadyInProgress,
    /// The wait ended because the awaited object was cancelled.
    Cancelled,
    /// The wait ended by asynchronous signal delivery.
    Signaled,
    /// The wait ended because its deadline expired.
    Timeout,
    /// Retry the whole operation.
    ShouldRestart,
}

pub type Result<T = ()> = core::result::Result<T, Error>;

impl Error {
    pub fn as_str(&self) -> &'static str {
        match self {
            Error::InvalidArgument => "invalid argument",
            Error::TemporaryOutage => "temporarily unavailable",
            Error::PermanentOutage => "permanently unavailable",
            Error::NoSuchResource => "no such resource",
            Error::AlreadyInProgress => "already in progress",
            Error::Cancelled => "cancelled",
            Error::Signaled => "signaled",
            Error::Timeout => "timed out",
            Error::ShouldRestart => "should restart",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TryFromIntError> for Error {
    fn from(_: TryFromIntError) -> Error {
        Error::InvalidArgument
    }
}

impl From<core::alloc::LayoutError> for Error {
    fn from(_: core::alloc::LayoutError) -> Error {
        Error::TemporaryOutage
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(e: core::convert::Infallible) -> Error {
        match e {}
    }
}
