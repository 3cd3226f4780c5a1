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

/// Maps an intrusive link embedded in `T` back to `T`. One adapter type
/// exists per (owner, field) pair, so a value can sit on several lists
/// at once without ambiguity.
pub trait Adapter {
    fn offset() -> usize;
}

/// Declares an [`Adapter`] for a named link field.
///
/// ```ignore
/// link_adapter!(ViaRunNode, Work, run_node);
/// ```
#[macro_export]
macro_rules! link_adapter {
    ($name:ident, $ty:ty, $($fields:expr)+) => {
        #[derive(Default, Debug)]
        pub struct $name;
        impl $crate::intrusive::Adapter for $name {
            #[inline]
            fn offset() -> usize {
                core::mem::offset_of!($ty, $($fields)+)
            }
        }
    }
}
