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

pub use anillo_infra::{
    ilist::Link,
    intrusive::Adapter as IntrusiveAdapter,
    link_adapter,
    shared::{
        Shared as Arc, SharedInner as ArcInner, SharedList as ArcList,
        SharedListIter as ArcListIterator,
    },
};

#[cfg(target_pointer_width = "32")]
mod inner {
    pub type Uint = u32;
    pub type AtomicUint = core::sync::atomic::AtomicU32;
}

#[cfg(target_pointer_width = "64")]
mod inner {
    pub type Uint = usize;
    pub type AtomicUint = core::sync::atomic::AtomicUsize;
}

pub use inner::*;
