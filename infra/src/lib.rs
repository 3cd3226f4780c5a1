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

//! Freestanding building blocks shared by the kernel crates. Nothing
//! here may depend on the scheduler, interrupts or anything beyond
//! plain `alloc`.

#![cfg_attr(not(test), no_std)]

pub mod ilist;
pub mod intrusive;
pub mod shared;
