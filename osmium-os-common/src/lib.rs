// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Osmium OS shared plumbing: compact resource identifiers (badges), the
//! kernel interface the Resource Manager is written against, the generic
//! ref-counted resource registry, and the cspace slot allocator.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod badge;
pub mod caps;
pub mod registry;
pub mod slot_allocator;
