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

//! Osmium OS Resource Manager.
//!
//! A single trusted process that brokers every non-kernel resource:
//! address spaces, CPU contexts, memory objects, processes, endpoints,
//! resource spaces, and user-defined resource types served by
//! untrusted resource servers. The manager is a request/reply server
//! listening on one endpoint; messages arrive tagged with a badge that
//! names both the resource invoked and the invoking process. When a
//! process terminates, a model-driven cascade removes everything it
//! held and, policy permitting, everything that depended on it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ads;
pub mod component;
pub mod config;
pub mod cpu;
pub mod ep;
pub mod mo;
pub mod pd;
pub mod resspc;
pub mod server;
pub mod spawn;

mod cleanup;
mod extraction;

#[cfg(test)]
pub(crate) mod testutil;

pub use server::{BootConfig, ResourceManager};
