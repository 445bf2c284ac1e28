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

//! Support library for user-space resource servers.
//!
//! A resource server registers a space with the Resource Manager,
//! serves client requests on its own endpoint, and participates in
//! the RM's asynchronous work protocol: when the RM rings the server's
//! notification the server drains `get_work` until `NoWork`, performs
//! each batch (EXTRACT / FREE / DESTROY / SEND), and acks so deferred
//! RM replies can fire. The IPC glue is abstracted behind
//! [`RmConnection`] so servers can be exercised on a host.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod subgraph;
pub mod workloop;

pub use subgraph::SubgraphBuilder;
pub use workloop::{process_pending_work, ResourceServerInterface, RmConnection};
