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

//! Osmium OS Resource Manager wire protocol.
//!
//! The RM listens on a single endpoint; requests are postcard-encoded
//! records tagged by component, responses always carry an error code.
//! This crate holds the records, the error codes, the work-protocol
//! messages, the extracted-model graph, and the shared init-data frame
//! layout. It is shared between the RM, resource servers, and clients.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod initdata;
pub mod message;
pub mod model;
pub mod work;

pub use error::RmError;
pub use model::ResId;
