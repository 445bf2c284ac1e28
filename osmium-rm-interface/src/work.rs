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

//! Asynchronous work protocol records.
//!
//! The RM enlists untrusted resource servers by queueing work items on
//! their PD and signalling the PD's notification. On wake the server
//! calls `get_work` in a loop until `NoWork`, performs each batch, and
//! acks with `finish_work` (or `send_subgraph` for extraction).

extern crate alloc;
use alloc::vec::Vec;
use osmium_os_common::badge::{ObjId, PdId, SpaceId};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WorkAction {
    /// Queue empty.
    NoWork,
    /// Build a subgraph for the named spaces/objects and return it
    /// via `send_subgraph`.
    Extract,
    /// Drop internal references to the listed resources; the RM has
    /// already done its bookkeeping.
    Free,
    /// Tear down the listed objects or whole spaces.
    Destroy,
    /// Bookkeeping echo after a cross-PD transfer of a server-managed
    /// resource.
    Send,
}

/// One batch of pending work, pulled with `get_work`. `NoWork` means
/// the queues are empty and the id lists are empty too.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkReply {
    pub action: WorkAction,
    pub object_ids: Vec<ObjId>,
    pub space_ids: Vec<SpaceId>,
    pub pd_ids: Vec<PdId>,
    /// How many of the batched items are critical; the server must
    /// report this count back through `finish_work` so deferred
    /// replies can be released.
    pub n_critical: usize,
}

impl WorkReply {
    pub fn none() -> Self {
        WorkReply {
            action: WorkAction::NoWork,
            object_ids: Vec::new(),
            space_ids: Vec::new(),
            pd_ids: Vec::new(),
            n_critical: 0,
        }
    }
}
