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

//! Building extraction subgraphs.
//!
//! A server contributes the part of the system model only it can see:
//! which resources exist in its space, who holds them, and what they
//! map onto. The builder keeps the SUBSET edges consistent so a
//! contribution merges cleanly.

extern crate alloc;
use alloc::vec::Vec;
use osmium_os_common::badge::{CapType, ObjId, PdId, SpaceId};
use osmium_rm_interface::model::{EdgeKind, ModelState, NodeRef, ResId};

pub struct SubgraphBuilder {
    cap_type: CapType,
    space_id: SpaceId,
    space_res: ResId,
    state: ModelState,
}

impl SubgraphBuilder {
    /// Starts a subgraph for one space this server manages. The space
    /// node itself uses the RM's resource-space identity so it merges
    /// with the seed graph.
    pub fn new(cap_type: CapType, space_id: SpaceId, resspc_space: SpaceId) -> Self {
        let space_res = ResId::new(CapType::Resspc, resspc_space, space_id as ObjId);
        let mut state = ModelState::new();
        state.add_resource(space_res);
        SubgraphBuilder {
            cap_type,
            space_id,
            space_res,
            state,
        }
    }

    fn res(&self, object_id: ObjId) -> ResId {
        ResId::new(self.cap_type, self.space_id, object_id)
    }

    /// A resource in this space; SUBSET edge comes for free.
    pub fn add_resource(&mut self, object_id: ObjId) -> &mut Self {
        let res = self.res(object_id);
        self.state.add_resource(res);
        self.state.add_edge(
            EdgeKind::Subset,
            NodeRef::Resource(res),
            NodeRef::Resource(self.space_res),
        );
        self
    }

    /// Records that `holder` has this resource.
    pub fn add_holder(&mut self, object_id: ObjId, holder: PdId) -> &mut Self {
        self.add_resource(object_id);
        self.state.add_edge(
            EdgeKind::Hold,
            NodeRef::Pd(holder),
            NodeRef::Resource(self.res(object_id)),
        );
        self
    }

    /// Cross-type derivation: this resource is backed by `targets`
    /// (a file by its blocks).
    pub fn add_map(&mut self, object_id: ObjId, targets: &[ResId]) -> &mut Self {
        self.add_resource(object_id);
        for target in targets {
            self.state.add_resource(*target);
            self.state.add_edge(
                EdgeKind::Map,
                NodeRef::Resource(self.res(object_id)),
                NodeRef::Resource(*target),
            );
        }
        self
    }

    pub fn build(self) -> ModelState { self.state }

    /// Serialized form for handoff in a memory object.
    pub fn build_bytes(self) -> Result<Vec<u8>, postcard::Error> { self.state.to_bytes() }
}
