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

//! The extracted system model: a graph of PDs, resources, and edges.
//!
//! Extraction is distributed; each resource server contributes a
//! subgraph serialized into a memory object and the RM merges them.
//! Nodes are keyed by identity (never by pointer) so a serialized
//! graph is relocatable and merging is a set union.

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashSet;
use log::warn;
use osmium_os_common::badge::{CapType, ObjId, PdId, SpaceId};
use serde::{Deserialize, Serialize};

/// Identity of one resource: which component, which space, which
/// object. The client field of a badge is deliberately absent.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ResId {
    pub cap_type: CapType,
    pub space_id: SpaceId,
    pub object_id: ObjId,
}

impl ResId {
    pub fn new(cap_type: CapType, space_id: SpaceId, object_id: ObjId) -> Self {
        ResId {
            cap_type,
            space_id,
            object_id,
        }
    }

    /// Stable 64-bit key used by hold registries.
    pub fn key(&self) -> u64 {
        u8::from(self.cap_type) as u64
            | (self.space_id as u64) << 8
            | (self.object_id as u64) << 24
    }
}

impl fmt::Display for ResId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.cap_type, self.space_id, self.object_id)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// PD -> resource: the PD has a capability to the resource.
    Hold,
    /// PD -> PD: derived from the request directory.
    Request,
    /// resource -> space: membership.
    Subset,
    /// resource -> resource: cross-type derivation (file -> blocks).
    Map,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum NodeRef {
    Pd(PdId),
    Resource(ResId),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ModelEdge {
    pub kind: EdgeKind,
    pub from: NodeRef,
    pub to: NodeRef,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PdNode {
    pub id: PdId,
    pub name: String,
}

/// Whole-system (or partial, for a subgraph) model state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelState {
    pub pds: Vec<PdNode>,
    pub resources: Vec<ResId>,
    pub edges: Vec<ModelEdge>,
}

impl ModelState {
    pub fn new() -> Self { Default::default() }

    pub fn add_pd(&mut self, id: PdId, name: &str) {
        if !self.pds.iter().any(|p| p.id == id) {
            self.pds.push(PdNode {
                id,
                name: String::from(name),
            });
        }
    }

    pub fn add_resource(&mut self, res: ResId) {
        if !self.resources.contains(&res) {
            self.resources.push(res);
        }
    }

    pub fn add_edge(&mut self, kind: EdgeKind, from: NodeRef, to: NodeRef) {
        let edge = ModelEdge { kind, from, to };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn num_pds(&self) -> usize { self.pds.len() }
    pub fn num_resources(&self) -> usize { self.resources.len() }
    pub fn num_edges(&self) -> usize { self.edges.len() }

    pub fn has_edge(&self, kind: EdgeKind, from: NodeRef, to: NodeRef) -> bool {
        self.edges.contains(&ModelEdge { kind, from, to })
    }

    /// Merges a server-contributed subgraph. Nodes and edges are
    /// de-duplicated by identity. A MAP edge whose source resource
    /// already maps elsewhere contradicts an earlier declaration and
    /// is dropped.
    pub fn merge(&mut self, sub: &ModelState) {
        for pd in &sub.pds {
            self.add_pd(pd.id, &pd.name);
        }
        for res in &sub.resources {
            self.add_resource(*res);
        }
        let mut map_sources: HashSet<NodeRef> = self
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Map)
            .map(|e| e.from)
            .collect();
        for edge in &sub.edges {
            if edge.kind == EdgeKind::Map && map_sources.contains(&edge.from) {
                if !self.edges.contains(edge) {
                    warn!("dropping contradictory MAP edge {:?}", edge);
                }
                continue;
            }
            if edge.kind == EdgeKind::Map {
                map_sources.insert(edge.from);
            }
            self.add_edge(edge.kind, edge.from, edge.to);
        }
    }

    /// Flat relocatable encoding, suitable for handoff in a memory
    /// object. All cross-references are identities, not pointers.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> { postcard::to_allocvec(self) }

    pub fn from_bytes(bytes: &[u8]) -> Result<ModelState, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "model: {} pds, {} resources, {} edges",
            self.num_pds(),
            self.num_resources(),
            self.num_edges()
        )?;
        for pd in &self.pds {
            writeln!(f, "PD,{},{}", pd.id, pd.name)?;
        }
        for res in &self.resources {
            writeln!(f, "RES,{}", res)?;
        }
        for edge in &self.edges {
            let fmt_ref = |r: &NodeRef| match r {
                NodeRef::Pd(id) => alloc::format!("PD_{}", id),
                NodeRef::Resource(res) => alloc::format!("{}", res),
            };
            writeln!(
                f,
                "EDGE,{:?},{},{}",
                edge.kind,
                fmt_ref(&edge.from),
                fmt_ref(&edge.to)
            )?;
        }
        Ok(())
    }
}
