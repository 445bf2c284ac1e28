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

//! Keyed, ref-counted object registry.
//!
//! Every component keeps one of these: a map from object id to a node
//! carrying a reference count. When `dec` brings the count to zero, or
//! `delete` forces the issue, the node is taken out of the registry and
//! handed back to the caller for destruction. The node is gone from the
//! map before destruction starts, so a re-entrant `dec`/`delete` on the
//! same id during cascade is a no-op.

extern crate alloc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use log::warn;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// No free ids left below the registry's ceiling.
    OutOfIds,
    /// `insert_with_id` would overwrite a live node.
    DuplicateId,
    NotFound,
}

/// Outcome of a `dec`.
#[derive(Debug)]
pub enum DecOutcome<T> {
    /// Refcount still positive; the node lives on.
    Live(usize),
    /// Refcount hit zero; the node was removed and must be destroyed
    /// by the caller.
    Destroyed(T),
    /// Unknown id (possibly already being destroyed).
    NotFound,
}

struct RegistryNode<T> {
    entry: T,
    refcount: usize,
}

/// Registry keyed by a 64-bit id. Components key by object id; the PD
/// hold registry keys by the resource part of a badge.
pub struct ResourceRegistry<T> {
    nodes: HashMap<u64, RegistryNode<T>>,
    // Ids are assigned from a monotonic counter, wrapping into a
    // free-list of returned ids only when the counter hits the ceiling.
    next_id: u64,
    max_id: u64,
    free_ids: Vec<u64>,
}

impl<T> ResourceRegistry<T> {
    /// Creates a registry whose assigned ids stay in `1..=max_id`.
    pub fn new(max_id: u64) -> Self {
        ResourceRegistry {
            nodes: HashMap::new(),
            next_id: 1,
            max_id,
            free_ids: Vec::new(),
        }
    }

    fn alloc_id(&mut self) -> Option<u64> {
        if self.next_id <= self.max_id {
            let id = self.next_id;
            self.next_id += 1;
            Some(id)
        } else {
            self.free_ids.pop()
        }
    }

    /// Inserts with a caller-chosen id (refcount starts at 1).
    pub fn insert_with_id(&mut self, id: u64, entry: T) -> Result<(), RegistryError> {
        if self.nodes.contains_key(&id) {
            return Err(RegistryError::DuplicateId);
        }
        self.nodes.insert(
            id,
            RegistryNode {
                entry,
                refcount: 1,
            },
        );
        Ok(())
    }

    /// Inserts at the next free id and returns it (refcount starts at 1).
    pub fn insert_new(&mut self, entry: T) -> Result<u64, RegistryError> {
        let id = self.alloc_id().ok_or(RegistryError::OutOfIds)?;
        debug_assert!(!self.nodes.contains_key(&id));
        self.nodes.insert(
            id,
            RegistryNode {
                entry,
                refcount: 1,
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Option<&T> { self.nodes.get(&id).map(|n| &n.entry) }
    pub fn get_mut(&mut self, id: u64) -> Option<&mut T> {
        self.nodes.get_mut(&id).map(|n| &mut n.entry)
    }
    pub fn contains(&self, id: u64) -> bool { self.nodes.contains_key(&id) }
    pub fn refcount(&self, id: u64) -> Option<usize> { self.nodes.get(&id).map(|n| n.refcount) }
    pub fn len(&self) -> usize { self.nodes.len() }
    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn inc(&mut self, id: u64) -> Result<usize, RegistryError> {
        let node = self.nodes.get_mut(&id).ok_or(RegistryError::NotFound)?;
        node.refcount += 1;
        Ok(node.refcount)
    }

    /// Drops one reference. At zero the node is removed and returned
    /// for destruction; destruction must not be skipped.
    #[must_use = "a Destroyed node must be torn down by the caller"]
    pub fn dec(&mut self, id: u64) -> DecOutcome<T> {
        match self.nodes.get_mut(&id) {
            None => DecOutcome::NotFound,
            Some(node) if node.refcount > 1 => {
                node.refcount -= 1;
                DecOutcome::Live(node.refcount)
            }
            Some(_) => {
                let node = self.nodes.remove(&id).unwrap();
                self.free_ids.push(id);
                DecOutcome::Destroyed(node.entry)
            }
        }
    }

    /// Force-removes a node regardless of refcount; the destruction
    /// obligation passes to the caller. No-op on an unknown id.
    pub fn delete(&mut self, id: u64) -> Option<T> {
        match self.nodes.remove(&id) {
            Some(node) => {
                if node.refcount > 1 {
                    warn!("delete of id {} with refcount {}", id, node.refcount);
                }
                self.free_ids.push(id);
                Some(node.entry)
            }
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.nodes.iter().map(|(id, n)| (*id, &n.entry))
    }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut T)> {
        self.nodes.iter_mut().map(|(id, n)| (*id, &mut n.entry))
    }

    /// Snapshot of live ids; useful when mutation happens mid-walk.
    pub fn ids(&self) -> Vec<u64> { self.nodes.keys().copied().collect() }

    /// Removes every node, returning them for destruction.
    pub fn drain_all(&mut self) -> Vec<(u64, T)> {
        let drained: Vec<(u64, T)> = self.nodes.drain().map(|(id, n)| (id, n.entry)).collect();
        for (id, _) in &drained {
            self.free_ids.push(*id);
        }
        drained
    }
}
