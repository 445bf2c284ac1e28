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

//! Generic machinery shared by every resource component.
//!
//! Each concrete component (MO, ADS, CPU, EP, PD, resource-space)
//! wraps a [`ComponentCore`]: its cap type, its default space id, and
//! a ref-counted registry of live objects. Allocation inserts a new
//! object and mints a badged capability pointing at the RM's listen
//! endpoint so the owner can invoke it; dispatch on an incoming badge
//! resolves the object by id.

extern crate alloc;
use alloc::vec::Vec;
use log::trace;
use osmium_os_common::badge::{Badge, CapType, ObjId, PdId, SpaceId, MAX_OBJ_ID};
use osmium_os_common::caps::{CPtr, Endpoint, KernelInterface};
use osmium_os_common::registry::{DecOutcome, ResourceRegistry};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::model::ResId;

use crate::pd::Pd;

/// Implemented by every object a component manages.
pub trait RmObject {
    fn id(&self) -> ObjId;
    fn set_id(&mut self, id: ObjId);
}

/// Result of an allocation: the new object's identity plus, unless the
/// allocation was forge-only, the cspace slot of the badged cap minted
/// into the owner.
#[derive(Copy, Clone, Debug)]
pub struct Allocation {
    pub object_id: ObjId,
    pub badge: Badge,
    pub slot: Option<CPtr>,
}

pub struct ComponentCore<T> {
    cap_type: CapType,
    space_id: SpaceId,
    registry: ResourceRegistry<T>,
}

impl<T: RmObject> ComponentCore<T> {
    pub fn new(cap_type: CapType, space_id: SpaceId) -> Self {
        Self::with_max_id(cap_type, space_id, MAX_OBJ_ID as u64)
    }

    /// For components whose ids must fit a narrower field than the
    /// badge's object id (resource spaces).
    pub fn with_max_id(cap_type: CapType, space_id: SpaceId, max_id: u64) -> Self {
        ComponentCore {
            cap_type,
            space_id,
            registry: ResourceRegistry::new(max_id),
        }
    }

    pub fn cap_type(&self) -> CapType { self.cap_type }
    pub fn space_id(&self) -> SpaceId { self.space_id }

    /// Creates a new object via `construct`, registers it, and (unless
    /// `forge_only`) mints a badged cap into `owner`'s cspace and
    /// records the hold. `owner` is `None` only while forging the
    /// root-task PD at boot.
    pub fn allocate<F>(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        owner: Option<&mut Pd>,
        owner_pd_id: PdId,
        forge_only: bool,
        construct: F,
    ) -> Result<Allocation, RmError>
    where
        F: FnOnce(&mut dyn KernelInterface) -> Result<T, RmError>,
    {
        let entry = construct(kernel)?;
        let object_id = self.registry.insert_new(entry)? as ObjId;
        // The object learns its id after registration.
        self.registry
            .get_mut(object_id as u64)
            .unwrap()
            .set_id(object_id);

        let badge = Badge::new(self.cap_type, self.space_id, object_id, owner_pd_id)?;
        trace!("allocate {}", badge);

        let slot = match owner {
            Some(pd) if !forge_only => {
                let slot = pd.install_badged_cap(kernel, listen_ep, badge)?;
                pd.add_resource(
                    ResId::new(self.cap_type, self.space_id, object_id),
                    slot,
                );
                Some(slot)
            }
            _ => None,
        };
        Ok(Allocation {
            object_id,
            badge,
            slot,
        })
    }

    pub fn get(&self, id: ObjId) -> Option<&T> { self.registry.get(id as u64) }
    pub fn get_mut(&mut self, id: ObjId) -> Option<&mut T> { self.registry.get_mut(id as u64) }

    /// Resolves an incoming badge to an object, checking the cap type
    /// matches this component.
    pub fn get_by_badge(&self, badge: Badge) -> Result<&T, RmError> {
        if badge.cap_type() != self.cap_type {
            return Err(RmError::WrongType);
        }
        self.get(badge.object_id()).ok_or(RmError::NotFound)
    }

    pub fn get_mut_by_badge(&mut self, badge: Badge) -> Result<&mut T, RmError> {
        if badge.cap_type() != self.cap_type {
            return Err(RmError::WrongType);
        }
        self.get_mut(badge.object_id()).ok_or(RmError::NotFound)
    }

    pub fn contains(&self, id: ObjId) -> bool { self.registry.contains(id as u64) }
    pub fn refcount(&self, id: ObjId) -> Option<usize> { self.registry.refcount(id as u64) }
    pub fn len(&self) -> usize { self.registry.len() }
    pub fn is_empty(&self) -> bool { self.registry.is_empty() }

    pub fn inc(&mut self, id: ObjId) -> Result<(), RmError> {
        self.registry.inc(id as u64)?;
        Ok(())
    }

    /// Drops one reference; at zero the object is removed and returned
    /// so the caller can run the component's destruction.
    #[must_use = "a returned object must be destroyed by the caller"]
    pub fn dec(&mut self, id: ObjId) -> Option<T> {
        match self.registry.dec(id as u64) {
            DecOutcome::Destroyed(entry) => Some(entry),
            DecOutcome::Live(_) | DecOutcome::NotFound => None,
        }
    }

    /// Force-removes an object from the registry regardless of its
    /// refcount.
    pub fn remove(&mut self, id: ObjId) -> Option<T> { self.registry.delete(id as u64) }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> { self.registry.iter() }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut T)> { self.registry.iter_mut() }
    pub fn ids(&self) -> Vec<u64> { self.registry.ids() }
}
