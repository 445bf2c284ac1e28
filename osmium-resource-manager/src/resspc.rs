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

//! Resource-Space component.
//!
//! A resource space is a named collection of resources of one type,
//! managed by one PD. Spaces are themselves resources, held by their
//! managing PD, so destroying a space cascades to its members. A space
//! may declare that its resources map onto another space (files ->
//! blocks); the relation is fixed at creation.

extern crate alloc;
use alloc::vec::Vec;
use hashbrown::HashSet;
use log::trace;
use osmium_os_common::badge::{CapType, ObjId, PdId, SpaceId, FIRST_USER_CAP_TYPE};
use osmium_os_common::caps::{Endpoint, KernelInterface};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::initdata::MAX_CAP_TYPES;
use smallstr::SmallString;

use crate::component::{Allocation, ComponentCore, RmObject};
use crate::pd::Pd;

pub const SPACE_NAME_CAPACITY: usize = 32;
pub type SpaceName = SmallString<[u8; SPACE_NAME_CAPACITY]>;

/// Space ids fit the badge's 16-bit field.
const MAX_SPACE_ID: SpaceId = SpaceId::MAX;

pub struct ResourceSpace {
    id: ObjId, // == space id
    pub resource_type: CapType,
    pub type_name: SpaceName,
    pub managing_pd: PdId,
    /// Endpoint clients send requests of this type to. For core
    /// spaces this is the RM's own listen endpoint.
    pub server_ep: Endpoint,
    /// Space whose resources this space's resources map onto.
    pub map_space: Option<SpaceId>,
    /// Members, for server-registered (non-core) spaces; core spaces
    /// enumerate their component registry instead.
    pub members: HashSet<ObjId>,
}

impl RmObject for ResourceSpace {
    fn id(&self) -> ObjId { self.id }
    fn set_id(&mut self, id: ObjId) { self.id = id }
}

impl ResourceSpace {
    pub fn space_id(&self) -> SpaceId { self.id as SpaceId }
}

pub struct SpaceComponent {
    pub(crate) core: ComponentCore<ResourceSpace>,
    /// Next tag for a user-defined resource type.
    next_user_type: u8,
}

impl SpaceComponent {
    pub fn new(space_id: SpaceId) -> Self {
        SpaceComponent {
            core: ComponentCore::with_max_id(CapType::Resspc, space_id, MAX_SPACE_ID as u64),
            next_user_type: FIRST_USER_CAP_TYPE,
        }
    }

    /// Registers a space. A fresh cap type is assigned when `cap_type`
    /// is `None` (a server's first registration of a new type).
    #[allow(clippy::too_many_arguments)]
    pub fn alloc(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        manager: Option<&mut Pd>,
        manager_pd_id: PdId,
        resource_type: Option<CapType>,
        type_name: &str,
        server_ep: Endpoint,
        map_space: Option<SpaceId>,
    ) -> Result<Allocation, RmError> {
        if let Some(target) = map_space {
            if !self.core.contains(target as ObjId) {
                return Err(RmError::NotFound);
            }
        }
        let resource_type = match resource_type {
            Some(t) => t,
            None => {
                if self.next_user_type as usize >= MAX_CAP_TYPES {
                    return Err(RmError::OutOfSlots);
                }
                let t = CapType::from(self.next_user_type);
                self.next_user_type += 1;
                t
            }
        };
        if resource_type == CapType::None {
            return Err(RmError::BadBadge);
        }

        let name = SpaceName::from_str(type_name);
        let alloc = self
            .core
            .allocate(kernel, listen_ep, manager, manager_pd_id, false, |_| {
                Ok(ResourceSpace {
                    id: 0,
                    resource_type,
                    type_name: name,
                    managing_pd: manager_pd_id,
                    server_ep,
                    map_space,
                    members: HashSet::new(),
                })
            })?;
        trace!(
            "space {} registered: type {} managed by pd {}",
            alloc.object_id,
            resource_type,
            manager_pd_id
        );
        Ok(alloc)
    }

    pub fn get(&self, space_id: SpaceId) -> Option<&ResourceSpace> {
        self.core.get(space_id as ObjId)
    }

    pub fn get_mut(&mut self, space_id: SpaceId) -> Option<&mut ResourceSpace> {
        self.core.get_mut(space_id as ObjId)
    }

    /// Registers a member resource created by the managing server.
    pub fn create_resource(
        &mut self,
        space_id: SpaceId,
        object_id: ObjId,
    ) -> Result<(), RmError> {
        let space = self.get_mut(space_id).ok_or(RmError::NotFound)?;
        space.members.insert(object_id);
        Ok(())
    }

    /// Spaces managed by `pd_id`.
    pub fn spaces_managed_by(&self, pd_id: PdId) -> Vec<SpaceId> {
        self.core
            .iter()
            .filter(|(_, s)| s.managing_pd == pd_id)
            .map(|(_, s)| s.space_id())
            .collect()
    }

    /// Spaces whose resources map onto `space_id`; destroying the
    /// target cascades into these.
    pub fn spaces_mapping_onto(&self, space_id: SpaceId) -> Vec<SpaceId> {
        self.core
            .iter()
            .filter(|(_, s)| s.map_space == Some(space_id))
            .map(|(_, s)| s.space_id())
            .collect()
    }

    /// Resolves the resource type tag served by a space.
    pub fn resource_type_of(&self, space_id: SpaceId) -> Option<CapType> {
        self.get(space_id).map(|s| s.resource_type)
    }

    /// The default space of a type: the lowest-numbered live space
    /// serving it.
    pub fn find_default(&self, cap_type: CapType) -> Option<SpaceId> {
        self.core
            .iter()
            .filter(|(_, s)| s.resource_type == cap_type)
            .map(|(id, _)| id as SpaceId)
            .min()
    }
}
