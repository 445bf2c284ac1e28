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

//! Endpoint component: tracked wrappers around kernel endpoints, used
//! for fault delivery and server listening sockets.

use log::trace;
use osmium_os_common::badge::{Badge, CapType, ObjId, PdId, SpaceId};
use osmium_os_common::caps::{CPtr, CSlot, CapRights, Endpoint, KernelInterface};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::model::ResId;

use crate::component::{Allocation, ComponentCore, RmObject};
use crate::pd::Pd;

pub struct Ep {
    id: ObjId,
    pub raw: Endpoint,
    pub owning_pd: PdId,
}

impl RmObject for Ep {
    fn id(&self) -> ObjId { self.id }
    fn set_id(&mut self, id: ObjId) { self.id = id }
}

pub struct EpComponent {
    pub(crate) core: ComponentCore<Ep>,
}

impl EpComponent {
    pub fn new(space_id: SpaceId) -> Self {
        EpComponent {
            core: ComponentCore::new(CapType::Ep, space_id),
        }
    }

    /// Allocates a tracked endpoint. Besides the badged tracking cap,
    /// the raw endpoint lands in the owner's cspace so it can be
    /// listened on. Returns (allocation, raw slot).
    pub fn alloc(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        owner: &mut Pd,
        owner_pd_id: PdId,
    ) -> Result<(Allocation, CPtr), RmError> {
        let allocation = self.core.allocate(
            kernel,
            listen_ep,
            Some(owner),
            owner_pd_id,
            false,
            |kernel| {
                Ok(Ep {
                    id: 0,
                    raw: kernel.create_endpoint()?,
                    owning_pd: owner_pd_id,
                })
            },
        )?;
        let raw = self.core.get(allocation.object_id).unwrap().raw;
        let raw_slot = Self::mint_raw(kernel, owner, raw, 0)?;
        Ok((allocation, raw_slot))
    }

    fn mint_raw(
        kernel: &mut dyn KernelInterface,
        target: &mut Pd,
        raw: Endpoint,
        badge_value: u64,
    ) -> Result<CPtr, RmError> {
        let slot = target.next_slot()?;
        if let Err(e) = kernel.mint_badged_endpoint(
            CSlot::new(target.cspace, slot),
            raw,
            badge_value,
            CapRights::RW | CapRights::GRANT,
        ) {
            target.free_slot(slot);
            return Err(e.into());
        }
        Ok(slot)
    }

    /// Places the raw endpoint in `target`'s cspace.
    pub fn get_raw_endpoint(
        &mut self,
        kernel: &mut dyn KernelInterface,
        ep_id: ObjId,
        target: &mut Pd,
    ) -> Result<CPtr, RmError> {
        let raw = self.core.get(ep_id).ok_or(RmError::NotFound)?.raw;
        Self::mint_raw(kernel, target, raw, 0)
    }

    /// Mints a badged copy of the endpoint into `target` and registers
    /// it as a held resource there.
    pub fn badge(
        &mut self,
        kernel: &mut dyn KernelInterface,
        ep_id: ObjId,
        badge_value: u64,
        target: &mut Pd,
    ) -> Result<CPtr, RmError> {
        let raw = self.core.get(ep_id).ok_or(RmError::NotFound)?.raw;
        let slot = Self::mint_raw(kernel, target, raw, badge_value)?;
        self.core.inc(ep_id)?;
        target.add_resource(
            ResId::new(CapType::Ep, self.core.space_id(), ep_id),
            slot,
        );
        trace!("ep {} badged {:#x} into pd {}", ep_id, badge_value, target.pd_id());
        Ok(slot)
    }

    /// Wraps an existing raw endpoint; reserved for trusted setup.
    pub fn forge(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        owner: Option<&mut Pd>,
        owner_pd_id: PdId,
        raw: Endpoint,
    ) -> Result<Allocation, RmError> {
        self.core
            .allocate(kernel, listen_ep, owner, owner_pd_id, false, |_| {
                Ok(Ep {
                    id: 0,
                    raw,
                    owning_pd: owner_pd_id,
                })
            })
    }

    /// Destroys the kernel endpoint once the last reference is gone.
    pub fn release(&mut self, kernel: &mut dyn KernelInterface, ep: Ep) {
        trace!("ep {} release", ep.id);
        let _ = kernel.destroy_endpoint(ep.raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeKernel;

    #[test]
    fn test_alloc_places_raw_and_tracked_caps() {
        let mut kernel = FakeKernel::new();
        let listen = kernel.create_endpoint().unwrap();
        let mut pd = Pd::new(&mut kernel, None).unwrap();
        pd.set_id(1);
        let mut ep = EpComponent::new(5);

        let (alloc, raw_slot) = ep.alloc(&mut kernel, listen, &mut pd, 1).unwrap();
        assert_ne!(alloc.slot.unwrap(), raw_slot);
        assert!(pd.holds_resource(&ResId::new(CapType::Ep, 5, alloc.object_id)));

        // The raw endpoint cap is unbadged; the tracking cap carries
        // the compact id and points at the RM.
        let raw_cap = kernel.cap_at(CSlot::new(pd.cspace, raw_slot)).unwrap();
        assert_eq!(raw_cap.badge, 0);
        let tracked = kernel
            .cap_at(CSlot::new(pd.cspace, alloc.slot.unwrap()))
            .unwrap();
        assert_eq!(tracked.target, listen);
        assert_eq!(tracked.badge, alloc.badge.raw());

        let badge = Badge::new(CapType::Ep, 5, alloc.object_id, 1).unwrap();
        assert!(ep.core.get_by_badge(badge).is_ok());
    }

    #[test]
    fn test_badge_into_target_takes_ref() {
        let mut kernel = FakeKernel::new();
        let listen = kernel.create_endpoint().unwrap();
        let mut owner = Pd::new(&mut kernel, None).unwrap();
        owner.set_id(1);
        let mut target = Pd::new(&mut kernel, None).unwrap();
        target.set_id(2);
        let mut ep = EpComponent::new(5);

        let (alloc, _) = ep.alloc(&mut kernel, listen, &mut owner, 1).unwrap();
        ep.badge(&mut kernel, alloc.object_id, 0xbeef, &mut target)
            .unwrap();
        assert_eq!(ep.core.refcount(alloc.object_id), Some(2));
        assert!(target.holds_resource(&ResId::new(CapType::Ep, 5, alloc.object_id)));
    }
}
