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

//! Address Space component.
//!
//! An ADS is an ordered set of non-overlapping virtual memory
//! reservations (VMRs). Reserving carves out a range; attaching backs
//! a reservation with an MO's frames. An unattached reservation faults
//! on access.

pub mod elf;

extern crate alloc;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::trace;
use osmium_os_common::badge::{CapType, ObjId, PdId, SpaceId};
use osmium_os_common::caps::{CapRights, Endpoint, KernelInterface, VSpace};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::message::VmrType;

use crate::component::{Allocation, ComponentCore, RmObject};
use crate::mo::MoComponent;
use crate::pd::Pd;

/// Bottom of the range handed out when the caller does not request a
/// fixed address.
const VMR_FLOATING_BASE: usize = 0x1000_0000;
/// Top of user virtual memory.
const VMR_TOP: usize = 0x7fff_ff00_0000;

#[derive(Clone, Debug)]
pub struct Vmr {
    pub start: usize,
    pub num_pages: usize,
    pub page_bits: u8,
    pub rights: CapRights,
    pub cacheable: bool,
    pub vmr_type: VmrType,
    /// Backing MO, once attached.
    pub mo_id: Option<ObjId>,
    pub mo_offset: usize,
}

impl Vmr {
    pub fn size_bytes(&self) -> usize { self.num_pages << self.page_bits }
    pub fn end(&self) -> usize { self.start + self.size_bytes() }

    /// Pages the attachment actually mapped; an attach at a non-zero
    /// MO offset covers less than the full reservation.
    pub fn mapped_pages(&self, mo_num_pages: usize) -> usize {
        core::cmp::min(
            self.num_pages,
            mo_num_pages.saturating_sub(self.mo_offset >> self.page_bits),
        )
    }
}

pub struct Ads {
    id: ObjId,
    pub vspace: VSpace,
    /// Reservations keyed by start address; a reservation is named by
    /// its start.
    pub vmrs: BTreeMap<usize, Vmr>,
}

impl RmObject for Ads {
    fn id(&self) -> ObjId { self.id }
    fn set_id(&mut self, id: ObjId) { self.id = id }
}

impl Ads {
    pub fn vmr(&self, vaddr: usize) -> Option<&Vmr> { self.vmrs.get(&vaddr) }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.vmrs
            .range(..end)
            .next_back()
            .map_or(false, |(_, vmr)| vmr.end() > start)
    }

    /// First gap large enough for `size` bytes at or above the
    /// floating base.
    fn find_gap(&self, size: usize) -> Option<usize> {
        let mut candidate = VMR_FLOATING_BASE;
        for (_, vmr) in self.vmrs.range(VMR_FLOATING_BASE..) {
            if vmr.start >= candidate + size {
                break;
            }
            candidate = core::cmp::max(candidate, vmr.end());
        }
        if candidate + size <= VMR_TOP {
            Some(candidate)
        } else {
            None
        }
    }

    /// Carves out a reservation; fails `Overlap` on a clash with an
    /// existing range.
    pub fn reserve(
        &mut self,
        vaddr: Option<usize>,
        num_pages: usize,
        page_bits: u8,
        vmr_type: VmrType,
        rights: CapRights,
        cacheable: bool,
    ) -> Result<usize, RmError> {
        if num_pages == 0 {
            return Err(RmError::InvalidState);
        }
        let size = num_pages << page_bits;
        let start = match vaddr {
            Some(addr) => {
                if addr % (1 << page_bits) != 0 {
                    return Err(RmError::InvalidState);
                }
                if self.overlaps(addr, addr + size) {
                    return Err(RmError::Overlap);
                }
                addr
            }
            None => self.find_gap(size).ok_or(RmError::OutOfMemory)?,
        };
        self.vmrs.insert(
            start,
            Vmr {
                start,
                num_pages,
                page_bits,
                rights,
                cacheable,
                vmr_type,
                mo_id: None,
                mo_offset: 0,
            },
        );
        trace!("ads {} reserve [{:#x}, {:#x})", self.id, start, start + size);
        Ok(start)
    }
}

pub struct AdsComponent {
    pub(crate) core: ComponentCore<Ads>,
}

impl AdsComponent {
    pub fn new(space_id: SpaceId) -> Self {
        AdsComponent {
            core: ComponentCore::new(CapType::Ads, space_id),
        }
    }

    pub fn alloc(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        owner: Option<&mut Pd>,
        owner_pd_id: PdId,
    ) -> Result<Allocation, RmError> {
        self.core
            .allocate(kernel, listen_ep, owner, owner_pd_id, false, |kernel| {
                Ok(Ads {
                    id: 0,
                    vspace: kernel.create_vspace()?,
                    vmrs: BTreeMap::new(),
                })
            })
    }

    pub fn reserve(
        &mut self,
        ads_id: ObjId,
        vaddr: Option<usize>,
        num_pages: usize,
        page_bits: u8,
        vmr_type: VmrType,
        rights: CapRights,
        cacheable: bool,
    ) -> Result<usize, RmError> {
        let ads = self.core.get_mut(ads_id).ok_or(RmError::NotFound)?;
        ads.reserve(vaddr, num_pages, page_bits, vmr_type, rights, cacheable)
    }

    /// Associates an MO with a reservation and maps its frames;
    /// reserve-and-attach in one step when `vmr_vaddr` is absent. The
    /// attachment takes one reference on the MO. Returns the mapped
    /// address.
    pub fn attach(
        &mut self,
        kernel: &mut dyn KernelInterface,
        mo_component: &mut MoComponent,
        ads_id: ObjId,
        mo_id: ObjId,
        vmr_vaddr: Option<usize>,
        offset: usize,
        rights: CapRights,
    ) -> Result<usize, RmError> {
        let (page_bits, mo_pages, frames) = {
            let mo = mo_component.core.get(mo_id).ok_or(RmError::NotFound)?;
            (mo.page_bits, mo.num_pages(), mo.frames.clone())
        };
        if offset % (1 << page_bits) != 0 || offset >= mo_pages << page_bits {
            return Err(RmError::InvalidState);
        }
        let map_pages = mo_pages - (offset >> page_bits);

        let ads = self.core.get_mut(ads_id).ok_or(RmError::NotFound)?;
        let start = match vmr_vaddr {
            Some(vaddr) => {
                let vmr = ads.vmrs.get(&vaddr).ok_or(RmError::NotFound)?;
                if vmr.mo_id.is_some() {
                    return Err(RmError::InvalidState);
                }
                if vmr.num_pages < map_pages || vmr.page_bits != page_bits {
                    return Err(RmError::InvalidState);
                }
                vaddr
            }
            None => ads.reserve(
                None,
                map_pages,
                page_bits,
                VmrType::Generic,
                rights,
                true,
            )?,
        };

        let cacheable = ads.vmrs[&start].cacheable;
        let vspace = ads.vspace;
        for (i, frame) in frames
            .iter()
            .skip(offset >> page_bits)
            .take(map_pages)
            .enumerate()
        {
            if let Err(e) =
                kernel.map_frame(vspace, *frame, start + (i << page_bits), rights, cacheable)
            {
                // Partial attach is torn down before returning.
                for j in 0..i {
                    let _ = kernel.unmap_frame(vspace, start + (j << page_bits));
                }
                if vmr_vaddr.is_none() {
                    ads.vmrs.remove(&start);
                }
                return Err(e.into());
            }
        }

        let vmr = ads.vmrs.get_mut(&start).unwrap();
        vmr.mo_id = Some(mo_id);
        vmr.mo_offset = offset;
        vmr.rights = rights;

        mo_component.core.inc(mo_id)?;
        mo_component
            .core
            .get_mut(mo_id)
            .unwrap()
            .add_attachment(ads_id, start);
        trace!("ads {} attach mo {} at {:#x}", ads_id, mo_id, start);
        Ok(start)
    }

    /// Unmaps and removes the reservation starting at `vaddr`. Drops
    /// the attachment's MO reference; if that was the last reference
    /// the MO's frames are freed here.
    pub fn remove(
        &mut self,
        kernel: &mut dyn KernelInterface,
        mo_component: &mut MoComponent,
        ads_id: ObjId,
        vaddr: usize,
    ) -> Result<(), RmError> {
        let ads = self.core.get_mut(ads_id).ok_or(RmError::NotFound)?;
        let vmr = ads.vmrs.remove(&vaddr).ok_or(RmError::NotFound)?;
        if let Some(mo_id) = vmr.mo_id {
            let mapped = mo_component
                .core
                .get(mo_id)
                .map_or(vmr.num_pages, |mo| vmr.mapped_pages(mo.num_pages()));
            for i in 0..mapped {
                let _ = kernel.unmap_frame(ads.vspace, vaddr + (i << vmr.page_bits));
            }
            if let Some(mo) = mo_component.core.get_mut(mo_id) {
                mo.remove_attachment(ads_id, vaddr);
            }
            if let Some(mo) = mo_component.core.dec(mo_id) {
                mo_component.release(kernel, mo);
            }
        }
        Ok(())
    }

    /// New ADS sharing this one's reservations and backing MOs, minus
    /// the reservation at `omit_vaddr`.
    pub fn shallow_copy(
        &mut self,
        kernel: &mut dyn KernelInterface,
        mo_component: &mut MoComponent,
        listen_ep: Endpoint,
        owner: Option<&mut Pd>,
        owner_pd_id: PdId,
        src_ads_id: ObjId,
        omit_vaddr: Option<usize>,
    ) -> Result<Allocation, RmError> {
        let src_vmrs: Vec<Vmr> = {
            let src = self.core.get(src_ads_id).ok_or(RmError::NotFound)?;
            src.vmrs
                .values()
                .filter(|vmr| Some(vmr.start) != omit_vaddr)
                .cloned()
                .collect()
        };

        let alloc = self.alloc(kernel, listen_ep, owner, owner_pd_id)?;
        let new_id = alloc.object_id;
        for vmr in src_vmrs {
            let ads = self.core.get_mut(new_id).unwrap();
            ads.reserve(
                Some(vmr.start),
                vmr.num_pages,
                vmr.page_bits,
                vmr.vmr_type,
                vmr.rights,
                vmr.cacheable,
            )?;
            if let Some(mo_id) = vmr.mo_id {
                self.attach(
                    kernel,
                    mo_component,
                    new_id,
                    mo_id,
                    Some(vmr.start),
                    vmr.mo_offset,
                    vmr.rights,
                )?;
            }
        }
        Ok(alloc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeKernel;

    fn setup() -> (FakeKernel, Endpoint, AdsComponent, MoComponent) {
        let mut kernel = FakeKernel::new();
        let ep = kernel.create_endpoint().unwrap();
        (kernel, ep, AdsComponent::new(2), MoComponent::new(3))
    }

    #[test]
    fn test_reserve_overlap() {
        let (mut kernel, ep, mut ads, _mo) = setup();
        let a = ads.alloc(&mut kernel, ep, None, 1).unwrap();
        ads.reserve(
            a.object_id,
            Some(0x10000),
            4,
            12,
            VmrType::Generic,
            CapRights::RW,
            true,
        )
        .unwrap();
        // A clash anywhere in the page-rounded range is rejected.
        assert_eq!(
            ads.reserve(
                a.object_id,
                Some(0x12000),
                4,
                12,
                VmrType::Generic,
                CapRights::RW,
                true,
            )
            .err(),
            Some(RmError::Overlap)
        );
        // Adjacent is fine.
        ads.reserve(
            a.object_id,
            Some(0x14000),
            1,
            12,
            VmrType::Generic,
            CapRights::RW,
            true,
        )
        .unwrap();
    }

    #[test]
    fn test_attach_remove_restores_range() {
        let (mut kernel, ep, mut ads, mut mo) = setup();
        let a = ads.alloc(&mut kernel, ep, None, 1).unwrap();
        let m = mo.alloc(&mut kernel, ep, None, 1, 2, 12).unwrap();

        ads.reserve(
            a.object_id,
            Some(0x20000),
            2,
            12,
            VmrType::Generic,
            CapRights::RW,
            true,
        )
        .unwrap();
        let vaddr = ads
            .attach(
                &mut kernel,
                &mut mo,
                a.object_id,
                m.object_id,
                Some(0x20000),
                0,
                CapRights::RW,
            )
            .unwrap();
        assert_eq!(vaddr, 0x20000);
        // The attachment holds a reference beyond the creation one.
        assert_eq!(mo.core.refcount(m.object_id), Some(2));

        ads.remove(&mut kernel, &mut mo, a.object_id, vaddr).unwrap();
        assert_eq!(mo.core.refcount(m.object_id), Some(1));
        // The same address is re-reservable.
        ads.reserve(
            a.object_id,
            Some(0x20000),
            2,
            12,
            VmrType::Generic,
            CapRights::RW,
            true,
        )
        .unwrap();
    }

    #[test]
    fn test_attach_without_reservation_picks_gap() {
        let (mut kernel, ep, mut ads, mut mo) = setup();
        let a = ads.alloc(&mut kernel, ep, None, 1).unwrap();
        let m = mo.alloc(&mut kernel, ep, None, 1, 1, 12).unwrap();
        let vaddr = ads
            .attach(
                &mut kernel,
                &mut mo,
                a.object_id,
                m.object_id,
                None,
                0,
                CapRights::RW,
            )
            .unwrap();
        assert!(vaddr >= VMR_FLOATING_BASE);
        assert!(kernel.is_mapped(ads.core.get(a.object_id).unwrap().vspace, vaddr));
    }

    #[test]
    fn test_remove_last_ref_frees_frames() {
        let (mut kernel, ep, mut ads, mut mo) = setup();
        let a = ads.alloc(&mut kernel, ep, None, 1).unwrap();
        let m = mo.alloc(&mut kernel, ep, None, 1, 1, 12).unwrap();
        let vaddr = ads
            .attach(
                &mut kernel,
                &mut mo,
                a.object_id,
                m.object_id,
                None,
                0,
                CapRights::RW,
            )
            .unwrap();
        // Drop the creation reference; the attachment keeps it alive.
        assert!(mo.core.dec(m.object_id).is_none());
        assert_eq!(kernel.frames_outstanding(), 1);

        ads.remove(&mut kernel, &mut mo, a.object_id, vaddr).unwrap();
        assert_eq!(kernel.frames_outstanding(), 0);
        assert!(!mo.core.contains(m.object_id));
    }

    #[test]
    fn test_shallow_copy_shares_mos() {
        let (mut kernel, ep, mut ads, mut mo) = setup();
        let a = ads.alloc(&mut kernel, ep, None, 1).unwrap();
        let m = mo.alloc(&mut kernel, ep, None, 1, 1, 12).unwrap();
        let vaddr = ads
            .attach(
                &mut kernel,
                &mut mo,
                a.object_id,
                m.object_id,
                None,
                0,
                CapRights::RW,
            )
            .unwrap();
        let stack = ads
            .reserve(
                a.object_id,
                Some(0x7000_0000),
                4,
                12,
                VmrType::Stack,
                CapRights::RW,
                true,
            )
            .unwrap();

        let copy = ads
            .shallow_copy(
                &mut kernel,
                &mut mo,
                ep,
                None,
                1,
                a.object_id,
                Some(stack),
            )
            .unwrap();
        let new = ads.core.get(copy.object_id).unwrap();
        assert!(new.vmrs.contains_key(&vaddr));
        assert!(!new.vmrs.contains_key(&stack));
        // Two attachments + the creation reference.
        assert_eq!(mo.core.refcount(m.object_id), Some(3));
    }
}
