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

//! Memory Object component.
//!
//! An MO is a run of physical frames of uniform page size and the only
//! way to obtain memory in the system; stacks, IPC buffers, and shared
//! buffers all go through it. MOs are ref-counted by explicit PD
//! holdings, by ADS attachments, and by CPUs using one as an IPC
//! buffer.

extern crate alloc;
use alloc::vec::Vec;
use log::trace;
use osmium_os_common::badge::{CapType, ObjId, PdId, SpaceId};
use osmium_os_common::caps::{Endpoint, Frame, KernelInterface};
use osmium_rm_interface::error::RmError;
use smallvec::SmallVec;

use crate::component::{Allocation, ComponentCore, RmObject};
use crate::pd::Pd;

pub struct Mo {
    id: ObjId,
    pub owning_pd: PdId,
    pub frames: Vec<Frame>,
    pub page_bits: u8,
    /// Live (ads, vaddr) attachments; each holds one reference.
    pub attachments: SmallVec<[(ObjId, usize); 2]>,
}

impl RmObject for Mo {
    fn id(&self) -> ObjId { self.id }
    fn set_id(&mut self, id: ObjId) { self.id = id }
}

impl Mo {
    pub fn num_pages(&self) -> usize { self.frames.len() }
    pub fn size_bytes(&self) -> usize { self.frames.len() << self.page_bits }

    pub fn add_attachment(&mut self, ads_id: ObjId, vaddr: usize) {
        self.attachments.push((ads_id, vaddr));
    }

    pub fn remove_attachment(&mut self, ads_id: ObjId, vaddr: usize) {
        self.attachments.retain(|a| *a != (ads_id, vaddr));
    }
}

pub struct MoComponent {
    pub(crate) core: ComponentCore<Mo>,
}

impl MoComponent {
    pub fn new(space_id: SpaceId) -> Self {
        MoComponent {
            core: ComponentCore::new(CapType::Mo, space_id),
        }
    }

    /// Allocates `num_pages` frames of `1 << page_bits` bytes each and
    /// registers the MO to `owner`.
    pub fn alloc(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        owner: Option<&mut Pd>,
        owner_pd_id: PdId,
        num_pages: usize,
        page_bits: u8,
    ) -> Result<Allocation, RmError> {
        if num_pages == 0 || page_bits < 12 || page_bits > 30 {
            return Err(RmError::InvalidState);
        }
        trace!("mo alloc {} pages of 2^{}", num_pages, page_bits);
        self.core
            .allocate(kernel, listen_ep, owner, owner_pd_id, false, |kernel| {
                let mut frames = Vec::with_capacity(num_pages);
                for _ in 0..num_pages {
                    match kernel.alloc_frame(page_bits) {
                        Ok(frame) => frames.push(frame),
                        Err(e) => {
                            // Tear down the partial allocation.
                            for frame in frames {
                                let _ = kernel.free_frame(frame);
                            }
                            return Err(e.into());
                        }
                    }
                }
                Ok(Mo {
                    id: 0,
                    owning_pd: owner_pd_id,
                    frames,
                    page_bits,
                    attachments: SmallVec::new(),
                })
            })
    }

    /// Obtains a badged cap to an existing MO for `client`; one more
    /// reference.
    pub fn connect(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        client: &mut Pd,
        client_pd_id: PdId,
        mo_id: ObjId,
    ) -> Result<Allocation, RmError> {
        if !self.core.contains(mo_id) {
            return Err(RmError::NotFound);
        }
        let badge = osmium_os_common::badge::Badge::new(
            CapType::Mo,
            self.core.space_id(),
            mo_id,
            client_pd_id,
        )?;
        let slot = client.install_badged_cap(kernel, listen_ep, badge)?;
        self.core.inc(mo_id)?;
        client.add_resource(
            osmium_rm_interface::model::ResId::new(CapType::Mo, self.core.space_id(), mo_id),
            slot,
        );
        Ok(Allocation {
            object_id: mo_id,
            badge,
            slot: Some(slot),
        })
    }

    /// Frees the frames of an MO whose references are gone. Any
    /// remaining attachments must have been unmapped by the caller.
    pub fn release(&mut self, kernel: &mut dyn KernelInterface, mo: Mo) {
        debug_assert!(mo.attachments.is_empty());
        trace!("mo {} release {} frames", mo.id, mo.frames.len());
        for frame in mo.frames {
            let _ = kernel.free_frame(frame);
        }
    }

    /// Copies `bytes` into the MO's frames starting at offset 0.
    pub fn write_bytes(
        &mut self,
        kernel: &mut dyn KernelInterface,
        mo_id: ObjId,
        bytes: &[u8],
    ) -> Result<(), RmError> {
        let mo = self.core.get(mo_id).ok_or(RmError::NotFound)?;
        if bytes.len() > mo.size_bytes() {
            return Err(RmError::InvalidState);
        }
        let page_size = 1usize << mo.page_bits;
        let frames: Vec<Frame> = mo.frames.clone();
        for (i, frame) in frames.iter().enumerate() {
            let lo = i * page_size;
            if lo >= bytes.len() {
                break;
            }
            let hi = core::cmp::min(lo + page_size, bytes.len());
            kernel.with_frame_mut(*frame, &mut |data| {
                data[..hi - lo].copy_from_slice(&bytes[lo..hi]);
            })?;
        }
        Ok(())
    }

    /// Reads up to `len` bytes out of the MO's frames.
    pub fn read_bytes(
        &mut self,
        kernel: &mut dyn KernelInterface,
        mo_id: ObjId,
        len: usize,
    ) -> Result<Vec<u8>, RmError> {
        let mo = self.core.get(mo_id).ok_or(RmError::NotFound)?;
        if len > mo.size_bytes() {
            return Err(RmError::InvalidState);
        }
        let page_size = 1usize << mo.page_bits;
        let frames: Vec<Frame> = mo.frames.clone();
        let mut out = Vec::with_capacity(len);
        for frame in frames {
            if out.len() >= len {
                break;
            }
            let want = core::cmp::min(page_size, len - out.len());
            kernel.with_frame_mut(frame, &mut |data| {
                out.extend_from_slice(&data[..want]);
            })?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeKernel;

    #[test]
    fn test_alloc_rejects_bad_size() {
        let mut kernel = FakeKernel::new();
        let ep = kernel.create_endpoint().unwrap();
        let mut mo = MoComponent::new(3);
        assert!(mo.alloc(&mut kernel, ep, None, 1, 0, 12).is_err());
        assert!(mo.alloc(&mut kernel, ep, None, 1, 4, 3).is_err());
    }

    #[test]
    fn test_alloc_and_release_frames() {
        let mut kernel = FakeKernel::new();
        let ep = kernel.create_endpoint().unwrap();
        let mut mo = MoComponent::new(3);
        let alloc = mo.alloc(&mut kernel, ep, None, 1, 4, 12).unwrap();
        assert_eq!(kernel.frames_outstanding(), 4);

        let obj = mo.core.dec(alloc.object_id).unwrap();
        mo.release(&mut kernel, obj);
        assert_eq!(kernel.frames_outstanding(), 0);
    }

    #[test]
    fn test_partial_alloc_rolls_back() {
        let mut kernel = FakeKernel::new();
        kernel.set_frame_limit(2);
        let ep = kernel.create_endpoint().unwrap();
        let mut mo = MoComponent::new(3);
        assert_eq!(
            mo.alloc(&mut kernel, ep, None, 1, 4, 12).err(),
            Some(RmError::OutOfMemory)
        );
        // Nothing leaked by the failed allocation.
        assert_eq!(kernel.frames_outstanding(), 0);
    }

    #[test]
    fn test_write_read_bytes() {
        let mut kernel = FakeKernel::new();
        let ep = kernel.create_endpoint().unwrap();
        let mut mo = MoComponent::new(3);
        let alloc = mo.alloc(&mut kernel, ep, None, 1, 2, 12).unwrap();

        let mut payload = alloc::vec![0u8; 5000];
        payload[0] = 0xab;
        payload[4999] = 0xcd;
        mo.write_bytes(&mut kernel, alloc.object_id, &payload).unwrap();
        let back = mo.read_bytes(&mut kernel, alloc.object_id, 5000).unwrap();
        assert_eq!(back[0], 0xab);
        assert_eq!(back[4999], 0xcd);
    }
}
