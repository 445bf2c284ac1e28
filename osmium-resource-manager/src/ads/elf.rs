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

//! ELF image loading.
//!
//! Each PT_LOAD segment lands in its own reservation with rights
//! derived from the program-header flags. Where page-rounded segments
//! share a page, the page belongs to the segment with the broader
//! rights. Segment bytes are copied through an RM-side mapping of the
//! backing frames, then the cache is cleaned per page.

extern crate alloc;
use alloc::vec::Vec;
use log::trace;
use osmium_os_common::badge::{ObjId, PdId};
use osmium_os_common::caps::{CapRights, Endpoint, KernelInterface, PAGE_BITS, PAGE_SIZE};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::message::VmrType;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use crate::ads::AdsComponent;
use crate::mo::MoComponent;
use crate::pd::Pd;

struct Segment {
    vstart: usize,
    mem_size: usize,
    file_offset: usize,
    file_size: usize,
    rights: CapRights,
}

impl Segment {
    fn page_start(&self) -> usize { self.vstart & !(PAGE_SIZE - 1) }
    fn page_end(&self) -> usize { (self.vstart + self.mem_size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1) }
}

struct LoadRange {
    page_start: usize,
    page_end: usize,
    rights: CapRights,
    mo_id: ObjId,
}

fn rights_of(flags: xmas_elf::program::Flags) -> CapRights {
    let mut rights = CapRights::empty();
    if flags.is_read() {
        rights |= CapRights::READ;
    }
    if flags.is_write() {
        rights |= CapRights::WRITE;
    }
    if flags.is_execute() {
        rights |= CapRights::EXECUTE;
    }
    rights
}

/// `a` is strictly broader than `b` when it grants everything `b`
/// does and more.
fn broader(a: CapRights, b: CapRights) -> bool { a.contains(b) && a != b }

/// Loads `image` into `ads_id` on behalf of `pd` (which becomes the
/// owner of the backing MOs). Returns the image entry point.
pub fn load_elf(
    kernel: &mut dyn KernelInterface,
    ads_component: &mut AdsComponent,
    mo_component: &mut MoComponent,
    listen_ep: Endpoint,
    ads_id: ObjId,
    pd: &mut Pd,
    pd_id: PdId,
    image: &[u8],
) -> Result<usize, RmError> {
    let elf = ElfFile::new(image).map_err(|_| RmError::InvalidState)?;

    let mut segments: Vec<Segment> = Vec::new();
    for ph in elf.program_iter() {
        if ph.get_type() != Ok(Type::Load) || ph.mem_size() == 0 {
            continue;
        }
        segments.push(Segment {
            vstart: ph.virtual_addr() as usize,
            mem_size: ph.mem_size() as usize,
            file_offset: ph.offset() as usize,
            file_size: ph.file_size() as usize,
            rights: rights_of(ph.flags()),
        });
    }
    if segments.is_empty() {
        return Err(RmError::InvalidState);
    }
    segments.sort_by_key(|s| s.vstart);

    // Page-round segments into load ranges, resolving shared pages in
    // favor of the broader-rights segment.
    let mut ranges: Vec<(usize, usize, CapRights)> = Vec::new();
    for seg in &segments {
        let mut start = seg.page_start();
        let end = seg.page_end();
        if let Some(prev) = ranges.last_mut() {
            if prev.1 > start {
                if broader(seg.rights, prev.2) {
                    // The shared page moves to this segment.
                    prev.1 -= PAGE_SIZE;
                } else {
                    start = prev.1;
                }
            }
        }
        if start < end {
            ranges.push((start, end, seg.rights));
        }
    }

    // Reserve + back each range.
    let mut load_ranges: Vec<LoadRange> = Vec::new();
    for (start, end, rights) in ranges {
        if start >= end {
            // Rounded away entirely by a broader neighbor.
            continue;
        }
        let num_pages = (end - start) >> PAGE_BITS;
        let vmr_type = if rights.contains(CapRights::EXECUTE) {
            VmrType::Code
        } else {
            VmrType::Data
        };
        ads_component.reserve(
            ads_id,
            Some(start),
            num_pages,
            PAGE_BITS,
            vmr_type,
            rights,
            true,
        )?;
        let mo = mo_component.alloc(
            kernel,
            listen_ep,
            Some(&mut *pd),
            pd_id,
            num_pages,
            PAGE_BITS,
        )?;
        ads_component.attach(
            kernel,
            mo_component,
            ads_id,
            mo.object_id,
            Some(start),
            0,
            rights,
        )?;
        load_ranges.push(LoadRange {
            page_start: start,
            page_end: end,
            rights,
            mo_id: mo.object_id,
        });
    }

    // Copy file bytes page by page into whichever range owns the page.
    for seg in &segments {
        let copy_end = seg.vstart + seg.file_size;
        let mut page = seg.page_start();
        while page < seg.page_end() {
            let owner = load_ranges
                .iter()
                .find(|r| r.page_start <= page && page < r.page_end);
            if let Some(range) = owner {
                let lo = core::cmp::max(page, seg.vstart);
                let hi = core::cmp::min(page + PAGE_SIZE, copy_end);
                if lo < hi {
                    let frame_index = (page - range.page_start) >> PAGE_BITS;
                    let src = &image
                        [seg.file_offset + (lo - seg.vstart)..seg.file_offset + (hi - seg.vstart)];
                    let mo = mo_component
                        .core
                        .get(range.mo_id)
                        .ok_or(RmError::UnknownError)?;
                    let frame = mo.frames[frame_index];
                    let dst_off = lo - page;
                    kernel.with_frame_mut(frame, &mut |data| {
                        data[dst_off..dst_off + src.len()].copy_from_slice(src);
                    })?;
                }
            }
            page += PAGE_SIZE;
        }
    }

    // Cache maintenance, per page, after copy.
    let vspace = ads_component
        .core
        .get(ads_id)
        .ok_or(RmError::NotFound)?
        .vspace;
    for range in &load_ranges {
        let mut page = range.page_start;
        while page < range.page_end {
            kernel.clean_cache(vspace, page, PAGE_SIZE)?;
            page += PAGE_SIZE;
        }
        trace!(
            "elf range [{:#x}, {:#x}) rights {:?}",
            range.page_start,
            range.page_end,
            range.rights
        );
    }

    Ok(elf.header.pt2.entry_point() as usize)
}
