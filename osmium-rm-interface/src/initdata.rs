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

//! Shared init-data frame.
//!
//! One page, mapped into both the RM and the PD at a fixed virtual
//! address. Carries the PD's own core caps, the request directory, and
//! friendly type names. The RM owns the authoritative copy and
//! re-serializes it into the frame whenever it changes.

use osmium_os_common::badge::SpaceId;
use osmium_os_common::caps::{CPtr, NULL_CPTR, PAGE_SIZE};
use serde::{Deserialize, Serialize};
use serde_big_array::big_array;
use static_assertions::const_assert;

big_array! { BigArray; }

/// Rows in the request directory, indexed by cap type.
pub const MAX_CAP_TYPES: usize = 16;
/// Entries per row: distinct spaces of one type a PD may request from.
pub const RDE_SLOTS_PER_TYPE: usize = 8;
pub const TYPE_NAME_LEN: usize = 32;
pub const TEST_NAME_LEN: usize = 64;

/// One request-directory entry: "resources of this type/space are
/// requested from this endpoint".
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RdeEntry {
    pub cap_type: u8,
    pub space_id: SpaceId,
    pub server_ep: CPtr,
}

impl RdeEntry {
    pub fn is_valid(&self) -> bool { self.cap_type != 0 }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct InitData {
    pub self_pd_cap: CPtr,
    pub self_ads_cap: CPtr,
    pub self_cpu_cap: CPtr,
    pub fault_ep_cap: CPtr,
    pub cspace_root_cap: CPtr,
    /// For resource servers: where the in-progress request's reply
    /// cap is parked.
    pub reply_cap_slot: CPtr,
    pub rde: [[RdeEntry; RDE_SLOTS_PER_TYPE]; MAX_CAP_TYPES],
    pub type_names: [[u8; TYPE_NAME_LEN]; MAX_CAP_TYPES],
    #[serde(with = "BigArray")]
    pub test_name: [u8; TEST_NAME_LEN],
}

// The whole record must fit the single shared page.
const_assert!(core::mem::size_of::<InitData>() <= PAGE_SIZE);

impl Default for InitData {
    fn default() -> Self {
        InitData {
            self_pd_cap: NULL_CPTR,
            self_ads_cap: NULL_CPTR,
            self_cpu_cap: NULL_CPTR,
            fault_ep_cap: NULL_CPTR,
            cspace_root_cap: NULL_CPTR,
            reply_cap_slot: NULL_CPTR,
            rde: [[RdeEntry::default(); RDE_SLOTS_PER_TYPE]; MAX_CAP_TYPES],
            type_names: [[0u8; TYPE_NAME_LEN]; MAX_CAP_TYPES],
            test_name: [0u8; TEST_NAME_LEN],
        }
    }
}

impl InitData {
    pub fn new() -> Self { Default::default() }

    pub fn set_type_name(&mut self, cap_type: u8, name: &str) {
        if (cap_type as usize) < MAX_CAP_TYPES {
            let row = &mut self.type_names[cap_type as usize];
            row.fill(0);
            let n = name.len().min(TYPE_NAME_LEN - 1);
            row[..n].copy_from_slice(&name.as_bytes()[..n]);
        }
    }

    pub fn type_name(&self, cap_type: u8) -> &str {
        if (cap_type as usize) >= MAX_CAP_TYPES {
            return "";
        }
        let row = &self.type_names[cap_type as usize];
        let end = row.iter().position(|&b| b == 0).unwrap_or(row.len());
        core::str::from_utf8(&row[..end]).unwrap_or("")
    }
}
