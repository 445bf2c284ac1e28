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

//! Request/response records for the Resource Manager endpoint.
//!
//! The outer [`RmRequest`] variant is the component magic; each inner
//! enum is the operation discriminator. Capability arguments (an MO to
//! attach, an ADS to rebind to, a child PD to link) do not appear in
//! the records: they travel as capabilities beside the message and the
//! kernel unwraps them to badges for the RM.

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;
use osmium_os_common::badge::{CapType, ObjId, PdId, SpaceId};
use osmium_os_common::caps::{CPtr, UserContext};
use serde::{Deserialize, Serialize};

use crate::error::RmError;
use crate::work::{WorkAction, WorkReply};

/// What a virtual memory reservation is for. Mostly descriptive; the
/// ELF loader and runtime setup use it to find special ranges.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum VmrType {
    Generic,
    Code,
    Data,
    Stack,
    IpcBuffer,
    InitData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MoRequest {
    /// Allocate frames; the only way to obtain memory.
    Alloc { num_pages: usize, page_bits: u8 },
    /// Obtain a badged cap to an existing MO.
    Connect { object_id: ObjId },
    /// Drop one reference.
    Disconnect,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AdsRequest {
    Alloc,
    /// Reserve a range of virtual memory; `vaddr: None` lets the ADS
    /// choose. The reservation is named by its start address.
    Reserve {
        vaddr: Option<usize>,
        num_pages: usize,
        page_bits: u8,
        vmr_type: VmrType,
        rights: u8,
        cacheable: bool,
    },
    /// Attach the MO sent alongside; reserve-and-attach in one step
    /// when `vmr_vaddr` is absent.
    Attach {
        vmr_vaddr: Option<usize>,
        offset: usize,
        rights: u8,
    },
    /// Unmap and drop the reservation starting at `vaddr`.
    Remove { vaddr: usize },
    /// New ADS with this one's reservations (minus `omit_vaddr`),
    /// sharing the backing MOs.
    ShallowCopy { omit_vaddr: Option<usize> },
    /// Load the ELF image contained in the MO sent alongside into
    /// this ADS, on behalf of the PD sent alongside.
    LoadElf { image_len: usize },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CpuRequest {
    Alloc,
    /// Bind ADS + PD cspace + fault EP + IPC buffer MO (all sent
    /// alongside) into a runnable configuration.
    Configure {
        cnode_guard: usize,
        priority: u8,
        ipc_buf_vaddr: usize,
    },
    SetTlsBase { tls_base: usize },
    WriteRegisters { regs: UserContext, resume: bool },
    ReadRegisters,
    Start,
    Stop,
    Resume,
    /// Atomically rebind to the ADS sent alongside.
    ChangeVspace,
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    InjectIrq { irq: u32 },
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    AckVppi { irq: u32 },
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    ReadVcpuRegs,
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    Elevate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EpRequest {
    /// Allocate a tracked endpoint; the raw endpoint cap is placed in
    /// the caller's cspace too.
    Alloc,
    Disconnect,
    /// Place the raw endpoint in the target PD's cspace (the caller's
    /// own when absent).
    GetRawEndpoint { target_pd: Option<PdId> },
    /// Mint a badged copy into a target PD and register it as held.
    Badge { badge_value: u64, target_pd: PdId },
    /// Wrap an existing raw endpoint (trusted root-task setup only).
    Forge { raw: usize },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResspcRequest {
    /// Register a new resource space for a user-defined type. The
    /// server's listen endpoint is sent alongside. A fresh cap type is
    /// assigned when `cap_type` is `None`.
    Alloc {
        type_name: String,
        cap_type: Option<u8>,
        /// Space whose resources this space's resources map onto
        /// (files -> blocks); fixed for the space's lifetime.
        map_space_id: Option<SpaceId>,
    },
    /// Destroy the space, cascading per the cleanup policy.
    Delete,
    /// Register `object_id` as existing in this space (server-side
    /// creation of a resource).
    CreateResource { object_id: ObjId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PdRequest {
    /// Create a PD; its shared init-data MO is sent alongside.
    Alloc,
    NextSlot,
    FreeSlot { slot: CPtr },
    ClearSlot { slot: CPtr },
    /// Transfer the cap sent alongside into this PD.
    SendCap { is_core_cap: bool },
    /// Whole-system model extraction.
    Dump,
    ShareRde { cap_type: u8, space_id: SpaceId },
    RemoveRde { cap_type: u8, space_id: SpaceId },
    /// Server placing a minted resource cap into a client.
    GiveResource {
        recipient_pd: PdId,
        space_id: SpaceId,
        object_id: ObjId,
    },
    Exit { exit_code: i32 },
    /// Destroy this PD, triggering the cleanup cascade.
    Terminate,
    /// Pull the next pending work batch.
    GetWork,
    /// Extraction reply; the subgraph MO is sent alongside when
    /// `has_data`.
    SendSubgraph { has_data: bool, n_requests: usize },
    /// Ack for FREE/DESTROY/SEND work.
    FinishWork {
        work_type: WorkAction,
        n_critical: usize,
    },
    /// Attach the PD sent alongside as a child whose lifetime is
    /// bounded by this PD.
    LinkChild,
    /// Prepare argv/TLS/IPC-buffer pointers and register state for
    /// first dispatch. ADS and CPU are sent alongside.
    RuntimeSetup {
        args: Vec<usize>,
        stack_top: usize,
        entry_point: usize,
        ipc_buf_vaddr: usize,
        init_data_vaddr: usize,
    },
    /// Image name, for model extraction.
    SetName { name: String },
}

/// Top-level request. The variant is the component magic word; it must
/// agree with the badge's cap type or the RM answers `WrongType`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RmRequest {
    Pd(PdRequest),
    Ads(AdsRequest),
    Mo(MoRequest),
    Cpu(CpuRequest),
    Ep(EpRequest),
    Resspc(ResspcRequest),
}

impl RmRequest {
    pub fn component(&self) -> CapType {
        match self {
            RmRequest::Pd(_) => CapType::Pd,
            RmRequest::Ads(_) => CapType::Ads,
            RmRequest::Mo(_) => CapType::Mo,
            RmRequest::Cpu(_) => CapType::Cpu,
            RmRequest::Ep(_) => CapType::Ep,
            RmRequest::Resspc(_) => CapType::Resspc,
        }
    }
}

/// Response payloads. `errorCode` lives in [`RmReply`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplyBody {
    None,
    /// A new object: its identity plus the cspace slot the badged cap
    /// landed in.
    Allocated {
        object_id: ObjId,
        space_id: SpaceId,
        slot: CPtr,
    },
    Slot { slot: CPtr },
    /// A new endpoint: the tracking cap plus the raw endpoint cap.
    EpAllocated {
        object_id: ObjId,
        slot: CPtr,
        raw_slot: CPtr,
    },
    Vaddr { vaddr: usize },
    Registers { regs: UserContext },
    Work(WorkReply),
    /// Extraction finished: summary counts plus the MO holding the
    /// serialized graph, placed in the caller's cspace.
    Model {
        num_pds: usize,
        num_resources: usize,
        num_edges: usize,
        mo_slot: CPtr,
    },
    SpaceCreated {
        space_id: SpaceId,
        cap_type: u8,
        slot: CPtr,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RmReply {
    pub error: RmError,
    pub body: ReplyBody,
}

impl RmReply {
    pub fn success(body: ReplyBody) -> Self {
        RmReply {
            error: RmError::Success,
            body,
        }
    }

    pub fn failure(error: RmError) -> Self {
        RmReply {
            error,
            body: ReplyBody::None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        postcard::to_allocvec(self).unwrap_or_else(|_| {
            postcard::to_allocvec(&RmReply::failure(RmError::SerializeFailed)).unwrap()
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<RmReply, RmError> {
        postcard::from_bytes(bytes).map_err(|_| RmError::DeserializeFailed)
    }
}
