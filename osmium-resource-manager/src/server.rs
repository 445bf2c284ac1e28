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

//! The Resource Manager reactor.
//!
//! A single-threaded cooperative server: the component glue blocks in
//! one receive point and feeds each message (sender badge, unwrapped
//! capability badges, payload) to [`ResourceManager::handle_message`].
//! Every mutation happens between a receive and the matching reply.
//! The reply is always sent except when an operation must wait on
//! untrusted servers (termination with critical work, model extraction
//! with outstanding subgraphs, cross-PD resource send); those save the
//! caller's reply capability and release it from `finish_work` /
//! `send_subgraph`.

extern crate alloc;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, info, trace};
use osmium_os_common::badge::{Badge, CapType, ObjId, PdId, SpaceId, NULL_OBJ, NULL_SPACE};
use osmium_os_common::caps::{
    CSlot, CapRights, Endpoint, KernelInterface, ReplyCap, UserContext,
};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::message::*;
use osmium_rm_interface::model::{ModelState, ResId};
use osmium_rm_interface::work::WorkAction;
use spin::Mutex;

use crate::ads::{elf, AdsComponent};
use crate::config::{CleanupPolicy, CLEANUP_PD_DEPTH, CLEANUP_POLICY};
use crate::cpu::CpuComponent;
use crate::ep::EpComponent;
use crate::mo::MoComponent;
use crate::pd::work::WorkEntry;
use crate::pd::{PdComponent, PdState};
use crate::resspc::SpaceComponent;

// Well-known spaces for the built-in components, created at boot in
// this order.
pub const PD_SPACE_ID: SpaceId = 1;
pub const ADS_SPACE_ID: SpaceId = 2;
pub const MO_SPACE_ID: SpaceId = 3;
pub const CPU_SPACE_ID: SpaceId = 4;
pub const EP_SPACE_ID: SpaceId = 5;
pub const RESSPC_SPACE_ID: SpaceId = 6;

/// Boot-time configuration handed over by the kernel/rootserver glue.
pub struct BootConfig {
    /// Image name recorded for the root-task PD.
    pub rt_name: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            rt_name: String::from("root-task"),
        }
    }
}

/// What a handler decided about the reply.
pub enum Disposition {
    Reply(ReplyBody),
    /// Reply saved; released later by an ack.
    Deferred,
    /// No reply will ever be sent (the caller is gone).
    NoReply,
}

#[derive(Default)]
pub(crate) struct TerminationState {
    pub n_missing: usize,
    pub deferred: Option<ReplyCap>,
}

#[derive(Default)]
pub(crate) struct ExtractionState {
    pub n_missing: usize,
    pub deferred: Option<ReplyCap>,
    pub model: Option<ModelState>,
    pub requester: PdId,
}

impl ExtractionState {
    pub fn is_pending(&self) -> bool { self.model.is_some() }
}

#[derive(Default)]
pub(crate) struct SendState {
    pub n_missing: usize,
    pub deferred: Option<ReplyCap>,
    pub pending_body: Option<ReplyBody>,
}

pub struct ResourceManager {
    pub(crate) kernel: Box<dyn KernelInterface>,
    pub(crate) listen_ep: Endpoint,
    pub(crate) resspc: SpaceComponent,
    pub(crate) mo: MoComponent,
    pub(crate) ads: AdsComponent,
    pub(crate) cpu: CpuComponent,
    pub(crate) ep: EpComponent,
    pub(crate) pd: PdComponent,
    pub(crate) rt_pd_id: PdId,
    pub(crate) policy: CleanupPolicy,
    pub(crate) max_cleanup_depth: i32,
    pub(crate) termination: TerminationState,
    pub(crate) extraction: ExtractionState,
    pub(crate) send_transfer: SendState,
    // Exit handling may be re-entered from cascade; PD-registry
    // deletion is serialized by this.
    pub(crate) pd_delete_lock: Mutex<()>,
}

impl ResourceManager {
    pub fn new(
        mut kernel: Box<dyn KernelInterface>,
        config: BootConfig,
    ) -> Result<ResourceManager, RmError> {
        let listen_ep = kernel.create_endpoint()?;
        let mut rm = ResourceManager {
            kernel,
            listen_ep,
            resspc: SpaceComponent::new(RESSPC_SPACE_ID),
            mo: MoComponent::new(MO_SPACE_ID),
            ads: AdsComponent::new(ADS_SPACE_ID),
            cpu: CpuComponent::new(CPU_SPACE_ID),
            ep: EpComponent::new(EP_SPACE_ID),
            pd: PdComponent::new(PD_SPACE_ID),
            rt_pd_id: 0,
            policy: CLEANUP_POLICY,
            max_cleanup_depth: CLEANUP_PD_DEPTH,
            termination: Default::default(),
            extraction: Default::default(),
            send_transfer: Default::default(),
            pd_delete_lock: Mutex::new(()),
        };

        // Forge the root-task PD; the RM serves from inside it.
        let rt = rm
            .pd
            .alloc(rm.kernel.as_mut(), rm.listen_ep, 0, None, true)?;
        rm.rt_pd_id = rt.object_id as PdId;
        {
            let rt_pd = rm.pd.get_mut(rm.rt_pd_id).unwrap();
            rt_pd.set_name(&config.rt_name);
            rt_pd.state = PdState::Running;
        }

        // One space per built-in component, all managed by the root
        // task and served from the RM's own endpoint.
        let core_spaces = [
            (PD_SPACE_ID, CapType::Pd, "PD"),
            (ADS_SPACE_ID, CapType::Ads, "ADS"),
            (MO_SPACE_ID, CapType::Mo, "MO"),
            (CPU_SPACE_ID, CapType::Cpu, "CPU"),
            (EP_SPACE_ID, CapType::Ep, "EP"),
            (RESSPC_SPACE_ID, CapType::Resspc, "RESSPC"),
        ];
        for (space_id, cap_type, name) in core_spaces {
            let alloc = rm.resspc.alloc(
                rm.kernel.as_mut(),
                rm.listen_ep,
                None,
                rm.rt_pd_id,
                Some(cap_type),
                name,
                rm.listen_ep,
                None,
            )?;
            assert_eq!(alloc.object_id as SpaceId, space_id);
            let rt_pd = rm.pd.get_mut(rm.rt_pd_id).unwrap();
            rt_pd.add_resource(
                ResId::new(CapType::Resspc, RESSPC_SPACE_ID, alloc.object_id),
                0,
            );
        }
        info!("resource manager up; rt pd {}", rm.rt_pd_id);
        Ok(rm)
    }

    pub fn rt_pd_id(&self) -> PdId { self.rt_pd_id }
    pub fn listen_ep(&self) -> Endpoint { self.listen_ep }

    #[cfg(test)]
    pub(crate) fn set_cleanup_policy(&mut self, policy: CleanupPolicy, max_depth: i32) {
        self.policy = policy;
        self.max_cleanup_depth = max_depth;
    }

    /// One message through the reactor: returns the encoded reply, or
    /// `None` when the reply was deferred (or dropped with its dead
    /// caller).
    pub fn handle_message(
        &mut self,
        sender_badge: u64,
        cap_badges: &[u64],
        msg: &[u8],
    ) -> Option<Vec<u8>> {
        let badge = Badge::from_raw(sender_badge);
        trace!("request from {}", badge);
        match self.dispatch(badge, cap_badges, msg) {
            Ok(Disposition::Reply(body)) => Some(RmReply::success(body).encode()),
            Ok(Disposition::Deferred) | Ok(Disposition::NoReply) => None,
            Err(err) => {
                debug!("request from {} failed: {:?}", badge, err);
                Some(RmReply::failure(err).encode())
            }
        }
    }

    fn dispatch(
        &mut self,
        badge: Badge,
        caps: &[u64],
        msg: &[u8],
    ) -> Result<Disposition, RmError> {
        if badge.cap_type() == CapType::None {
            return Err(RmError::BadBadge);
        }
        let request: RmRequest = postcard::from_bytes(msg)?;
        if request.component() != badge.cap_type() {
            return Err(RmError::WrongType);
        }
        match request {
            RmRequest::Mo(req) => self.handle_mo(badge, req),
            RmRequest::Ads(req) => self.handle_ads(badge, req, caps),
            RmRequest::Cpu(req) => self.handle_cpu(badge, req, caps),
            RmRequest::Ep(req) => self.handle_ep(badge, req),
            RmRequest::Resspc(req) => self.handle_resspc(badge, req, caps),
            RmRequest::Pd(req) => self.handle_pd(badge, req, caps),
        }
    }

    // -- shared helpers --

    fn require_object(badge: Badge) -> Result<ObjId, RmError> {
        if badge.is_alloc_entry() {
            Err(RmError::InvalidState)
        } else {
            Ok(badge.object_id())
        }
    }

    fn require_alloc_entry(badge: Badge) -> Result<(), RmError> {
        if badge.is_alloc_entry() {
            Ok(())
        } else {
            // Only the allocation entry point accepts this message.
            Err(RmError::InvalidState)
        }
    }

    fn cap_of_type(caps: &[u64], cap_type: CapType) -> Option<Badge> {
        caps.iter()
            .map(|raw| Badge::from_raw(*raw))
            .find(|b| b.cap_type() == cap_type)
    }

    fn require_cap(caps: &[u64], cap_type: CapType) -> Result<Badge, RmError> {
        Self::cap_of_type(caps, cap_type).ok_or(RmError::BadBadge)
    }

    /// Re-serializes a PD's init data into its shared frame.
    pub(crate) fn flush_init_data(&mut self, pd_id: PdId) -> Result<(), RmError> {
        let (mo_id, bytes) = {
            let pd = self.pd.get(pd_id).ok_or(RmError::NotFound)?;
            let bytes =
                postcard::to_allocvec(&pd.init_data).map_err(|_| RmError::SerializeFailed)?;
            (pd.init_data_mo, bytes)
        };
        if let Some(mo_id) = mo_id {
            let Self { kernel, mo, .. } = self;
            mo.write_bytes(kernel.as_mut(), mo_id, &bytes)?;
        }
        Ok(())
    }

    /// Queues work on a PD and rings its doorbell, keeping the global
    /// ack counters in step.
    pub(crate) fn enqueue_work_on(&mut self, target: PdId, action: WorkAction, entry: WorkEntry) {
        let queued = {
            let Self { kernel, pd, .. } = self;
            match pd.get_mut(target) {
                Some(p) if !p.deleting => {
                    p.enqueue_work(action, entry);
                    kernel.signal(p.notification);
                    true
                }
                _ => false,
            }
        };
        if queued {
            match action {
                WorkAction::Free | WorkAction::Destroy if entry.is_critical => {
                    self.termination.n_missing += 1
                }
                WorkAction::Send if entry.is_critical => self.send_transfer.n_missing += 1,
                WorkAction::Extract => self.extraction.n_missing += 1,
                _ => {}
            }
        }
    }

    /// Shares an RDE with `target`: the space's request endpoint is
    /// minted into the target's cspace (badged as the allocation entry
    /// point for that space) and recorded in its directory.
    pub(crate) fn share_rde(
        &mut self,
        target_pd: PdId,
        cap_type: u8,
        space_id: SpaceId,
    ) -> Result<(), RmError> {
        let resolved = if space_id == NULL_SPACE {
            self.resspc
                .find_default(CapType::from(cap_type))
                .ok_or(RmError::NotFound)?
        } else {
            space_id
        };
        let (server_ep, type_name) = {
            let space = self.resspc.get(resolved).ok_or(RmError::NotFound)?;
            if u8::from(space.resource_type) != cap_type {
                return Err(RmError::WrongType);
            }
            (space.server_ep, space.type_name.clone())
        };
        let entry_badge = Badge::new(CapType::from(cap_type), resolved, NULL_OBJ, target_pd)?;
        {
            let Self { kernel, pd, .. } = self;
            let target = pd.get_mut(target_pd).ok_or(RmError::NotFound)?;
            let slot = target.next_slot()?;
            if let Err(e) = kernel.mint_badged_endpoint(
                CSlot::new(target.cspace, slot),
                server_ep,
                entry_badge.raw(),
                CapRights::RW | CapRights::GRANT,
            ) {
                target.free_slot(slot);
                return Err(e.into());
            }
            target.add_rde(cap_type, &type_name, resolved, slot)?;
        }
        self.flush_init_data(target_pd)
    }

    // -- MO --

    fn handle_mo(&mut self, badge: Badge, req: MoRequest) -> Result<Disposition, RmError> {
        let client_id = badge.client_pd_id();
        match req {
            MoRequest::Alloc {
                num_pages,
                page_bits,
            } => {
                Self::require_alloc_entry(badge)?;
                let Self {
                    kernel,
                    mo,
                    pd,
                    listen_ep,
                    ..
                } = self;
                let client = pd.get_mut(client_id).ok_or(RmError::NotFound)?;
                let alloc = mo.alloc(
                    kernel.as_mut(),
                    *listen_ep,
                    Some(client),
                    client_id,
                    num_pages,
                    page_bits,
                )?;
                Ok(Disposition::Reply(ReplyBody::Allocated {
                    object_id: alloc.object_id,
                    space_id: MO_SPACE_ID,
                    slot: alloc.slot.unwrap_or(0),
                }))
            }
            MoRequest::Connect { object_id } => {
                Self::require_alloc_entry(badge)?;
                let Self {
                    kernel,
                    mo,
                    pd,
                    listen_ep,
                    ..
                } = self;
                let client = pd.get_mut(client_id).ok_or(RmError::NotFound)?;
                let alloc =
                    mo.connect(kernel.as_mut(), *listen_ep, client, client_id, object_id)?;
                Ok(Disposition::Reply(ReplyBody::Allocated {
                    object_id,
                    space_id: MO_SPACE_ID,
                    slot: alloc.slot.unwrap_or(0),
                }))
            }
            MoRequest::Disconnect => {
                let id = Self::require_object(badge)?;
                let res = ResId::new(CapType::Mo, MO_SPACE_ID, id);
                self.remove_hold(client_id, &res);
                self.dec_core(res);
                Ok(Disposition::Reply(ReplyBody::None))
            }
        }
    }

    // -- ADS --

    fn handle_ads(
        &mut self,
        badge: Badge,
        req: AdsRequest,
        caps: &[u64],
    ) -> Result<Disposition, RmError> {
        let client_id = badge.client_pd_id();
        match req {
            AdsRequest::Alloc => {
                Self::require_alloc_entry(badge)?;
                let Self {
                    kernel,
                    ads,
                    pd,
                    listen_ep,
                    ..
                } = self;
                let client = pd.get_mut(client_id).ok_or(RmError::NotFound)?;
                let alloc = ads.alloc(kernel.as_mut(), *listen_ep, Some(client), client_id)?;
                Ok(Disposition::Reply(ReplyBody::Allocated {
                    object_id: alloc.object_id,
                    space_id: ADS_SPACE_ID,
                    slot: alloc.slot.unwrap_or(0),
                }))
            }
            AdsRequest::Reserve {
                vaddr,
                num_pages,
                page_bits,
                vmr_type,
                rights,
                cacheable,
            } => {
                let id = Self::require_object(badge)?;
                let start = self.ads.reserve(
                    id,
                    vaddr,
                    num_pages,
                    page_bits,
                    vmr_type,
                    CapRights::from_bits_truncate(rights),
                    cacheable,
                )?;
                Ok(Disposition::Reply(ReplyBody::Vaddr { vaddr: start }))
            }
            AdsRequest::Attach {
                vmr_vaddr,
                offset,
                rights,
            } => {
                let id = Self::require_object(badge)?;
                let mo_badge = Self::require_cap(caps, CapType::Mo)?;
                let Self {
                    kernel, ads, mo, ..
                } = self;
                let vaddr = ads.attach(
                    kernel.as_mut(),
                    mo,
                    id,
                    mo_badge.object_id(),
                    vmr_vaddr,
                    offset,
                    CapRights::from_bits_truncate(rights),
                )?;
                Ok(Disposition::Reply(ReplyBody::Vaddr { vaddr }))
            }
            AdsRequest::Remove { vaddr } => {
                let id = Self::require_object(badge)?;
                let Self {
                    kernel, ads, mo, ..
                } = self;
                ads.remove(kernel.as_mut(), mo, id, vaddr)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            AdsRequest::ShallowCopy { omit_vaddr } => {
                let id = Self::require_object(badge)?;
                let Self {
                    kernel,
                    ads,
                    mo,
                    pd,
                    listen_ep,
                    ..
                } = self;
                let client = pd.get_mut(client_id).ok_or(RmError::NotFound)?;
                let alloc = ads.shallow_copy(
                    kernel.as_mut(),
                    mo,
                    *listen_ep,
                    Some(client),
                    client_id,
                    id,
                    omit_vaddr,
                )?;
                Ok(Disposition::Reply(ReplyBody::Allocated {
                    object_id: alloc.object_id,
                    space_id: ADS_SPACE_ID,
                    slot: alloc.slot.unwrap_or(0),
                }))
            }
            AdsRequest::LoadElf { image_len } => {
                let id = Self::require_object(badge)?;
                let image_mo = Self::require_cap(caps, CapType::Mo)?;
                let pd_badge = Self::require_cap(caps, CapType::Pd)?;
                let target_pd = pd_badge.object_id() as PdId;
                let image = {
                    let Self { kernel, mo, .. } = self;
                    mo.read_bytes(kernel.as_mut(), image_mo.object_id(), image_len)?
                };
                let Self {
                    kernel,
                    ads,
                    mo,
                    pd,
                    listen_ep,
                    ..
                } = self;
                let pd_obj = pd.get_mut(target_pd).ok_or(RmError::NotFound)?;
                let entry = elf::load_elf(
                    kernel.as_mut(),
                    ads,
                    mo,
                    *listen_ep,
                    id,
                    pd_obj,
                    target_pd,
                    &image,
                )?;
                Ok(Disposition::Reply(ReplyBody::Vaddr { vaddr: entry }))
            }
        }
    }

    // -- CPU --

    fn handle_cpu(
        &mut self,
        badge: Badge,
        req: CpuRequest,
        caps: &[u64],
    ) -> Result<Disposition, RmError> {
        let client_id = badge.client_pd_id();
        match req {
            CpuRequest::Alloc => {
                Self::require_alloc_entry(badge)?;
                let Self {
                    kernel,
                    cpu,
                    pd,
                    listen_ep,
                    ..
                } = self;
                let client = pd.get_mut(client_id).ok_or(RmError::NotFound)?;
                let alloc = cpu.alloc(kernel.as_mut(), *listen_ep, Some(client), client_id)?;
                Ok(Disposition::Reply(ReplyBody::Allocated {
                    object_id: alloc.object_id,
                    space_id: CPU_SPACE_ID,
                    slot: alloc.slot.unwrap_or(0),
                }))
            }
            CpuRequest::Configure {
                cnode_guard,
                priority,
                ipc_buf_vaddr,
            } => {
                let cpu_id = Self::require_object(badge)?;
                let ads_badge = Self::require_cap(caps, CapType::Ads)?;
                let pd_badge = Self::require_cap(caps, CapType::Pd)?;
                let fault_ep = Self::cap_of_type(caps, CapType::Ep);
                let ipc_mo = Self::cap_of_type(caps, CapType::Mo);
                let target_pd = pd_badge.object_id() as PdId;

                // The fault endpoint cap lands in the PD's cspace
                // first so the thread can be pointed at it.
                let fault_slot = match fault_ep {
                    Some(epb) => {
                        let Self { kernel, ep, pd, .. } = self;
                        let pd_obj = pd.get_mut(target_pd).ok_or(RmError::NotFound)?;
                        let slot =
                            ep.get_raw_endpoint(kernel.as_mut(), epb.object_id(), pd_obj)?;
                        pd_obj.fault_ep = Some(epb.object_id());
                        pd_obj.init_data.fault_ep_cap = slot;
                        Some(CSlot::new(pd_obj.cspace, slot))
                    }
                    None => None,
                };

                let Self {
                    kernel,
                    cpu,
                    ads,
                    mo,
                    pd,
                    ..
                } = self;
                let pd_obj = pd.get_mut(target_pd).ok_or(RmError::NotFound)?;
                cpu.configure(
                    kernel.as_mut(),
                    ads,
                    mo,
                    pd_obj,
                    target_pd,
                    cpu_id,
                    ads_badge.object_id(),
                    cnode_guard,
                    fault_slot,
                    ipc_mo.map(|b| b.object_id()),
                    ipc_buf_vaddr,
                    priority,
                )?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            CpuRequest::SetTlsBase { tls_base } => {
                let cpu_id = Self::require_object(badge)?;
                self.cpu.set_tls_base(self.kernel.as_mut(), cpu_id, tls_base)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            CpuRequest::WriteRegisters { regs, resume } => {
                let cpu_id = Self::require_object(badge)?;
                self.cpu
                    .write_registers(self.kernel.as_mut(), cpu_id, &regs, resume)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            CpuRequest::ReadRegisters => {
                let cpu_id = Self::require_object(badge)?;
                let regs = self
                    .cpu
                    .read_registers(self.kernel.as_mut(), cpu_id)?;
                Ok(Disposition::Reply(ReplyBody::Registers { regs }))
            }
            CpuRequest::Start => {
                let cpu_id = Self::require_object(badge)?;
                let owner = self.cpu.start(self.kernel.as_mut(), cpu_id)?;
                if owner != 0 {
                    if let Some(pd) = self.pd.get_mut(owner) {
                        pd.state = PdState::Running;
                    }
                }
                Ok(Disposition::Reply(ReplyBody::None))
            }
            CpuRequest::Stop => {
                let cpu_id = Self::require_object(badge)?;
                self.cpu.stop(self.kernel.as_mut(), cpu_id)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            CpuRequest::Resume => {
                let cpu_id = Self::require_object(badge)?;
                self.cpu.resume(self.kernel.as_mut(), cpu_id)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            CpuRequest::ChangeVspace => {
                let cpu_id = Self::require_object(badge)?;
                let ads_badge = Self::require_cap(caps, CapType::Ads)?;
                let destroyed = {
                    let Self {
                        kernel, cpu, ads, ..
                    } = self;
                    cpu.change_vspace(kernel.as_mut(), ads, cpu_id, ads_badge.object_id())?
                };
                if let Some(old) = destroyed {
                    self.finish_ads(old);
                }
                Ok(Disposition::Reply(ReplyBody::None))
            }
            #[cfg(feature = "CONFIG_VM_SUPPORT")]
            CpuRequest::InjectIrq { irq } => {
                let cpu_id = Self::require_object(badge)?;
                self.cpu.inject_irq(self.kernel.as_mut(), cpu_id, irq)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            #[cfg(feature = "CONFIG_VM_SUPPORT")]
            CpuRequest::AckVppi { irq } => {
                let cpu_id = Self::require_object(badge)?;
                self.cpu.ack_vppi(self.kernel.as_mut(), cpu_id, irq)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            #[cfg(feature = "CONFIG_VM_SUPPORT")]
            CpuRequest::ReadVcpuRegs => {
                let cpu_id = Self::require_object(badge)?;
                let regs = self.cpu.read_vcpu_regs(self.kernel.as_mut(), cpu_id)?;
                Ok(Disposition::Reply(ReplyBody::Registers { regs }))
            }
            #[cfg(feature = "CONFIG_VM_SUPPORT")]
            CpuRequest::Elevate => {
                let cpu_id = Self::require_object(badge)?;
                self.cpu.elevate(self.kernel.as_mut(), cpu_id)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
        }
    }

    // -- EP --

    fn handle_ep(&mut self, badge: Badge, req: EpRequest) -> Result<Disposition, RmError> {
        let client_id = badge.client_pd_id();
        match req {
            EpRequest::Alloc => {
                Self::require_alloc_entry(badge)?;
                let Self {
                    kernel,
                    ep,
                    pd,
                    listen_ep,
                    ..
                } = self;
                let client = pd.get_mut(client_id).ok_or(RmError::NotFound)?;
                let (alloc, raw_slot) =
                    ep.alloc(kernel.as_mut(), *listen_ep, client, client_id)?;
                Ok(Disposition::Reply(ReplyBody::EpAllocated {
                    object_id: alloc.object_id,
                    slot: alloc.slot.unwrap_or(0),
                    raw_slot,
                }))
            }
            EpRequest::Disconnect => {
                let id = Self::require_object(badge)?;
                let res = ResId::new(CapType::Ep, EP_SPACE_ID, id);
                self.remove_hold(client_id, &res);
                self.dec_core(res);
                Ok(Disposition::Reply(ReplyBody::None))
            }
            EpRequest::GetRawEndpoint { target_pd } => {
                let id = Self::require_object(badge)?;
                let target = target_pd.unwrap_or(client_id);
                let Self { kernel, ep, pd, .. } = self;
                let target_pd_obj = pd.get_mut(target).ok_or(RmError::NotFound)?;
                let slot = ep.get_raw_endpoint(kernel.as_mut(), id, target_pd_obj)?;
                Ok(Disposition::Reply(ReplyBody::Slot { slot }))
            }
            EpRequest::Badge {
                badge_value,
                target_pd,
            } => {
                let id = Self::require_object(badge)?;
                let Self { kernel, ep, pd, .. } = self;
                let target = pd.get_mut(target_pd).ok_or(RmError::NotFound)?;
                let slot = ep.badge(kernel.as_mut(), id, badge_value, target)?;
                Ok(Disposition::Reply(ReplyBody::Slot { slot }))
            }
            EpRequest::Forge { raw } => {
                Self::require_alloc_entry(badge)?;
                if client_id != self.rt_pd_id {
                    return Err(RmError::InvalidState);
                }
                let Self {
                    kernel,
                    ep,
                    pd,
                    listen_ep,
                    ..
                } = self;
                let client = pd.get_mut(client_id).ok_or(RmError::NotFound)?;
                let alloc = ep.forge(
                    kernel.as_mut(),
                    *listen_ep,
                    Some(client),
                    client_id,
                    osmium_os_common::caps::Endpoint(raw),
                )?;
                Ok(Disposition::Reply(ReplyBody::EpAllocated {
                    object_id: alloc.object_id,
                    slot: alloc.slot.unwrap_or(0),
                    raw_slot: 0,
                }))
            }
        }
    }

    // -- RESSPC --

    fn handle_resspc(
        &mut self,
        badge: Badge,
        req: ResspcRequest,
        caps: &[u64],
    ) -> Result<Disposition, RmError> {
        let client_id = badge.client_pd_id();
        match req {
            ResspcRequest::Alloc {
                type_name,
                cap_type,
                map_space_id,
            } => {
                Self::require_alloc_entry(badge)?;
                let ep_badge = Self::require_cap(caps, CapType::Ep)?;
                let server_ep = self
                    .ep
                    .core
                    .get(ep_badge.object_id())
                    .ok_or(RmError::NotFound)?
                    .raw;
                let alloc = {
                    let Self {
                        kernel,
                        resspc,
                        pd,
                        listen_ep,
                        ..
                    } = self;
                    let manager = pd.get_mut(client_id).ok_or(RmError::NotFound)?;
                    resspc.alloc(
                        kernel.as_mut(),
                        *listen_ep,
                        Some(manager),
                        client_id,
                        cap_type.map(CapType::from),
                        &type_name,
                        server_ep,
                        map_space_id,
                    )?
                };
                let space_id = alloc.object_id as SpaceId;
                let assigned = self
                    .resspc
                    .resource_type_of(space_id)
                    .map(u8::from)
                    .unwrap_or(0);
                // The manager requests from its own space.
                self.share_rde(client_id, assigned, space_id)?;
                Ok(Disposition::Reply(ReplyBody::SpaceCreated {
                    space_id,
                    cap_type: assigned,
                    slot: alloc.slot.unwrap_or(0),
                }))
            }
            ResspcRequest::Delete => {
                let id = Self::require_object(badge)? as SpaceId;
                {
                    let space = self.resspc.get(id).ok_or(RmError::NotFound)?;
                    if space.managing_pd != client_id {
                        return Err(RmError::InvalidState);
                    }
                }
                self.space_cleanup(id, 0, false, None);
                self.sweep(false);
                Ok(Disposition::Reply(ReplyBody::None))
            }
            ResspcRequest::CreateResource { object_id } => {
                let id = Self::require_object(badge)? as SpaceId;
                {
                    let space = self.resspc.get(id).ok_or(RmError::NotFound)?;
                    if space.managing_pd != client_id {
                        return Err(RmError::InvalidState);
                    }
                }
                self.resspc.create_resource(id, object_id)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
        }
    }

    // -- PD --

    fn handle_pd(
        &mut self,
        badge: Badge,
        req: PdRequest,
        caps: &[u64],
    ) -> Result<Disposition, RmError> {
        let client_id = badge.client_pd_id();
        match req {
            PdRequest::Alloc => {
                Self::require_alloc_entry(badge)?;
                let init_mo = Self::cap_of_type(caps, CapType::Mo).map(|b| b.object_id());
                let alloc = {
                    let Self {
                        kernel,
                        pd,
                        listen_ep,
                        ..
                    } = self;
                    pd.alloc(kernel.as_mut(), *listen_ep, client_id, init_mo, false)?
                };
                if let Some(mo_id) = init_mo {
                    // The new PD keeps its own reference on the init
                    // frame for its lifetime.
                    self.mo.core.inc(mo_id)?;
                }
                Ok(Disposition::Reply(ReplyBody::Allocated {
                    object_id: alloc.object_id,
                    space_id: PD_SPACE_ID,
                    slot: alloc.slot.unwrap_or(0),
                }))
            }
            PdRequest::NextSlot => {
                let id = Self::require_object(badge)? as PdId;
                let slot = self
                    .pd
                    .get_mut(id)
                    .ok_or(RmError::NotFound)?
                    .next_slot()?;
                Ok(Disposition::Reply(ReplyBody::Slot { slot }))
            }
            PdRequest::FreeSlot { slot } => {
                let id = Self::require_object(badge)? as PdId;
                self.pd.get_mut(id).ok_or(RmError::NotFound)?.free_slot(slot);
                Ok(Disposition::Reply(ReplyBody::None))
            }
            PdRequest::ClearSlot { slot } => {
                let id = Self::require_object(badge)? as PdId;
                let Self { kernel, pd, .. } = self;
                pd.get_mut(id)
                    .ok_or(RmError::NotFound)?
                    .clear_slot(kernel.as_mut(), slot)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            PdRequest::SendCap { is_core_cap } => {
                let target = Self::require_object(badge)? as PdId;
                let sent = caps.first().map(|raw| Badge::from_raw(*raw)).ok_or(RmError::BadBadge)?;
                self.send_cap(target, sent, is_core_cap)
            }
            PdRequest::Dump => {
                let requester = Self::require_object(badge)? as PdId;
                self.start_dump(requester)
            }
            PdRequest::ShareRde { cap_type, space_id } => {
                let target = Self::require_object(badge)? as PdId;
                self.share_rde(target, cap_type, space_id)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            PdRequest::RemoveRde { cap_type, space_id } => {
                let target = Self::require_object(badge)? as PdId;
                self.pd
                    .get_mut(target)
                    .ok_or(RmError::NotFound)?
                    .remove_rde(cap_type, space_id);
                self.flush_init_data(target)?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            PdRequest::GiveResource {
                recipient_pd,
                space_id,
                object_id,
            } => {
                let (resource_type, server_ep, manager) = {
                    let space = self.resspc.get(space_id).ok_or(RmError::NotFound)?;
                    (space.resource_type, space.server_ep, space.managing_pd)
                };
                if manager != client_id {
                    return Err(RmError::InvalidState);
                }
                let res = ResId::new(resource_type, space_id, object_id);
                let new_badge = Badge::new(resource_type, space_id, object_id, recipient_pd)?;
                let slot = {
                    let Self { kernel, pd, .. } = self;
                    let recipient = pd.get_mut(recipient_pd).ok_or(RmError::NotFound)?;
                    let slot = recipient.next_slot()?;
                    if let Err(e) = kernel.mint_badged_endpoint(
                        CSlot::new(recipient.cspace, slot),
                        server_ep,
                        new_badge.raw(),
                        CapRights::RW | CapRights::GRANT,
                    ) {
                        recipient.free_slot(slot);
                        return Err(e.into());
                    }
                    recipient.add_resource(res, slot);
                    slot
                };
                self.resspc.create_resource(space_id, object_id)?;
                Ok(Disposition::Reply(ReplyBody::Slot { slot }))
            }
            PdRequest::Exit { exit_code } => {
                let id = Self::require_object(badge)? as PdId;
                if let Some(pd) = self.pd.get_mut(id) {
                    pd.exit_code = exit_code;
                }
                info!("pd {} exit({})", id, exit_code);
                self.terminate_pd(id, false)?;
                // The caller is gone; nothing to reply to.
                Ok(Disposition::NoReply)
            }
            PdRequest::Terminate => {
                let victim = Self::require_object(badge)? as PdId;
                self.terminate_pd(victim, true)?;
                if self.termination.n_missing > 0 {
                    let reply = self.kernel.save_reply()?;
                    self.termination.deferred = Some(reply);
                    debug!(
                        "terminate deferred on {} critical acks",
                        self.termination.n_missing
                    );
                    Ok(Disposition::Deferred)
                } else {
                    Ok(Disposition::Reply(ReplyBody::None))
                }
            }
            PdRequest::GetWork => {
                let id = Self::require_object(badge)? as PdId;
                let batch = self
                    .pd
                    .get_mut(id)
                    .ok_or(RmError::NotFound)?
                    .work
                    .next_batch();
                Ok(Disposition::Reply(ReplyBody::Work(batch)))
            }
            PdRequest::SendSubgraph {
                has_data,
                n_requests,
            } => {
                let server = Self::require_object(badge)? as PdId;
                let mo_badge = Self::cap_of_type(caps, CapType::Mo);
                self.handle_send_subgraph(server, has_data, n_requests, mo_badge)
            }
            PdRequest::FinishWork {
                work_type,
                n_critical,
            } => {
                let server = Self::require_object(badge)? as PdId;
                self.handle_finish_work(server, work_type, n_critical);
                Ok(Disposition::Reply(ReplyBody::None))
            }
            PdRequest::LinkChild => {
                let id = Self::require_object(badge)? as PdId;
                let child = Self::require_cap(caps, CapType::Pd)?.object_id() as PdId;
                if !self.pd.core.contains(child) {
                    return Err(RmError::NotFound);
                }
                self.pd
                    .get_mut(id)
                    .ok_or(RmError::NotFound)?
                    .link_child(child);
                Ok(Disposition::Reply(ReplyBody::None))
            }
            PdRequest::RuntimeSetup {
                args,
                stack_top,
                entry_point,
                ipc_buf_vaddr: _,
                init_data_vaddr: _,
            } => {
                let id = Self::require_object(badge)? as PdId;
                let ads_badge = Self::require_cap(caps, CapType::Ads)?;
                let cpu_badge = Self::require_cap(caps, CapType::Cpu)?;
                self.runtime_setup(
                    id,
                    ads_badge.object_id(),
                    cpu_badge.object_id(),
                    &args,
                    stack_top,
                    entry_point,
                )?;
                Ok(Disposition::Reply(ReplyBody::None))
            }
            PdRequest::SetName { name } => {
                let id = Self::require_object(badge)? as PdId;
                self.pd
                    .get_mut(id)
                    .ok_or(RmError::NotFound)?
                    .set_name(&name);
                Ok(Disposition::Reply(ReplyBody::None))
            }
        }
    }

    /// Transfers a capability into `target`. A tracked core resource
    /// is re-badged for the new holder and its refcount taken first; a
    /// server-managed resource additionally enlists the managing
    /// server with a SEND work item and defers the reply until the
    /// server acks.
    pub(crate) fn send_cap(
        &mut self,
        target: PdId,
        sent: Badge,
        is_core_cap: bool,
    ) -> Result<Disposition, RmError> {
        let res = ResId::new(sent.cap_type(), sent.space_id(), sent.object_id());
        match res.cap_type {
            CapType::None => Err(RmError::BadBadge),
            CapType::User(_) => {
                if self.send_transfer.deferred.is_some() {
                    return Err(RmError::OperationInProgress);
                }
                let (server_ep, manager) = {
                    let space = self.resspc.get(res.space_id).ok_or(RmError::NotFound)?;
                    (space.server_ep, space.managing_pd)
                };
                let new_badge =
                    Badge::new(res.cap_type, res.space_id, res.object_id, target)?;
                let slot = {
                    let Self { kernel, pd, .. } = self;
                    let target_pd = pd.get_mut(target).ok_or(RmError::NotFound)?;
                    let slot = target_pd.next_slot()?;
                    if let Err(e) = kernel.mint_badged_endpoint(
                        CSlot::new(target_pd.cspace, slot),
                        server_ep,
                        new_badge.raw(),
                        CapRights::RW | CapRights::GRANT,
                    ) {
                        target_pd.free_slot(slot);
                        return Err(e.into());
                    }
                    target_pd.add_resource(res, slot);
                    slot
                };
                // The server observes the new client before the sender
                // sees the reply.
                self.enqueue_work_on(
                    manager,
                    WorkAction::Send,
                    WorkEntry {
                        res,
                        client_pd: target,
                        is_critical: true,
                    },
                );
                let reply = self.kernel.save_reply()?;
                self.send_transfer.deferred = Some(reply);
                self.send_transfer.pending_body = Some(ReplyBody::Slot { slot });
                Ok(Disposition::Deferred)
            }
            _ => {
                // Refcount inc happens before the transfer that
                // justifies it.
                self.inc_core(res)?;
                let new_badge =
                    Badge::new(res.cap_type, res.space_id, res.object_id, target)?;
                let slot = {
                    let Self {
                        kernel,
                        pd,
                        listen_ep,
                        ..
                    } = self;
                    let target_pd = pd.get_mut(target).ok_or(RmError::NotFound)?;
                    let slot = target_pd.install_badged_cap(kernel.as_mut(), *listen_ep, new_badge)?;
                    target_pd.add_resource(res, slot);
                    if is_core_cap {
                        target_pd.set_core_cap(new_badge, slot);
                    }
                    slot
                };
                if is_core_cap {
                    self.flush_init_data(target)?;
                }
                Ok(Disposition::Reply(ReplyBody::Slot { slot }))
            }
        }
    }

    pub(crate) fn runtime_setup(
        &mut self,
        pd_id: PdId,
        ads_id: ObjId,
        cpu_id: ObjId,
        args: &[usize],
        stack_top: usize,
        entry_point: usize,
    ) -> Result<(), RmError> {
        let mut regs = UserContext {
            pc: entry_point,
            sp: stack_top & !0xf,
            ..Default::default()
        };
        regs.gpr[0] = args.len();
        for (i, arg) in args.iter().take(regs.gpr.len() - 1).enumerate() {
            regs.gpr[i + 1] = *arg;
        }
        {
            let Self { kernel, cpu, .. } = self;
            cpu.write_registers(kernel.as_mut(), cpu_id, &regs, false)?;
        }
        let pd = self.pd.get_mut(pd_id).ok_or(RmError::NotFound)?;
        pd.bound_ads = Some(ads_id);
        pd.state = PdState::Configured;
        self.flush_init_data(pd_id)
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testutil::FakeKernel;
    use osmium_rm_interface::work::WorkReply;

    pub(crate) fn boot() -> ResourceManager {
        ResourceManager::new(Box::new(FakeKernel::new()), BootConfig::default()).unwrap()
    }

    /// Sends a request the way the kernel would deliver it.
    pub(crate) fn call(
        rm: &mut ResourceManager,
        badge: Badge,
        caps: &[u64],
        req: &RmRequest,
    ) -> RmReply {
        let bytes = postcard::to_allocvec(req).unwrap();
        match rm.handle_message(badge.raw(), caps, &bytes) {
            Some(reply) => RmReply::decode(&reply).unwrap(),
            None => RmReply::failure(RmError::UnknownError), // deferred
        }
    }

    pub(crate) fn alloc_entry(cap_type: CapType, space: SpaceId, client: PdId) -> Badge {
        Badge::new(cap_type, space, NULL_OBJ, client).unwrap()
    }

    pub(crate) fn obj_badge(
        cap_type: CapType,
        space: SpaceId,
        object: ObjId,
        client: PdId,
    ) -> Badge {
        Badge::new(cap_type, space, object, client).unwrap()
    }

    /// Allocates a PD as the root task would for a child process.
    pub(crate) fn alloc_pd(rm: &mut ResourceManager) -> PdId {
        let rt = rm.rt_pd_id();
        let reply = call(
            rm,
            alloc_entry(CapType::Pd, PD_SPACE_ID, rt),
            &[],
            &RmRequest::Pd(PdRequest::Alloc),
        );
        assert_eq!(reply.error, RmError::Success);
        match reply.body {
            ReplyBody::Allocated { object_id, .. } => object_id as PdId,
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_boot_creates_core_spaces() {
        let rm = boot();
        for space in [
            PD_SPACE_ID,
            ADS_SPACE_ID,
            MO_SPACE_ID,
            CPU_SPACE_ID,
            EP_SPACE_ID,
            RESSPC_SPACE_ID,
        ] {
            assert!(rm.resspc.get(space).is_some(), "space {} missing", space);
        }
        assert!(rm.pd.get(rm.rt_pd_id()).is_some());
    }

    #[test]
    fn test_mo_alloc_and_lookup() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        let reply = call(
            &mut rm,
            alloc_entry(CapType::Mo, MO_SPACE_ID, rt),
            &[],
            &RmRequest::Mo(MoRequest::Alloc {
                num_pages: 4,
                page_bits: 12,
            }),
        );
        assert_eq!(reply.error, RmError::Success);
        let id = match reply.body {
            ReplyBody::Allocated { object_id, slot, .. } => {
                assert_ne!(slot, 0);
                object_id
            }
            other => panic!("unexpected body {:?}", other),
        };
        assert!(rm.mo.core.contains(id));
        // The owner holds it.
        assert!(rm
            .pd
            .get(rt)
            .unwrap()
            .holds_resource(&ResId::new(CapType::Mo, MO_SPACE_ID, id)));
    }

    #[test]
    fn test_mo_disconnect_frees_at_zero() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        let reply = call(
            &mut rm,
            alloc_entry(CapType::Mo, MO_SPACE_ID, rt),
            &[],
            &RmRequest::Mo(MoRequest::Alloc {
                num_pages: 4,
                page_bits: 12,
            }),
        );
        let id = match reply.body {
            ReplyBody::Allocated { object_id, .. } => object_id,
            _ => unreachable!(),
        };

        let reply = call(
            &mut rm,
            obj_badge(CapType::Mo, MO_SPACE_ID, id, rt),
            &[],
            &RmRequest::Mo(MoRequest::Disconnect),
        );
        assert_eq!(reply.error, RmError::Success);
        // Scenario: after the last reference goes, lookups fail.
        assert!(!rm.mo.core.contains(id));
        let reply = call(
            &mut rm,
            alloc_entry(CapType::Mo, MO_SPACE_ID, rt),
            &[],
            &RmRequest::Mo(MoRequest::Connect { object_id: id }),
        );
        assert_eq!(reply.error, RmError::NotFound);
    }

    #[test]
    fn test_wrong_component_magic() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        // MO request on a PD badge.
        let reply = call(
            &mut rm,
            alloc_entry(CapType::Pd, PD_SPACE_ID, rt),
            &[],
            &RmRequest::Mo(MoRequest::Alloc {
                num_pages: 1,
                page_bits: 12,
            }),
        );
        assert_eq!(reply.error, RmError::WrongType);
    }

    #[test]
    fn test_null_badge_rejected() {
        let mut rm = boot();
        let reply_bytes = rm.handle_message(
            0,
            &[],
            &postcard::to_allocvec(&RmRequest::Pd(PdRequest::GetWork)).unwrap(),
        );
        let reply = RmReply::decode(&reply_bytes.unwrap()).unwrap();
        assert_eq!(reply.error, RmError::BadBadge);
    }

    #[test]
    fn test_alloc_entry_rule() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        // Allocation via an object badge is refused.
        let reply = call(
            &mut rm,
            obj_badge(CapType::Mo, MO_SPACE_ID, 1, rt),
            &[],
            &RmRequest::Mo(MoRequest::Alloc {
                num_pages: 1,
                page_bits: 12,
            }),
        );
        assert_eq!(reply.error, RmError::InvalidState);
        // Object ops via the alloc entry are refused.
        let reply = call(
            &mut rm,
            alloc_entry(CapType::Mo, MO_SPACE_ID, rt),
            &[],
            &RmRequest::Mo(MoRequest::Disconnect),
        );
        assert_eq!(reply.error, RmError::InvalidState);
    }

    #[test]
    fn test_get_work_empty() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        let reply = call(
            &mut rm,
            obj_badge(CapType::Pd, PD_SPACE_ID, rt, rt),
            &[],
            &RmRequest::Pd(PdRequest::GetWork),
        );
        match reply.body {
            ReplyBody::Work(WorkReply { action, .. }) => {
                assert_eq!(action, WorkAction::NoWork)
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_send_core_cap_roundtrip() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        let target = alloc_pd(&mut rm);

        // Allocate an MO to the root task, then send it to the child.
        let reply = call(
            &mut rm,
            alloc_entry(CapType::Mo, MO_SPACE_ID, rt),
            &[],
            &RmRequest::Mo(MoRequest::Alloc {
                num_pages: 1,
                page_bits: 12,
            }),
        );
        let mo_id = match reply.body {
            ReplyBody::Allocated { object_id, .. } => object_id,
            _ => unreachable!(),
        };
        assert_eq!(rm.mo.core.refcount(mo_id), Some(1));

        let sent = obj_badge(CapType::Mo, MO_SPACE_ID, mo_id, rt);
        let reply = call(
            &mut rm,
            obj_badge(CapType::Pd, PD_SPACE_ID, target as ObjId, rt),
            &[sent.raw()],
            &RmRequest::Pd(PdRequest::SendCap { is_core_cap: false }),
        );
        assert_eq!(reply.error, RmError::Success);
        assert_eq!(rm.mo.core.refcount(mo_id), Some(2));
        assert!(rm
            .pd
            .get(target)
            .unwrap()
            .holds_resource(&ResId::new(CapType::Mo, MO_SPACE_ID, mo_id)));

        // Target exiting restores the sender's refcount.
        rm.terminate_pd(target, false).unwrap();
        assert_eq!(rm.mo.core.refcount(mo_id), Some(1));
    }

    #[test]
    fn test_share_and_remove_rde() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        let target = alloc_pd(&mut rm);

        let reply = call(
            &mut rm,
            obj_badge(CapType::Pd, PD_SPACE_ID, target as ObjId, rt),
            &[],
            &RmRequest::Pd(PdRequest::ShareRde {
                cap_type: u8::from(CapType::Mo),
                space_id: MO_SPACE_ID,
            }),
        );
        assert_eq!(reply.error, RmError::Success);
        assert!(rm
            .pd
            .get(target)
            .unwrap()
            .rde_get(u8::from(CapType::Mo), MO_SPACE_ID)
            .is_some());

        let reply = call(
            &mut rm,
            obj_badge(CapType::Pd, PD_SPACE_ID, target as ObjId, rt),
            &[],
            &RmRequest::Pd(PdRequest::RemoveRde {
                cap_type: u8::from(CapType::Mo),
                space_id: MO_SPACE_ID,
            }),
        );
        assert_eq!(reply.error, RmError::Success);
        assert!(rm
            .pd
            .get(target)
            .unwrap()
            .rde_get(u8::from(CapType::Mo), MO_SPACE_ID)
            .is_none());
    }
}
