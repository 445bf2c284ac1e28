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

//! Process Directory: the Resource Manager's per-process record.
//!
//! A PD tracks everything the manager knows about one process: its
//! cspace and free slots, the resources it holds, the request
//! directory telling it where to ask for more, linked children whose
//! lifetime it bounds, pending asynchronous work, and the shared
//! init-data frame mapped into both the RM and the process.

pub mod work;

extern crate alloc;
use alloc::vec::Vec;
use log::trace;
use osmium_os_common::badge::{Badge, CapType, ObjId, PdId, SpaceId, NULL_SPACE};
use osmium_os_common::caps::{
    CNode, CPtr, CSlot, CapRights, Endpoint, KernelInterface, Notification,
};
use osmium_os_common::registry::ResourceRegistry;
use osmium_os_common::slot_allocator::SlotAllocator;
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::initdata::{InitData, RdeEntry, MAX_CAP_TYPES, RDE_SLOTS_PER_TYPE};
use osmium_rm_interface::model::ResId;
use osmium_rm_interface::work::WorkAction;
use smallstr::SmallString;
use smallvec::SmallVec;

use crate::component::RmObject;
use work::{WorkEntry, WorkQueues};

/// Size in bits of a PD's root CNode.
pub const PD_CSPACE_SIZE_BITS: usize = 12;
/// Slots below this are reserved for well-known caps placed at
/// creation (cspace root, fault endpoint, init data, ...).
pub const PD_FIRST_FREE_SLOT: usize = 8;

pub const PD_NAME_CAPACITY: usize = 64;
pub type PdName = SmallString<[u8; PD_NAME_CAPACITY]>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PdState {
    New,
    Configured,
    Running,
}

/// One held resource; the slot records where the badged cap landed in
/// the PD's cspace.
#[derive(Copy, Clone, Debug)]
pub struct HoldEntry {
    pub res: ResId,
    pub slot: CPtr,
}

pub struct Pd {
    id: PdId,
    pub name: PdName,
    pub state: PdState,
    pub exit_code: i32,

    // Cascade bookkeeping.
    pub to_delete: bool,
    pub deleting: bool,
    pub deletion_depth: i32,

    // Isolation.
    pub cspace: CNode,
    pub cnode_guard: usize,
    slots: SlotAllocator,
    pub bound_ads: Option<ObjId>,
    pub bound_cpu: Option<ObjId>,
    pub fault_ep: Option<ObjId>,

    // Holds are keyed by the resource part of the badge.
    holds: ResourceRegistry<HoldEntry>,
    // Children destroyed along with this PD.
    pub links: SmallVec<[PdId; 4]>,

    pub work: WorkQueues,
    /// RM->PD doorbell, bound to the PD's CPU.
    pub notification: Notification,

    /// RM-side authoritative copy of the shared init-data frame.
    pub init_data: InitData,
    pub init_data_mo: Option<ObjId>,

    // Work handed out (queued or pulled) but not yet acked; consulted
    // when this PD dies so deferred callers still make progress.
    pub n_critical_outstanding: usize,
    pub n_send_outstanding: usize,
    pub n_extract_outstanding: usize,
}

impl RmObject for Pd {
    fn id(&self) -> ObjId { self.id }
    fn set_id(&mut self, id: ObjId) { self.id = id }
}

impl Pd {
    /// Creates a fresh PD with its own cspace, notification, and empty
    /// registries. The caller supplies the MO backing the shared
    /// init-data frame (absent only for the forged root-task PD).
    pub fn new(
        kernel: &mut dyn KernelInterface,
        init_data_mo: Option<ObjId>,
    ) -> Result<Pd, RmError> {
        let cspace = kernel.create_cnode(PD_CSPACE_SIZE_BITS)?;
        let notification = match kernel.create_notification() {
            Ok(n) => n,
            Err(e) => {
                let _ = kernel.destroy_cnode(cspace);
                return Err(e.into());
            }
        };
        Ok(Pd {
            id: 0,
            name: PdName::new(),
            state: PdState::New,
            exit_code: 0,
            to_delete: false,
            deleting: false,
            deletion_depth: 0,
            cspace,
            cnode_guard: 0,
            slots: SlotAllocator::new(
                PD_FIRST_FREE_SLOT,
                (1 << PD_CSPACE_SIZE_BITS) - PD_FIRST_FREE_SLOT,
            ),
            bound_ads: None,
            bound_cpu: None,
            fault_ep: None,
            holds: ResourceRegistry::new(u64::MAX),
            links: SmallVec::new(),
            work: WorkQueues::new(),
            notification,
            init_data: InitData::new(),
            init_data_mo,
            n_critical_outstanding: 0,
            n_send_outstanding: 0,
            n_extract_outstanding: 0,
        })
    }

    pub fn pd_id(&self) -> PdId { self.id }

    pub fn set_name(&mut self, name: &str) {
        self.name = PdName::from_str(name);
    }

    // -- cspace bookkeeping, exposed so other components can place
    //    caps into the PD --

    pub fn next_slot(&mut self) -> Result<CPtr, RmError> {
        self.slots.alloc(1).ok_or(RmError::OutOfSlots)
    }

    pub fn free_slot(&mut self, slot: CPtr) { self.slots.free(slot, 1) }

    /// Deletes the capability in `slot` and releases the slot.
    pub fn clear_slot(
        &mut self,
        kernel: &mut dyn KernelInterface,
        slot: CPtr,
    ) -> Result<(), RmError> {
        kernel.delete_cap(CSlot::new(self.cspace, slot))?;
        self.slots.free(slot, 1);
        Ok(())
    }

    /// Mints a badged cap to the RM's listen endpoint into this PD.
    pub fn install_badged_cap(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        badge: Badge,
    ) -> Result<CPtr, RmError> {
        let slot = self.next_slot()?;
        if let Err(e) = kernel.mint_badged_endpoint(
            CSlot::new(self.cspace, slot),
            listen_ep,
            badge.raw(),
            CapRights::RW | CapRights::GRANT,
        ) {
            self.free_slot(slot);
            return Err(e.into());
        }
        Ok(slot)
    }

    // -- hold registry --

    /// Records that this PD holds `res`. Duplicate holds are ignored.
    pub fn add_resource(&mut self, res: ResId, slot: CPtr) {
        let _ = self.holds.insert_with_id(res.key(), HoldEntry { res, slot });
    }

    pub fn holds_resource(&self, res: &ResId) -> bool { self.holds.contains(res.key()) }

    /// Forgets a held resource and clears its cap from the cspace.
    /// Returns the hold if there was one; the caller is responsible
    /// for the owning component's refcount.
    pub fn remove_resource(
        &mut self,
        kernel: &mut dyn KernelInterface,
        res: &ResId,
    ) -> Option<HoldEntry> {
        let hold = self.holds.delete(res.key())?;
        if hold.slot != 0 {
            let _ = kernel.delete_cap(CSlot::new(self.cspace, hold.slot));
            self.slots.free(hold.slot, 1);
        }
        Some(hold)
    }

    pub fn has_resources_in_space(&self, space_id: SpaceId) -> bool {
        self.holds.iter().any(|(_, h)| h.res.space_id == space_id)
    }

    /// Strips every hold in `space_id`, returning what was removed.
    pub fn remove_resources_in_space(
        &mut self,
        kernel: &mut dyn KernelInterface,
        space_id: SpaceId,
    ) -> Vec<ResId> {
        let doomed: Vec<ResId> = self
            .holds
            .iter()
            .filter(|(_, h)| h.res.space_id == space_id)
            .map(|(_, h)| h.res)
            .collect();
        for res in &doomed {
            let _ = self.remove_resource(kernel, res);
        }
        doomed
    }

    pub fn resources(&self) -> impl Iterator<Item = &HoldEntry> {
        self.holds.iter().map(|(_, h)| h)
    }

    pub fn resources_of_type(&self, cap_type: CapType) -> Vec<ResId> {
        self.holds
            .iter()
            .filter(|(_, h)| h.res.cap_type == cap_type)
            .map(|(_, h)| h.res)
            .collect()
    }

    pub fn num_held(&self) -> usize { self.holds.len() }

    /// Drains the hold registry for destruction.
    pub fn take_holds(&mut self) -> Vec<HoldEntry> {
        self.holds.drain_all().into_iter().map(|(_, h)| h).collect()
    }

    // -- request directory --

    /// Adds an RDE: resources of `cap_type` in `space_id` are
    /// requested from the endpoint cap in `server_ep_slot` (a slot in
    /// this PD's cspace).
    pub fn add_rde(
        &mut self,
        cap_type: u8,
        type_name: &str,
        space_id: SpaceId,
        server_ep_slot: CPtr,
    ) -> Result<(), RmError> {
        if cap_type == 0 || cap_type as usize >= MAX_CAP_TYPES {
            return Err(RmError::BadBadge);
        }
        let row = &mut self.init_data.rde[cap_type as usize];
        if row
            .iter()
            .any(|e| e.is_valid() && e.space_id == space_id)
        {
            return Ok(()); // already present
        }
        let slot = row
            .iter_mut()
            .find(|e| !e.is_valid())
            .ok_or(RmError::OutOfSlots)?;
        *slot = RdeEntry {
            cap_type,
            space_id,
            server_ep: server_ep_slot,
        };
        self.init_data.set_type_name(cap_type, type_name);
        Ok(())
    }

    /// Removes the RDE for `(cap_type, space_id)`; a null space id
    /// removes every entry of the type. Already-held resources are
    /// not affected.
    pub fn remove_rde(&mut self, cap_type: u8, space_id: SpaceId) {
        if cap_type as usize >= MAX_CAP_TYPES {
            return;
        }
        for entry in &mut self.init_data.rde[cap_type as usize] {
            if entry.is_valid() && (space_id == NULL_SPACE || entry.space_id == space_id) {
                *entry = RdeEntry::default();
            }
        }
    }

    /// Looks up the RDE for `(cap_type, space_id)`; a null space id
    /// returns the first entry of the type.
    pub fn rde_get(&self, cap_type: u8, space_id: SpaceId) -> Option<&RdeEntry> {
        if cap_type as usize >= MAX_CAP_TYPES {
            return None;
        }
        self.init_data.rde[cap_type as usize]
            .iter()
            .find(|e| e.is_valid() && (space_id == NULL_SPACE || e.space_id == space_id))
    }

    /// All valid RDE entries, for model extraction.
    pub fn rde_entries(&self) -> impl Iterator<Item = &RdeEntry> {
        self.init_data
            .rde
            .iter()
            .flat_map(|row| row.iter())
            .filter(|e| e.is_valid())
    }

    pub fn has_rde_for_space(&self, space_id: SpaceId) -> bool {
        self.rde_entries().any(|e| e.space_id == space_id)
    }

    // -- links --

    /// Attaches a child whose lifetime is bounded by this PD.
    pub fn link_child(&mut self, child: PdId) {
        if !self.links.contains(&child) {
            self.links.push(child);
        }
    }

    // -- work --

    /// Queues a work item; the caller signals the notification.
    pub fn enqueue_work(&mut self, action: WorkAction, entry: WorkEntry) {
        trace!("pd {} enqueue {:?} {}", self.id, action, entry.res);
        match action {
            WorkAction::Free | WorkAction::Destroy if entry.is_critical => {
                self.n_critical_outstanding += 1
            }
            WorkAction::Send if entry.is_critical => self.n_send_outstanding += 1,
            WorkAction::Extract => self.n_extract_outstanding += 1,
            _ => {}
        }
        self.work.enqueue(action, entry);
    }

    /// Updates the init-data mirror when a core cap is transferred in.
    pub fn set_core_cap(&mut self, badge: Badge, slot: CPtr) {
        match badge.cap_type() {
            CapType::Pd => self.init_data.self_pd_cap = slot,
            CapType::Ads => self.init_data.self_ads_cap = slot,
            CapType::Cpu => self.init_data.self_cpu_cap = slot,
            CapType::Ep => self.init_data.fault_ep_cap = slot,
            _ => {}
        }
    }
}

pub struct PdComponent {
    pub(crate) core: crate::component::ComponentCore<Pd>,
}

impl PdComponent {
    pub fn new(space_id: SpaceId) -> Self {
        PdComponent {
            core: crate::component::ComponentCore::new(CapType::Pd, space_id),
        }
    }

    /// Creates a PD. Unless `forge_only` (root-task bootstrap), a
    /// badged cap to the new PD lands in the client's cspace and the
    /// client holds it.
    pub fn alloc(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        client_pd_id: PdId,
        init_data_mo: Option<ObjId>,
        forge_only: bool,
    ) -> Result<crate::component::Allocation, RmError> {
        let mut allocation =
            self.core
                .allocate(kernel, listen_ep, None, client_pd_id, true, |kernel| {
                    Pd::new(kernel, init_data_mo)
                })?;
        if !forge_only {
            let badge = allocation.badge;
            let space_id = self.core.space_id();
            let client = self
                .core
                .get_mut(client_pd_id)
                .ok_or(RmError::NotFound)?;
            let slot = client.install_badged_cap(kernel, listen_ep, badge)?;
            client.add_resource(
                ResId::new(CapType::Pd, space_id, allocation.object_id),
                slot,
            );
            allocation.slot = Some(slot);
        }
        Ok(allocation)
    }

    pub fn get(&self, pd_id: PdId) -> Option<&Pd> { self.core.get(pd_id) }
    pub fn get_mut(&mut self, pd_id: PdId) -> Option<&mut Pd> { self.core.get_mut(pd_id) }

    /// Live PD ids, snapshot for cascade walks.
    pub fn live_ids(&self) -> Vec<PdId> {
        self.core.ids().into_iter().map(|id| id as PdId).collect()
    }
}

// Check the RDE table dimensions stay in step with the wire layout.
static_assertions::const_assert_eq!(RDE_SLOTS_PER_TYPE, 8);
