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

//! Cleanup & cascade engine.
//!
//! When a PD terminates, the spaces it managed are destroyed (and,
//! policy permitting, spaces derived from them), every holder loses
//! its resources in those spaces, dependent PDs are marked for
//! deletion up to the configured depth, and the dead PD's holds are
//! released across all components. Untrusted servers are enlisted via
//! FREE/DESTROY work items; when a user-initiated termination has
//! critical items outstanding the caller's reply stays deferred until
//! the last ack arrives.

extern crate alloc;
use alloc::vec::Vec;
use log::{debug, info, warn};
use osmium_os_common::badge::{CapType, PdId, SpaceId, NULL_OBJ};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::message::ReplyBody;
use osmium_rm_interface::model::ResId;
use osmium_rm_interface::work::WorkAction;

use crate::ads::Ads;
use crate::config::CleanupPolicy;
use crate::cpu::Cpu;
use crate::mo::Mo;
use crate::pd::work::WorkEntry;
use crate::pd::Pd;
use crate::server::ResourceManager;

impl ResourceManager {
    // -- refcount plumbing ------------------------------------------

    pub(crate) fn inc_core(&mut self, res: ResId) -> Result<(), RmError> {
        match res.cap_type {
            CapType::Mo => self.mo.core.inc(res.object_id),
            CapType::Ads => self.ads.core.inc(res.object_id),
            CapType::Cpu => self.cpu.core.inc(res.object_id),
            CapType::Ep => self.ep.core.inc(res.object_id),
            CapType::Pd => self.pd.core.inc(res.object_id),
            CapType::Resspc => self.resspc.core.inc(res.object_id),
            CapType::None | CapType::User(_) => Err(RmError::WrongType),
        }
    }

    /// Drops one reference on a core resource and runs its destruction
    /// when the count hits zero. Unknown ids are a no-op (the object
    /// is already going down elsewhere in the cascade).
    pub(crate) fn dec_core(&mut self, res: ResId) {
        match res.cap_type {
            CapType::Mo => {
                if let Some(mo) = self.mo.core.dec(res.object_id) {
                    self.finish_mo(mo);
                }
            }
            CapType::Ads => {
                if let Some(ads) = self.ads.core.dec(res.object_id) {
                    self.finish_ads(ads);
                }
            }
            CapType::Cpu => {
                if let Some(cpu) = self.cpu.core.dec(res.object_id) {
                    self.finish_cpu(cpu);
                }
            }
            CapType::Ep => {
                if let Some(ep) = self.ep.core.dec(res.object_id) {
                    let Self { kernel, ep: epc, .. } = self;
                    epc.release(kernel.as_mut(), ep);
                }
            }
            CapType::Pd => {
                if let Some(pd) = self.pd.core.dec(res.object_id) {
                    // Last reference to a process record; run the full
                    // cascade for it.
                    self.destroy_pd_object(res.object_id as PdId, pd, 0, false);
                }
            }
            CapType::Resspc => {
                if let Some(space) = self.resspc.core.dec(res.object_id) {
                    self.space_cleanup_object(space, 0, false, None);
                }
            }
            CapType::None | CapType::User(_) => {}
        }
    }

    /// Removes a hold record from a PD (clearing the cap slot) without
    /// touching refcounts.
    pub(crate) fn remove_hold(&mut self, pd_id: PdId, res: &ResId) {
        let Self { kernel, pd, .. } = self;
        if let Some(p) = pd.get_mut(pd_id) {
            let _ = p.remove_resource(kernel.as_mut(), res);
        }
    }

    // -- object destruction -----------------------------------------

    /// Tears down an MO whose references are gone: unmaps any ranges
    /// still attached, then frees the frames exactly once.
    pub(crate) fn finish_mo(&mut self, mut mo_obj: Mo) {
        let attachments = core::mem::take(&mut mo_obj.attachments);
        let mo_num_pages = mo_obj.num_pages();
        for (ads_id, vaddr) in attachments {
            let Self { kernel, ads, .. } = self;
            if let Some(a) = ads.core.get_mut(ads_id) {
                if let Some(vmr) = a.vmrs.remove(&vaddr) {
                    for i in 0..vmr.mapped_pages(mo_num_pages) {
                        let _ = kernel.unmap_frame(a.vspace, vaddr + (i << vmr.page_bits));
                    }
                }
            }
        }
        let Self { kernel, mo, .. } = self;
        mo.release(kernel.as_mut(), mo_obj);
    }

    /// Tears down an ADS: unmaps every attached range, drops the
    /// attachment references, destroys the vspace.
    pub(crate) fn finish_ads(&mut self, mut ads_obj: Ads) {
        let ads_id = crate::component::RmObject::id(&ads_obj);
        let vmrs = core::mem::take(&mut ads_obj.vmrs);
        for (vaddr, vmr) in vmrs {
            if let Some(mo_id) = vmr.mo_id {
                let mapped = self
                    .mo
                    .core
                    .get(mo_id)
                    .map_or(vmr.num_pages, |m| vmr.mapped_pages(m.num_pages()));
                for i in 0..mapped {
                    let _ = self
                        .kernel
                        .unmap_frame(ads_obj.vspace, vaddr + (i << vmr.page_bits));
                }
                if let Some(mo) = self.mo.core.get_mut(mo_id) {
                    mo.remove_attachment(ads_id, vaddr);
                }
                self.dec_core(ResId::new(
                    CapType::Mo,
                    crate::server::MO_SPACE_ID,
                    mo_id,
                ));
            }
        }
        let _ = self.kernel.destroy_vspace(ads_obj.vspace);
    }

    /// Tears down a CPU: the thread is suspended and destroyed, then
    /// the references it held on its ADS and IPC buffer go away.
    pub(crate) fn finish_cpu(&mut self, cpu_obj: Cpu) {
        let _ = self.kernel.suspend_tcb(cpu_obj.tcb);
        let _ = self.kernel.destroy_tcb(cpu_obj.tcb);
        if let Some(ads_id) = cpu_obj.bound_ads {
            self.dec_core(ResId::new(CapType::Ads, crate::server::ADS_SPACE_ID, ads_id));
        }
        if let Some(mo_id) = cpu_obj.bound_ipc_mo {
            self.dec_core(ResId::new(CapType::Mo, crate::server::MO_SPACE_ID, mo_id));
        }
    }

    // -- termination ------------------------------------------------

    /// Destroys `victim` and cascades per the configured policy. When
    /// `user_initiated`, work items enlisted from servers are critical
    /// and the caller's reply must be deferred while
    /// `termination.n_missing` is non-zero.
    pub(crate) fn terminate_pd(
        &mut self,
        victim: PdId,
        user_initiated: bool,
    ) -> Result<(), RmError> {
        // A user-facing terminate may not overlap a pending extraction
        // or another deferred termination. A self-exit always goes
        // through: crediting a dead participant is what lets deferred
        // callers make progress.
        if user_initiated
            && (self.extraction.is_pending() || self.termination.deferred.is_some())
        {
            return Err(RmError::OperationInProgress);
        }
        if !self.pd.core.contains(victim) {
            return Err(RmError::NotFound);
        }
        if victim == self.rt_pd_id {
            return Err(RmError::InvalidState);
        }
        self.destroy_pd(victim, 0, user_initiated);
        self.sweep(user_initiated);
        Ok(())
    }

    /// After the synchronous pass: any PD stamped `to_delete` by the
    /// cascade is destroyed in turn, until a pass finds none.
    pub(crate) fn sweep(&mut self, user_initiated: bool) {
        loop {
            let next = self
                .pd
                .core
                .iter()
                .find(|(_, p)| p.to_delete && !p.deleting)
                .map(|(id, p)| (id as PdId, p.deletion_depth));
            match next {
                Some((id, depth)) => self.destroy_pd(id, depth, user_initiated),
                None => break,
            }
        }
    }

    fn destroy_pd(&mut self, pd_id: PdId, depth: i32, user_initiated: bool) {
        // PD-registry deletion is the one place exit handling can
        // re-enter; serialize it.
        let pd = {
            let _guard = self.pd_delete_lock.lock();
            self.pd.core.remove(pd_id)
        };
        match pd {
            Some(pd) => self.destroy_pd_object(pd_id, pd, depth, user_initiated),
            None => {} // already being destroyed
        }
    }

    pub(crate) fn destroy_pd_object(
        &mut self,
        pd_id: PdId,
        mut pd: Pd,
        depth: i32,
        user_initiated: bool,
    ) {
        if pd.deleting {
            return;
        }
        pd.deleting = true;
        info!("destroying pd {} ({}) depth {}", pd_id, pd.name.as_str(), depth);

        // A dying server can no longer ack; credit whatever it owes so
        // deferred callers always make progress.
        if pd.n_critical_outstanding > 0 {
            debug!(
                "pd {} dies owing {} critical acks",
                pd_id, pd.n_critical_outstanding
            );
            self.termination.n_missing = self
                .termination
                .n_missing
                .saturating_sub(pd.n_critical_outstanding);
        }
        if pd.n_send_outstanding > 0 {
            self.send_transfer.n_missing = self
                .send_transfer
                .n_missing
                .saturating_sub(pd.n_send_outstanding);
        }
        if pd.n_extract_outstanding > 0 {
            self.extraction.n_missing = self
                .extraction
                .n_missing
                .saturating_sub(pd.n_extract_outstanding);
        }

        // 1. Spaces this PD managed.
        for space_id in self.resspc.spaces_managed_by(pd_id) {
            self.space_cleanup(space_id, depth, user_initiated, Some(pd_id));
        }

        // 2. Everything it held.
        for hold in pd.take_holds() {
            match hold.res.cap_type {
                CapType::User(_) => {
                    // The managing server drops its internal state; the
                    // RM's bookkeeping is already done.
                    if let Some(space) = self.resspc.get(hold.res.space_id) {
                        let manager = space.managing_pd;
                        self.enqueue_work_on(
                            manager,
                            WorkAction::Free,
                            WorkEntry {
                                res: hold.res,
                                client_pd: pd_id,
                                is_critical: user_initiated,
                            },
                        );
                    }
                }
                CapType::None => {}
                _ => self.dec_core(hold.res),
            }
        }

        // 3. Linked children die with this PD.
        for child in core::mem::take(&mut pd.links) {
            if let Some(c) = self.pd.get_mut(child) {
                if !c.deleting {
                    c.to_delete = true;
                    c.deletion_depth = depth + 1;
                }
            }
        }

        // 4. PD-internal resources.
        if let Some(mo_id) = pd.init_data_mo {
            self.dec_core(ResId::new(CapType::Mo, crate::server::MO_SPACE_ID, mo_id));
        }
        let _ = self.kernel.destroy_cnode(pd.cspace);
        let _ = self.kernel.destroy_notification(pd.notification);

        self.maybe_release_termination();
        self.maybe_release_send();
        self.maybe_release_extraction();
    }

    // -- space cleanup ----------------------------------------------

    /// Destroys a resource space and applies the cleanup policy to its
    /// holders and dependents. `dying_pd` is the PD whose destruction
    /// triggered this (already out of the registry), if any.
    pub(crate) fn space_cleanup(
        &mut self,
        space_id: SpaceId,
        depth: i32,
        user_initiated: bool,
        dying_pd: Option<PdId>,
    ) {
        match self.resspc.core.remove(space_id as u32) {
            Some(space) => self.space_cleanup_object(space, depth, user_initiated, dying_pd),
            None => {}
        }
    }

    fn space_cleanup_object(
        &mut self,
        space: crate::resspc::ResourceSpace,
        depth: i32,
        user_initiated: bool,
        dying_pd: Option<PdId>,
    ) {
        let space_id = space.space_id();
        debug!(
            "space {} ({}) cleanup at depth {}",
            space_id,
            space.type_name.as_str(),
            depth
        );
        let space_res = ResId::new(
            CapType::Resspc,
            crate::server::RESSPC_SPACE_ID,
            space_id as u32,
        );

        // The managing server releases its internal state for the
        // space, unless it is the one dying.
        if Some(space.managing_pd) != dying_pd {
            self.remove_hold(space.managing_pd, &space_res);
            self.enqueue_work_on(
                space.managing_pd,
                WorkAction::Destroy,
                WorkEntry {
                    res: ResId::new(space.resource_type, space_id, NULL_OBJ),
                    client_pd: space.managing_pd,
                    is_critical: user_initiated,
                },
            );
        }

        if self.policy.strips_holders() {
            // Dependent PDs are stamped for deletion before their
            // holds (the evidence) are stripped.
            let dep_limit = match self.policy {
                CleanupPolicy::DependentsDirect => Some(1),
                CleanupPolicy::DependentsRecursive => Some(self.max_cleanup_depth),
                _ => None,
            };
            if let Some(limit) = dep_limit {
                if limit < 0 || depth + 1 <= limit {
                    for pd_id in self.pd.live_ids() {
                        if pd_id == self.rt_pd_id {
                            continue;
                        }
                        let p = match self.pd.get_mut(pd_id) {
                            Some(p) => p,
                            None => continue,
                        };
                        if p.deleting || p.to_delete {
                            continue;
                        }
                        if p.has_rde_for_space(space_id) || p.has_resources_in_space(space_id)
                        {
                            p.to_delete = true;
                            p.deletion_depth = depth + 1;
                        }
                    }
                }
            }

            // All other live PDs lose their RDE and their holds in
            // this space.
            for pd_id in self.pd.live_ids() {
                let removed: Vec<ResId> = {
                    let Self { kernel, pd, .. } = self;
                    match pd.get_mut(pd_id) {
                        Some(p) => {
                            p.remove_rde(u8::from(space.resource_type), space_id);
                            p.remove_resources_in_space(kernel.as_mut(), space_id)
                        }
                        None => Vec::new(),
                    }
                };
                for res in removed {
                    if res.cap_type.is_core() {
                        self.dec_core(res);
                    }
                }
                let _ = self.flush_init_data(pd_id);
            }

            // Spaces whose resources derive from this one go down
            // with it.
            for derived in self.resspc.spaces_mapping_onto(space_id) {
                self.space_cleanup(derived, depth + 1, user_initiated, dying_pd);
            }
        } else {
            // RESOURCES_DIRECT: the space is gone so requests must
            // stop, but holders keep whatever access they had.
            for pd_id in self.pd.live_ids() {
                if let Some(p) = self.pd.get_mut(pd_id) {
                    p.remove_rde(u8::from(space.resource_type), space_id);
                }
                let _ = self.flush_init_data(pd_id);
            }
        }
    }

    // -- acks and deferred replies ----------------------------------

    /// `finish_work` from a server: credit the acked items against the
    /// matching counter and release the deferred reply at zero.
    pub(crate) fn handle_finish_work(
        &mut self,
        server: PdId,
        work_type: WorkAction,
        n_critical: usize,
    ) {
        match work_type {
            WorkAction::Free | WorkAction::Destroy => {
                if n_critical > self.termination.n_missing {
                    warn!(
                        "pd {} acked {} critical, only {} missing",
                        server, n_critical, self.termination.n_missing
                    );
                }
                self.termination.n_missing =
                    self.termination.n_missing.saturating_sub(n_critical);
                if let Some(p) = self.pd.get_mut(server) {
                    p.n_critical_outstanding =
                        p.n_critical_outstanding.saturating_sub(n_critical);
                }
                self.maybe_release_termination();
            }
            WorkAction::Send => {
                self.send_transfer.n_missing =
                    self.send_transfer.n_missing.saturating_sub(n_critical);
                if let Some(p) = self.pd.get_mut(server) {
                    p.n_send_outstanding = p.n_send_outstanding.saturating_sub(n_critical);
                }
                self.maybe_release_send();
            }
            WorkAction::Extract | WorkAction::NoWork => {}
        }
    }

    pub(crate) fn maybe_release_termination(&mut self) {
        if self.termination.n_missing == 0 {
            if let Some(reply) = self.termination.deferred.take() {
                debug!("releasing deferred termination reply");
                let body = osmium_rm_interface::message::RmReply::success(ReplyBody::None);
                let _ = self.kernel.send_reply(
                    reply,
                    usize::from(RmError::Success),
                    &body.encode(),
                );
            }
        }
    }

    pub(crate) fn maybe_release_send(&mut self) {
        if self.send_transfer.n_missing == 0 {
            if let Some(reply) = self.send_transfer.deferred.take() {
                debug!("releasing deferred send reply");
                let body = self
                    .send_transfer
                    .pending_body
                    .take()
                    .unwrap_or(ReplyBody::None);
                let body = osmium_rm_interface::message::RmReply::success(body);
                let _ = self.kernel.send_reply(
                    reply,
                    usize::from(RmError::Success),
                    &body.encode(),
                );
            }
        }
    }
}
