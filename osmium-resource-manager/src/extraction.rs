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

//! Model extraction.
//!
//! `dump` builds a whole-system graph: the RM seeds it from its own
//! registries (PDs, core resources, spaces, hold/request/subset/map
//! edges), then enlists every server managing extractable pieces with
//! an EXTRACT work item. While contributions are outstanding the
//! requester's reply is deferred; each `send_subgraph` merges a
//! delivered subgraph and decrements the missing count, and the last
//! one releases the reply with the serialized graph in a fresh MO.

extern crate alloc;
use alloc::vec::Vec;
use log::{debug, info, warn};
use osmium_os_common::badge::{Badge, CapType, PdId, NULL_OBJ};
use osmium_os_common::caps::PAGE_BITS;
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::message::{ReplyBody, RmReply};
use osmium_rm_interface::model::{EdgeKind, ModelState, NodeRef, ResId};
use osmium_rm_interface::work::WorkAction;

use crate::pd::work::WorkEntry;
use crate::server::{Disposition, ResourceManager, RESSPC_SPACE_ID};

impl ResourceManager {
    /// Entry point for `dump`. Either replies immediately (nothing to
    /// extract from servers) or defers until all subgraphs arrive.
    pub(crate) fn start_dump(&mut self, requester: PdId) -> Result<Disposition, RmError> {
        if self.extraction.is_pending() || self.extraction.deferred.is_some() {
            return Err(RmError::OperationInProgress);
        }
        if self.termination.deferred.is_some() || self.termination.n_missing > 0 {
            return Err(RmError::OperationInProgress);
        }

        let model = self.seed_model();

        // Enlist every server that manages extractable pieces.
        let user_spaces: Vec<(PdId, ResId)> = self
            .resspc
            .core
            .iter()
            .filter(|(_, s)| !s.resource_type.is_core())
            .map(|(_, s)| {
                (
                    s.managing_pd,
                    ResId::new(s.resource_type, s.space_id(), NULL_OBJ),
                )
            })
            .collect();
        for (manager, res) in user_spaces {
            self.enqueue_work_on(
                manager,
                WorkAction::Extract,
                WorkEntry {
                    res,
                    client_pd: requester,
                    is_critical: false,
                },
            );
        }

        if self.extraction.n_missing == 0 {
            info!("model extraction complete (no external pieces)");
            let body = self.finalize_model(requester, &model)?;
            return Ok(Disposition::Reply(body));
        }

        debug!(
            "model extraction waiting on {} subgraphs",
            self.extraction.n_missing
        );
        self.extraction.model = Some(model);
        self.extraction.requester = requester;
        self.extraction.deferred = Some(self.kernel.save_reply()?);
        Ok(Disposition::Deferred)
    }

    /// The RM's own contribution: everything its registries know.
    fn seed_model(&self) -> ModelState {
        let mut model = ModelState::new();

        // Spaces are resources; also MAP edges between spaces.
        for (_, space) in self.resspc.core.iter() {
            let space_res = ResId::new(CapType::Resspc, RESSPC_SPACE_ID, space.space_id() as u32);
            model.add_resource(space_res);
            if let Some(target) = space.map_space {
                model.add_edge(
                    EdgeKind::Map,
                    NodeRef::Resource(space_res),
                    NodeRef::Resource(ResId::new(CapType::Resspc, RESSPC_SPACE_ID, target as u32)),
                );
            }
            // Members registered by servers.
            for member in &space.members {
                let res = ResId::new(space.resource_type, space.space_id(), *member);
                model.add_resource(res);
                model.add_edge(
                    EdgeKind::Subset,
                    NodeRef::Resource(res),
                    NodeRef::Resource(space_res),
                );
            }
        }

        // Core resources and their SUBSET edges.
        let mut add_core = |model: &mut ModelState, cap_type: CapType, space, ids: Vec<u64>| {
            let space_res = ResId::new(CapType::Resspc, RESSPC_SPACE_ID, space as u32);
            for id in ids {
                let res = ResId::new(cap_type, space, id as u32);
                model.add_resource(res);
                model.add_edge(
                    EdgeKind::Subset,
                    NodeRef::Resource(res),
                    NodeRef::Resource(space_res),
                );
            }
        };
        add_core(
            &mut model,
            CapType::Mo,
            crate::server::MO_SPACE_ID,
            self.mo.core.ids(),
        );
        add_core(
            &mut model,
            CapType::Ads,
            crate::server::ADS_SPACE_ID,
            self.ads.core.ids(),
        );
        add_core(
            &mut model,
            CapType::Cpu,
            crate::server::CPU_SPACE_ID,
            self.cpu.core.ids(),
        );
        add_core(
            &mut model,
            CapType::Ep,
            crate::server::EP_SPACE_ID,
            self.ep.core.ids(),
        );

        // PDs: HOLD edges from the hold registries, REQUEST edges from
        // the request directories.
        for (id, pd) in self.pd.core.iter() {
            let pd_id = id as PdId;
            model.add_pd(pd_id, pd.name.as_str());
            for hold in pd.resources() {
                model.add_resource(hold.res);
                model.add_edge(
                    EdgeKind::Hold,
                    NodeRef::Pd(pd_id),
                    NodeRef::Resource(hold.res),
                );
            }
            for rde in pd.rde_entries() {
                if let Some(space) = self.resspc.get(rde.space_id) {
                    model.add_edge(
                        EdgeKind::Request,
                        NodeRef::Pd(pd_id),
                        NodeRef::Pd(space.managing_pd),
                    );
                }
            }
        }
        model
    }

    /// A server's `send_subgraph` reply: merge its contribution and
    /// release the requester once nothing is missing.
    pub(crate) fn handle_send_subgraph(
        &mut self,
        server: PdId,
        has_data: bool,
        n_requests: usize,
        mo_badge: Option<Badge>,
    ) -> Result<Disposition, RmError> {
        if !self.extraction.is_pending() {
            return Err(RmError::InvalidState);
        }

        if has_data {
            let mo_badge = mo_badge.ok_or(RmError::BadBadge)?;
            let mo_id = mo_badge.object_id();
            let len = self
                .mo
                .core
                .get(mo_id)
                .ok_or(RmError::NotFound)?
                .size_bytes();
            // The delivered MO is mapped into the RM only long enough
            // to copy the subgraph out.
            let bytes = {
                let Self { kernel, mo, .. } = self;
                mo.read_bytes(kernel.as_mut(), mo_id, len)?
            };
            let sub = ModelState::from_bytes(&bytes).map_err(|_| RmError::DeserializeFailed)?;
            if let Some(model) = self.extraction.model.as_mut() {
                model.merge(&sub);
            }
        }

        if n_requests > self.extraction.n_missing {
            warn!(
                "pd {} satisfied {} requests, only {} missing",
                server, n_requests, self.extraction.n_missing
            );
        }
        self.extraction.n_missing = self.extraction.n_missing.saturating_sub(n_requests);
        if let Some(p) = self.pd.get_mut(server) {
            p.n_extract_outstanding = p.n_extract_outstanding.saturating_sub(n_requests);
        }

        self.maybe_release_extraction();
        Ok(Disposition::Reply(ReplyBody::None))
    }

    pub(crate) fn maybe_release_extraction(&mut self) {
        if self.extraction.n_missing > 0 {
            debug!(
                "model extraction still missing {} pieces",
                self.extraction.n_missing
            );
            return;
        }
        if self.extraction.model.is_none() {
            return;
        }
        let model = self.extraction.model.take().unwrap();
        let requester = self.extraction.requester;
        let reply = self.extraction.deferred.take();
        match self.finalize_model(requester, &model) {
            Ok(body) => {
                if let Some(reply) = reply {
                    let encoded = RmReply::success(body).encode();
                    let _ = self
                        .kernel
                        .send_reply(reply, usize::from(RmError::Success), &encoded);
                }
            }
            Err(err) => {
                warn!("finalizing extraction failed: {:?}", err);
                if let Some(reply) = reply {
                    let encoded = RmReply::failure(err).encode();
                    let _ = self.kernel.send_reply(reply, usize::from(err), &encoded);
                }
            }
        }
    }

    /// Serializes the finished graph into a fresh MO owned by the
    /// requester and builds the reply.
    fn finalize_model(
        &mut self,
        requester: PdId,
        model: &ModelState,
    ) -> Result<ReplyBody, RmError> {
        info!("extracted model:\n{}", model);
        let bytes = model.to_bytes().map_err(|_| RmError::SerializeFailed)?;
        let num_pages = (bytes.len() >> PAGE_BITS) + 1;

        let alloc = {
            let Self {
                kernel,
                mo,
                pd,
                listen_ep,
                ..
            } = self;
            let requester_pd = pd.get_mut(requester).ok_or(RmError::NotFound)?;
            mo.alloc(
                kernel.as_mut(),
                *listen_ep,
                Some(requester_pd),
                requester,
                num_pages,
                PAGE_BITS,
            )?
        };
        {
            let Self { kernel, mo, .. } = self;
            mo.write_bytes(kernel.as_mut(), alloc.object_id, &bytes)?;
        }
        Ok(ReplyBody::Model {
            num_pds: model.num_pds(),
            num_resources: model.num_resources(),
            num_edges: model.num_edges(),
            mo_slot: alloc.slot.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::tests::{alloc_entry, alloc_pd, call, obj_badge};
    use crate::server::{
        BootConfig, ResourceManager, EP_SPACE_ID, MO_SPACE_ID, PD_SPACE_ID,
    };
    use crate::testutil::SharedKernel;
    use osmium_os_common::badge::SpaceId;
    use osmium_rm_interface::message::{
        EpRequest, MoRequest, PdRequest, ReplyBody, ResspcRequest, RmReply, RmRequest,
    };
    use osmium_rm_interface::work::WorkReply;

    fn boot_shared() -> (ResourceManager, SharedKernel) {
        let kernel = SharedKernel::new();
        let rm =
            ResourceManager::new(Box::new(kernel.clone()), BootConfig::default()).unwrap();
        (rm, kernel)
    }

    fn make_space(rm: &mut ResourceManager, manager: PdId, name: &str) -> (SpaceId, u8) {
        let reply = call(
            rm,
            alloc_entry(CapType::Ep, EP_SPACE_ID, manager),
            &[],
            &RmRequest::Ep(EpRequest::Alloc),
        );
        let ep_id = match reply.body {
            ReplyBody::EpAllocated { object_id, .. } => object_id,
            other => panic!("unexpected body {:?}", other),
        };
        let ep_badge = obj_badge(CapType::Ep, EP_SPACE_ID, ep_id, manager);
        let reply = call(
            rm,
            alloc_entry(CapType::Resspc, crate::server::RESSPC_SPACE_ID, manager),
            &[ep_badge.raw()],
            &RmRequest::Resspc(ResspcRequest::Alloc {
                type_name: name.into(),
                cap_type: None,
                map_space_id: None,
            }),
        );
        match reply.body {
            ReplyBody::SpaceCreated {
                space_id, cap_type, ..
            } => (space_id, cap_type),
            other => panic!("unexpected body {:?}", other),
        }
    }

    fn dump(rm: &mut ResourceManager, requester: PdId) -> Option<Vec<u8>> {
        let bytes = postcard::to_allocvec(&RmRequest::Pd(PdRequest::Dump)).unwrap();
        rm.handle_message(
            obj_badge(CapType::Pd, PD_SPACE_ID, requester, requester).raw(),
            &[],
            &bytes,
        )
    }

    #[test]
    fn test_dump_without_servers_replies_immediately() {
        let (mut rm, _kernel) = boot_shared();
        let rt = rm.rt_pd_id();
        let reply = dump(&mut rm, rt).expect("immediate reply");
        let reply = RmReply::decode(&reply).unwrap();
        assert_eq!(reply.error, RmError::Success);
        match reply.body {
            ReplyBody::Model {
                num_pds,
                num_resources,
                num_edges,
                mo_slot,
            } => {
                assert_eq!(num_pds, 1); // the root task
                assert!(num_resources >= 6); // the six core spaces
                assert!(num_edges >= 6); // rt holds each space
                assert_ne!(mo_slot, 0);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_distributed_extraction_merges_subgraphs() {
        let (mut rm, kernel) = boot_shared();
        let rt = rm.rt_pd_id();
        let server = alloc_pd(&mut rm);
        let client = alloc_pd(&mut rm);
        let (space, cap_type) = make_space(&mut rm, server, "kvstore");

        // The requester's reply is deferred on the server's subgraph.
        let reply = dump(&mut rm, rt);
        assert!(reply.is_none());
        assert_eq!(rm.extraction.n_missing, 1);
        // The server was woken for it.
        let ntfn = rm.pd.get(server).unwrap().notification;
        assert!(kernel.borrow().signal_count(ntfn) >= 1);

        // The server drains its queue and finds the EXTRACT request.
        let reply = call(
            &mut rm,
            obj_badge(CapType::Pd, PD_SPACE_ID, server, server),
            &[],
            &RmRequest::Pd(PdRequest::GetWork),
        );
        match reply.body {
            ReplyBody::Work(WorkReply { action, space_ids, .. }) => {
                assert_eq!(action, WorkAction::Extract);
                assert_eq!(space_ids, &[space]);
            }
            other => panic!("unexpected body {:?}", other),
        }

        // It builds a subgraph: one resource held by the client.
        let mut sub = ModelState::new();
        let res = ResId::new(CapType::from(cap_type), space, 77);
        sub.add_resource(res);
        sub.add_pd(client, "kv-client");
        sub.add_edge(EdgeKind::Hold, NodeRef::Pd(client), NodeRef::Resource(res));
        let sub_bytes = sub.to_bytes().unwrap();

        // Delivered through an MO the server allocates.
        let reply = call(
            &mut rm,
            alloc_entry(CapType::Mo, MO_SPACE_ID, server),
            &[],
            &RmRequest::Mo(MoRequest::Alloc {
                num_pages: 1,
                page_bits: 12,
            }),
        );
        let mo_id = match reply.body {
            ReplyBody::Allocated { object_id, .. } => object_id,
            other => panic!("unexpected body {:?}", other),
        };
        {
            let ResourceManager { kernel, mo, .. } = &mut rm;
            mo.write_bytes(kernel.as_mut(), mo_id, &sub_bytes).unwrap();
        }

        let mo_badge = obj_badge(CapType::Mo, MO_SPACE_ID, mo_id, server);
        let reply = call(
            &mut rm,
            obj_badge(CapType::Pd, PD_SPACE_ID, server, server),
            &[mo_badge.raw()],
            &RmRequest::Pd(PdRequest::SendSubgraph {
                has_data: true,
                n_requests: 1,
            }),
        );
        assert_eq!(reply.error, RmError::Success);
        assert_eq!(rm.extraction.n_missing, 0);

        // The deferred reply carries the merged model.
        let replies = kernel.borrow().sent_replies().to_vec();
        assert_eq!(replies.len(), 1);
        let decoded = RmReply::decode(&replies[0].body).unwrap();
        assert_eq!(decoded.error, RmError::Success);
        match decoded.body {
            ReplyBody::Model {
                num_pds, num_edges, ..
            } => {
                // rt + server + client, with the server's HOLD edge
                // merged in.
                assert!(num_pds >= 3);
                assert!(num_edges > 6);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_dump_while_termination_pending() {
        let (mut rm, _kernel) = boot_shared();
        let rt = rm.rt_pd_id();
        let server = alloc_pd(&mut rm);
        let other = alloc_pd(&mut rm);
        let (space, cap_type) = make_space(&mut rm, server, "blocks");
        // Give `other` a resource so terminating it enlists the server
        // critically.
        let reply = call(
            &mut rm,
            obj_badge(CapType::Pd, PD_SPACE_ID, server, server),
            &[],
            &RmRequest::Pd(PdRequest::GiveResource {
                recipient_pd: other,
                space_id: space,
                object_id: 5,
            }),
        );
        assert_eq!(reply.error, RmError::Success);
        let _ = cap_type;

        let bytes = postcard::to_allocvec(&RmRequest::Pd(PdRequest::Terminate)).unwrap();
        let reply = rm.handle_message(
            obj_badge(CapType::Pd, PD_SPACE_ID, other, rt).raw(),
            &[],
            &bytes,
        );
        assert!(reply.is_none()); // deferred on the FREE ack

        // Scenario: during a pending termination, dump is refused.
        let reply = dump(&mut rm, rt).expect("error reply");
        let reply = RmReply::decode(&reply).unwrap();
        assert_eq!(reply.error, RmError::OperationInProgress);
    }

    #[test]
    fn test_terminate_while_extraction_pending() {
        let (mut rm, _kernel) = boot_shared();
        let rt = rm.rt_pd_id();
        let server = alloc_pd(&mut rm);
        let victim = alloc_pd(&mut rm);
        let (_space, _) = make_space(&mut rm, server, "files");

        let reply = dump(&mut rm, rt);
        assert!(reply.is_none());

        // Scenario: during a pending extraction, terminate is refused.
        let bytes = postcard::to_allocvec(&RmRequest::Pd(PdRequest::Terminate)).unwrap();
        let reply = rm
            .handle_message(
                obj_badge(CapType::Pd, PD_SPACE_ID, victim, rt).raw(),
                &[],
                &bytes,
            )
            .expect("error reply");
        let reply = RmReply::decode(&reply).unwrap();
        assert_eq!(reply.error, RmError::OperationInProgress);
    }

    #[test]
    fn test_dead_server_unblocks_extraction() {
        let (mut rm, kernel) = boot_shared();
        let rt = rm.rt_pd_id();
        let server = alloc_pd(&mut rm);
        let (_space, _) = make_space(&mut rm, server, "files");

        let reply = dump(&mut rm, rt);
        assert!(reply.is_none());
        assert_eq!(rm.extraction.n_missing, 1);

        // The server crashes before contributing; the requester still
        // gets the (partial) model.
        let bytes = postcard::to_allocvec(&RmRequest::Pd(PdRequest::Exit { exit_code: -1 }))
            .unwrap();
        let _ = rm.handle_message(
            obj_badge(CapType::Pd, PD_SPACE_ID, server, server).raw(),
            &[],
            &bytes,
        );
        assert_eq!(rm.extraction.n_missing, 0);
        assert!(!rm.extraction.is_pending());

        let replies = kernel.borrow().sent_replies().to_vec();
        assert_eq!(replies.len(), 1);
        let decoded = RmReply::decode(&replies[0].body).unwrap();
        assert_eq!(decoded.error, RmError::Success);
    }

    #[test]
    fn test_subgraph_without_pending_extraction() {
        let (mut rm, _kernel) = boot_shared();
        let server = alloc_pd(&mut rm);
        let reply = call(
            &mut rm,
            obj_badge(CapType::Pd, PD_SPACE_ID, server, server),
            &[],
            &RmRequest::Pd(PdRequest::SendSubgraph {
                has_data: false,
                n_requests: 1,
            }),
        );
        assert_eq!(reply.error, RmError::InvalidState);
    }
}
