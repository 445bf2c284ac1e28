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

//! The server side of the RM's asynchronous work protocol.

extern crate alloc;
use log::{trace, warn};
use osmium_os_common::badge::{ObjId, PdId, SpaceId};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::model::ModelState;
use osmium_rm_interface::work::{WorkAction, WorkReply};

/// Calls a server makes back to the Resource Manager. Implemented by
/// the component glue over IPC; tests wire it straight to a manager.
pub trait RmConnection {
    fn get_work(&mut self) -> Result<WorkReply, RmError>;
    fn finish_work(&mut self, work_type: WorkAction, n_critical: usize)
        -> Result<(), RmError>;
    /// Delivers an extraction contribution; `None` acks the requests
    /// without data.
    fn send_subgraph(
        &mut self,
        subgraph: Option<&ModelState>,
        n_requests: usize,
    ) -> Result<(), RmError>;
}

/// What a resource server must be able to do on the RM's behalf.
pub trait ResourceServerInterface {
    /// Builds a subgraph describing the named spaces (or specific
    /// objects) this server manages.
    fn extract(
        &mut self,
        space_ids: &[SpaceId],
        object_ids: &[ObjId],
    ) -> Result<ModelState, RmError>;

    /// Drops internal references to the listed resources; the RM has
    /// already done its bookkeeping.
    fn free(&mut self, space_ids: &[SpaceId], object_ids: &[ObjId]) -> Result<(), RmError>;

    /// Tears down the listed objects, or whole spaces when the object
    /// id is null.
    fn destroy(&mut self, space_ids: &[SpaceId], object_ids: &[ObjId])
        -> Result<(), RmError>;

    /// Observes that `clients` now hold the listed resources.
    fn observe_send(&mut self, object_ids: &[ObjId], clients: &[PdId]);
}

/// Drains the work queues after a notification wake: repeats
/// `get_work` until `NoWork`, dispatching each batch and acking it.
/// Returns the number of batches handled. A failing handler still
/// acks (the RM's deferred callers must make progress); the failure
/// is the server's problem to log.
pub fn process_pending_work<S: ResourceServerInterface, C: RmConnection>(
    server: &mut S,
    conn: &mut C,
) -> Result<usize, RmError> {
    let mut handled = 0;
    loop {
        let batch = conn.get_work()?;
        trace!("work batch {:?}", batch.action);
        match batch.action {
            WorkAction::NoWork => break,
            WorkAction::Extract => {
                let n_requests = batch.object_ids.len();
                match server.extract(&batch.space_ids, &batch.object_ids) {
                    Ok(graph) => conn.send_subgraph(Some(&graph), n_requests)?,
                    Err(err) => {
                        warn!("extract failed: {:?}", err);
                        conn.send_subgraph(None, n_requests)?;
                    }
                }
            }
            WorkAction::Free => {
                if let Err(err) = server.free(&batch.space_ids, &batch.object_ids) {
                    warn!("free failed: {:?}", err);
                }
                conn.finish_work(WorkAction::Free, batch.n_critical)?;
            }
            WorkAction::Destroy => {
                if let Err(err) = server.destroy(&batch.space_ids, &batch.object_ids) {
                    warn!("destroy failed: {:?}", err);
                }
                conn.finish_work(WorkAction::Destroy, batch.n_critical)?;
            }
            WorkAction::Send => {
                server.observe_send(&batch.object_ids, &batch.pd_ids);
                conn.finish_work(WorkAction::Send, batch.n_critical)?;
            }
        }
        handled += 1;
    }
    Ok(handled)
}
