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

//! Per-PD asynchronous work queues.
//!
//! One FIFO per work kind. `get_work` drains the first non-empty
//! queue as a single batch; DESTROY drains ahead of FREE so a server
//! observes a destroy enqueued before a free in that order.

extern crate alloc;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use osmium_os_common::badge::PdId;
use osmium_rm_interface::model::ResId;
use osmium_rm_interface::work::{WorkAction, WorkReply};

#[derive(Copy, Clone, Debug)]
pub struct WorkEntry {
    pub res: ResId,
    pub client_pd: PdId,
    pub is_critical: bool,
}

#[derive(Default)]
pub struct WorkQueues {
    extract: VecDeque<WorkEntry>,
    destroy: VecDeque<WorkEntry>,
    free: VecDeque<WorkEntry>,
    send: VecDeque<WorkEntry>,
}

impl WorkQueues {
    pub fn new() -> Self { Default::default() }

    pub fn enqueue(&mut self, action: WorkAction, entry: WorkEntry) {
        match action {
            WorkAction::Extract => self.extract.push_back(entry),
            WorkAction::Destroy => self.destroy.push_back(entry),
            WorkAction::Free => self.free.push_back(entry),
            WorkAction::Send => self.send.push_back(entry),
            WorkAction::NoWork => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extract.is_empty()
            && self.destroy.is_empty()
            && self.free.is_empty()
            && self.send.is_empty()
    }

    /// Queued critical items not yet handed to the server.
    pub fn pending_critical(&self) -> usize {
        [&self.destroy, &self.free, &self.send]
            .iter()
            .map(|q| q.iter().filter(|e| e.is_critical).count())
            .sum()
    }

    /// Queued extraction requests not yet handed to the server.
    pub fn pending_extract(&self) -> usize { self.extract.len() }

    /// Drains the next batch of work, one kind at a time.
    pub fn next_batch(&mut self) -> WorkReply {
        let (action, queue) = if !self.extract.is_empty() {
            (WorkAction::Extract, &mut self.extract)
        } else if !self.destroy.is_empty() {
            (WorkAction::Destroy, &mut self.destroy)
        } else if !self.free.is_empty() {
            (WorkAction::Free, &mut self.free)
        } else if !self.send.is_empty() {
            (WorkAction::Send, &mut self.send)
        } else {
            return WorkReply::none();
        };

        let entries: Vec<WorkEntry> = queue.drain(..).collect();
        WorkReply {
            action,
            object_ids: entries.iter().map(|e| e.res.object_id).collect(),
            space_ids: {
                let mut spaces: Vec<_> = entries.iter().map(|e| e.res.space_id).collect();
                spaces.dedup();
                spaces
            },
            pd_ids: entries.iter().map(|e| e.client_pd).collect(),
            n_critical: entries.iter().filter(|e| e.is_critical).count(),
        }
    }
}
