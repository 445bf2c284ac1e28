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

//! Process creation.
//!
//! Composes the components into a runnable process: PD + ADS + CPU
//! allocation, ELF load, stack and IPC-buffer and init-data frames,
//! request directory seeded from the parent, and first-dispatch
//! register state. Used by the root task to start the initial servers
//! and by tests; the process is left stopped for the caller to start.

extern crate alloc;
use alloc::vec::Vec;
use log::debug;
use osmium_os_common::badge::{Badge, CapType, ObjId, PdId};
use osmium_os_common::caps::{CapRights, PAGE_BITS};
use osmium_rm_interface::error::RmError;
use osmium_rm_interface::message::VmrType;

use crate::ads::elf;
use crate::server::ResourceManager;
use crate::server::PD_SPACE_ID;

const STACK_PAGES: usize = 16;
const STACK_TOP: usize = 0x7ff0_0000;
const IPC_BUF_VADDR: usize = 0x7ff1_0000;
const INIT_DATA_VADDR: usize = 0x7ff2_0000;
const DEFAULT_PRIORITY: u8 = 128;

pub struct ProcessBuilder<'a> {
    image: &'a [u8],
    name: &'a str,
    priority: u8,
    args: Vec<usize>,
}

/// Identities of everything a spawned process was built from.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pd_id: PdId,
    pub ads_id: ObjId,
    pub cpu_id: ObjId,
    pub entry_point: usize,
    pub stack_top: usize,
}

impl<'a> ProcessBuilder<'a> {
    pub fn new(image: &'a [u8], name: &'a str) -> Self {
        ProcessBuilder {
            image,
            name,
            priority: DEFAULT_PRIORITY,
            args: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn args(mut self, args: &[usize]) -> Self {
        self.args = args.to_vec();
        self
    }

    /// Builds the process on behalf of `parent`. The child ends up
    /// `Configured`; the caller starts its CPU when ready.
    pub fn spawn(
        self,
        rm: &mut ResourceManager,
        parent: PdId,
    ) -> Result<SpawnedProcess, RmError> {
        // Shared init-data frame, held by the parent until handoff.
        let init_mo = {
            let ResourceManager {
                kernel,
                mo,
                pd,
                listen_ep,
                ..
            } = rm;
            let parent_pd = pd.get_mut(parent).ok_or(RmError::NotFound)?;
            mo.alloc(kernel.as_mut(), *listen_ep, Some(parent_pd), parent, 1, PAGE_BITS)?
        };

        // The PD itself, owned by the parent.
        let pd_alloc = {
            let ResourceManager {
                kernel,
                pd,
                listen_ep,
                ..
            } = rm;
            pd.alloc(
                kernel.as_mut(),
                *listen_ep,
                parent,
                Some(init_mo.object_id),
                false,
            )?
        };
        let pd_id = pd_alloc.object_id as PdId;
        rm.mo.core.inc(init_mo.object_id)?;
        {
            let child = rm.pd.get_mut(pd_id).unwrap();
            child.set_name(self.name);
        }

        // ADS and CPU belong to the child.
        let ads_alloc = {
            let ResourceManager {
                kernel,
                ads,
                pd,
                listen_ep,
                ..
            } = rm;
            let child = pd.get_mut(pd_id).ok_or(RmError::NotFound)?;
            ads.alloc(kernel.as_mut(), *listen_ep, Some(child), pd_id)?
        };
        let ads_id = ads_alloc.object_id;
        let cpu_alloc = {
            let ResourceManager {
                kernel,
                cpu,
                pd,
                listen_ep,
                ..
            } = rm;
            let child = pd.get_mut(pd_id).ok_or(RmError::NotFound)?;
            cpu.alloc(kernel.as_mut(), *listen_ep, Some(child), pd_id)?
        };
        let cpu_id = cpu_alloc.object_id;
        {
            let child = rm.pd.get_mut(pd_id).unwrap();
            child.init_data.self_ads_cap = ads_alloc.slot.unwrap_or(0);
            child.init_data.self_cpu_cap = cpu_alloc.slot.unwrap_or(0);
        }
        // The child gets a cap to its own PD record.
        let self_badge = Badge::new(CapType::Pd, PD_SPACE_ID, pd_alloc.object_id, parent)?;
        rm.send_cap(pd_id, self_badge, true)?;

        // Image segments.
        let entry_point = {
            let ResourceManager {
                kernel,
                ads,
                mo,
                pd,
                listen_ep,
                ..
            } = rm;
            let child = pd.get_mut(pd_id).ok_or(RmError::NotFound)?;
            elf::load_elf(
                kernel.as_mut(),
                ads,
                mo,
                *listen_ep,
                ads_id,
                child,
                pd_id,
                self.image,
            )?
        };

        // Stack (top-anchored), IPC buffer, init data.
        let stack_base = STACK_TOP - (STACK_PAGES << PAGE_BITS);
        self.attach_fresh_mo(rm, pd_id, ads_id, stack_base, STACK_PAGES, VmrType::Stack)?;
        let ipc_mo =
            self.attach_fresh_mo(rm, pd_id, ads_id, IPC_BUF_VADDR, 1, VmrType::IpcBuffer)?;
        {
            // Map the shared init frame into the child too.
            rm.ads.reserve(
                ads_id,
                Some(INIT_DATA_VADDR),
                1,
                PAGE_BITS,
                VmrType::InitData,
                CapRights::RW,
                true,
            )?;
            let ResourceManager {
                kernel, ads, mo, ..
            } = rm;
            ads.attach(
                kernel.as_mut(),
                mo,
                ads_id,
                init_mo.object_id,
                Some(INIT_DATA_VADDR),
                0,
                CapRights::RW,
            )?;
        }
        // Runnable configuration.
        {
            let ResourceManager {
                kernel,
                cpu,
                ads,
                mo,
                pd,
                ..
            } = rm;
            let child = pd.get_mut(pd_id).ok_or(RmError::NotFound)?;
            cpu.configure(
                kernel.as_mut(),
                ads,
                mo,
                child,
                pd_id,
                cpu_id,
                ads_id,
                0,
                None,
                Some(ipc_mo),
                IPC_BUF_VADDR,
                self.priority,
            )?;
        }

        // The child asks for resources where its parent does.
        let parent_rdes: Vec<(u8, u16)> = match rm.pd.get(parent) {
            Some(p) => p
                .rde_entries()
                .map(|e| (e.cap_type, e.space_id))
                .collect(),
            None => Vec::new(),
        };
        for (cap_type, space_id) in parent_rdes {
            rm.share_rde(pd_id, cap_type, space_id)?;
        }
        for cap_type in [CapType::Mo, CapType::Ads, CapType::Cpu, CapType::Pd] {
            rm.share_rde(pd_id, u8::from(cap_type), 0)?;
        }

        rm.runtime_setup(
            pd_id,
            ads_id,
            cpu_id,
            &self.args,
            STACK_TOP,
            entry_point,
        )?;
        debug!(
            "spawned {} as pd {} (entry {:#x})",
            self.name, pd_id, entry_point
        );
        Ok(SpawnedProcess {
            pd_id,
            ads_id,
            cpu_id,
            entry_point,
            stack_top: STACK_TOP,
        })
    }

    /// Allocates a child-owned MO and attaches it at a fixed address.
    fn attach_fresh_mo(
        &self,
        rm: &mut ResourceManager,
        pd_id: PdId,
        ads_id: ObjId,
        vaddr: usize,
        num_pages: usize,
        vmr_type: VmrType,
    ) -> Result<ObjId, RmError> {
        let mo_id = {
            let ResourceManager {
                kernel,
                mo,
                pd,
                listen_ep,
                ..
            } = rm;
            let child = pd.get_mut(pd_id).ok_or(RmError::NotFound)?;
            mo.alloc(
                kernel.as_mut(),
                *listen_ep,
                Some(child),
                pd_id,
                num_pages,
                PAGE_BITS,
            )?
            .object_id
        };
        rm.ads.reserve(
            ads_id,
            Some(vaddr),
            num_pages,
            PAGE_BITS,
            vmr_type,
            CapRights::RW,
            true,
        )?;
        let ResourceManager {
            kernel, ads, mo, ..
        } = rm;
        ads.attach(
            kernel.as_mut(),
            mo,
            ads_id,
            mo_id,
            Some(vaddr),
            0,
            CapRights::RW,
        )?;
        Ok(mo_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuState;
    use crate::pd::PdState;
    use crate::server::{BootConfig, ADS_SPACE_ID, CPU_SPACE_ID, MO_SPACE_ID};
    use crate::testutil::{build_test_elf, ElfSegSpec, FakeKernel};
    use alloc::boxed::Box;
    use osmium_rm_interface::model::ResId;

    fn boot() -> ResourceManager {
        ResourceManager::new(Box::new(FakeKernel::new()), BootConfig::default()).unwrap()
    }

    fn test_image() -> Vec<u8> {
        build_test_elf(
            0x40_1000,
            &[
                ElfSegSpec::new(0x40_1000, 5, &[0x90; 128]),
                ElfSegSpec::new(0x40_2000, 6, &[0x00; 64]),
            ],
        )
    }

    #[test]
    fn test_spawn_builds_runnable_process() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        let image = test_image();
        let proc = ProcessBuilder::new(&image, "hello")
            .args(&[1, 2])
            .spawn(&mut rm, rt)
            .unwrap();

        // The child holds its core resources.
        let child = rm.pd.get(proc.pd_id).unwrap();
        assert_eq!(child.state, PdState::Configured);
        assert!(child.holds_resource(&ResId::new(CapType::Ads, ADS_SPACE_ID, proc.ads_id)));
        assert!(child.holds_resource(&ResId::new(CapType::Cpu, CPU_SPACE_ID, proc.cpu_id)));
        assert!(child.rde_get(u8::from(CapType::Mo), MO_SPACE_ID).is_some());

        // The parent holds the child PD.
        assert!(rm
            .pd
            .get(rt)
            .unwrap()
            .holds_resource(&ResId::new(CapType::Pd, PD_SPACE_ID, proc.pd_id as ObjId)));

        // Code, data, stack, IPC buffer, init data all reserved.
        let ads = rm.ads.core.get(proc.ads_id).unwrap();
        assert!(ads.vmrs.len() >= 5);
        assert_eq!(proc.entry_point, 0x40_1000);

        // CPU configured but not started.
        let cpu = rm.cpu.core.get(proc.cpu_id).unwrap();
        assert_eq!(cpu.state, CpuState::Configured);
        assert_eq!(cpu.bound_ads, Some(proc.ads_id));
    }

    #[test]
    fn test_spawn_then_start_runs() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        let image = test_image();
        let proc = ProcessBuilder::new(&image, "hello").spawn(&mut rm, rt).unwrap();

        let ResourceManager { kernel, cpu, .. } = &mut rm;
        cpu.start(kernel.as_mut(), proc.cpu_id).unwrap();
        assert_eq!(
            rm.cpu.core.get(proc.cpu_id).unwrap().state,
            CpuState::Running
        );
    }

    #[test]
    fn test_spawned_process_teardown_releases_everything() {
        let mut rm = boot();
        let rt = rm.rt_pd_id();
        let image = test_image();

        let frames_before = {
            let proc = ProcessBuilder::new(&image, "victim")
                .spawn(&mut rm, rt)
                .unwrap();
            // Parent drops its holds, then the child exits.
            rm.terminate_pd(proc.pd_id, true).unwrap();
            proc
        };
        let _ = frames_before;

        // Only the parent's hold on the child PD record and the init
        // MO remain referenced; everything child-owned is gone.
        assert!(rm.ads.core.is_empty());
        assert!(rm.cpu.core.is_empty());
    }
}
