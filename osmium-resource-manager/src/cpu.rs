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

//! CPU component: schedulable contexts.
//!
//! A CPU binds an address space, a cspace, and an IPC buffer into a
//! runnable thread. State machine: new -> configured -> running <->
//! stopped. A configured CPU holds references on its bound ADS and
//! IPC-buffer MO; `change_vspace` swaps the ADS reference in the
//! published order (inc new, rebind, dec old) so a kernel failure
//! leaves the CPU bound to the old ADS.

use log::trace;
use osmium_os_common::badge::{CapType, ObjId, PdId, SpaceId};
use osmium_os_common::caps::{
    CNode, CSlot, Endpoint, KernelInterface, Tcb, UserContext,
};
use osmium_rm_interface::error::RmError;

use crate::ads::{Ads, AdsComponent};
use crate::component::{Allocation, ComponentCore, RmObject};
use crate::mo::MoComponent;
use crate::pd::Pd;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CpuState {
    New,
    Configured,
    Running,
    Stopped,
}

pub struct Cpu {
    id: ObjId,
    pub tcb: Tcb,
    pub state: CpuState,
    pub bound_ads: Option<ObjId>,
    pub bound_ipc_mo: Option<ObjId>,
    pub bound_cspace: Option<CNode>,
    pub bound_pd: Option<PdId>,
    pub priority: u8,
}

impl RmObject for Cpu {
    fn id(&self) -> ObjId { self.id }
    fn set_id(&mut self, id: ObjId) { self.id = id }
}

pub struct CpuComponent {
    pub(crate) core: ComponentCore<Cpu>,
}

impl CpuComponent {
    pub fn new(space_id: SpaceId) -> Self {
        CpuComponent {
            core: ComponentCore::new(CapType::Cpu, space_id),
        }
    }

    pub fn alloc(
        &mut self,
        kernel: &mut dyn KernelInterface,
        listen_ep: Endpoint,
        owner: Option<&mut Pd>,
        owner_pd_id: PdId,
    ) -> Result<Allocation, RmError> {
        self.core
            .allocate(kernel, listen_ep, owner, owner_pd_id, false, |kernel| {
                Ok(Cpu {
                    id: 0,
                    tcb: kernel.create_tcb()?,
                    state: CpuState::New,
                    bound_ads: None,
                    bound_ipc_mo: None,
                    bound_cspace: None,
                    bound_pd: None,
                    priority: 0,
                })
            })
    }

    /// Binds ADS + PD + optional fault EP + optional IPC-buffer MO
    /// into a runnable configuration. Takes one reference each on the
    /// ADS and the IPC-buffer MO.
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &mut self,
        kernel: &mut dyn KernelInterface,
        ads_component: &mut AdsComponent,
        mo_component: &mut MoComponent,
        pd: &mut Pd,
        pd_id: PdId,
        cpu_id: ObjId,
        ads_id: ObjId,
        cnode_guard: usize,
        fault_ep_slot: Option<CSlot>,
        ipc_buf_mo: Option<ObjId>,
        ipc_buf_vaddr: usize,
        priority: u8,
    ) -> Result<(), RmError> {
        let cpu = self.core.get_mut(cpu_id).ok_or(RmError::NotFound)?;
        if cpu.state != CpuState::New {
            return Err(RmError::InvalidState);
        }
        let vspace = ads_component
            .core
            .get(ads_id)
            .ok_or(RmError::NotFound)?
            .vspace;
        let ipc_buf = match ipc_buf_mo {
            Some(mo_id) => {
                let mo = mo_component.core.get(mo_id).ok_or(RmError::NotFound)?;
                Some((mo.frames[0], ipc_buf_vaddr))
            }
            None => None,
        };

        kernel.configure_tcb(
            cpu.tcb,
            pd.cspace,
            cnode_guard,
            fault_ep_slot,
            vspace,
            ipc_buf,
            priority,
        )?;
        kernel.bind_notification(cpu.tcb, pd.notification)?;

        ads_component.core.inc(ads_id)?;
        if let Some(mo_id) = ipc_buf_mo {
            mo_component.core.inc(mo_id)?;
        }

        cpu.state = CpuState::Configured;
        cpu.bound_ads = Some(ads_id);
        cpu.bound_ipc_mo = ipc_buf_mo;
        cpu.bound_cspace = Some(pd.cspace);
        cpu.bound_pd = Some(pd_id);
        cpu.priority = priority;
        pd.bound_cpu = Some(cpu_id);
        trace!("cpu {} configured for pd {}", cpu_id, pd_id);
        Ok(())
    }

    pub fn start(&mut self, kernel: &mut dyn KernelInterface, cpu_id: ObjId) -> Result<PdId, RmError> {
        let cpu = self.core.get_mut(cpu_id).ok_or(RmError::NotFound)?;
        if cpu.state != CpuState::Configured {
            return Err(RmError::InvalidState);
        }
        kernel.start_tcb(cpu.tcb)?;
        cpu.state = CpuState::Running;
        Ok(cpu.bound_pd.unwrap_or(0))
    }

    pub fn stop(&mut self, kernel: &mut dyn KernelInterface, cpu_id: ObjId) -> Result<(), RmError> {
        let cpu = self.core.get_mut(cpu_id).ok_or(RmError::NotFound)?;
        if cpu.state != CpuState::Running {
            return Err(RmError::InvalidState);
        }
        kernel.suspend_tcb(cpu.tcb)?;
        cpu.state = CpuState::Stopped;
        Ok(())
    }

    pub fn resume(&mut self, kernel: &mut dyn KernelInterface, cpu_id: ObjId) -> Result<(), RmError> {
        let cpu = self.core.get_mut(cpu_id).ok_or(RmError::NotFound)?;
        if cpu.state != CpuState::Stopped {
            return Err(RmError::InvalidState);
        }
        kernel.resume_tcb(cpu.tcb)?;
        cpu.state = CpuState::Running;
        Ok(())
    }

    pub fn set_tls_base(
        &mut self,
        kernel: &mut dyn KernelInterface,
        cpu_id: ObjId,
        tls_base: usize,
    ) -> Result<(), RmError> {
        let cpu = self.core.get(cpu_id).ok_or(RmError::NotFound)?;
        if cpu.state == CpuState::New {
            return Err(RmError::InvalidState);
        }
        kernel.set_tls_base(cpu.tcb, tls_base)?;
        Ok(())
    }

    pub fn write_registers(
        &mut self,
        kernel: &mut dyn KernelInterface,
        cpu_id: ObjId,
        regs: &UserContext,
        resume: bool,
    ) -> Result<(), RmError> {
        let cpu = self.core.get_mut(cpu_id).ok_or(RmError::NotFound)?;
        if cpu.state == CpuState::New {
            return Err(RmError::InvalidState);
        }
        kernel.write_registers(cpu.tcb, regs, resume)?;
        if resume {
            cpu.state = CpuState::Running;
        }
        Ok(())
    }

    pub fn read_registers(
        &mut self,
        kernel: &mut dyn KernelInterface,
        cpu_id: ObjId,
    ) -> Result<UserContext, RmError> {
        let cpu = self.core.get(cpu_id).ok_or(RmError::NotFound)?;
        if cpu.state == CpuState::New {
            return Err(RmError::InvalidState);
        }
        Ok(kernel.read_registers(cpu.tcb)?)
    }

    /// Atomically rebinds the CPU to `new_ads_id`. The new ADS's
    /// refcount is taken before the rebind so a kernel failure leaves
    /// both counts as they were. If dropping the old reference
    /// destroys the old ADS it is returned for the caller to tear
    /// down.
    pub fn change_vspace(
        &mut self,
        kernel: &mut dyn KernelInterface,
        ads_component: &mut AdsComponent,
        cpu_id: ObjId,
        new_ads_id: ObjId,
    ) -> Result<Option<Ads>, RmError> {
        let cpu = self.core.get_mut(cpu_id).ok_or(RmError::NotFound)?;
        if cpu.state == CpuState::New {
            return Err(RmError::InvalidState);
        }
        let old_ads_id = cpu.bound_ads.ok_or(RmError::InvalidState)?;
        let new_vspace = ads_component
            .core
            .get(new_ads_id)
            .ok_or(RmError::NotFound)?
            .vspace;

        ads_component.core.inc(new_ads_id)?;
        if let Err(e) = kernel.bind_vspace(cpu.tcb, new_vspace) {
            // Revert: the new reference goes away, the old one was
            // never touched.
            let reverted = ads_component.core.dec(new_ads_id);
            debug_assert!(reverted.is_none());
            return Err(e.into());
        }
        cpu.bound_ads = Some(new_ads_id);
        trace!("cpu {} vspace {} -> {}", cpu_id, old_ads_id, new_ads_id);
        Ok(ads_component.core.dec(old_ads_id))
    }

    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    pub fn inject_irq(
        &mut self,
        kernel: &mut dyn KernelInterface,
        cpu_id: ObjId,
        irq: u32,
    ) -> Result<(), RmError> {
        let cpu = self.core.get(cpu_id).ok_or(RmError::NotFound)?;
        Ok(kernel.vcpu_inject_irq(cpu.tcb, irq)?)
    }

    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    pub fn ack_vppi(
        &mut self,
        kernel: &mut dyn KernelInterface,
        cpu_id: ObjId,
        irq: u32,
    ) -> Result<(), RmError> {
        let cpu = self.core.get(cpu_id).ok_or(RmError::NotFound)?;
        Ok(kernel.vcpu_ack_vppi(cpu.tcb, irq)?)
    }

    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    pub fn read_vcpu_regs(
        &mut self,
        kernel: &mut dyn KernelInterface,
        cpu_id: ObjId,
    ) -> Result<UserContext, RmError> {
        let cpu = self.core.get(cpu_id).ok_or(RmError::NotFound)?;
        Ok(kernel.vcpu_read_regs(cpu.tcb)?)
    }

    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    pub fn elevate(
        &mut self,
        kernel: &mut dyn KernelInterface,
        cpu_id: ObjId,
    ) -> Result<(), RmError> {
        let cpu = self.core.get(cpu_id).ok_or(RmError::NotFound)?;
        Ok(kernel.vcpu_elevate(cpu.tcb)?)
    }
}
