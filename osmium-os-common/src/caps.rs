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

//! The kernel surface the Resource Manager is written against.
//!
//! The microkernel is an external collaborator; the RM only assumes
//! badged endpoints, a reply-capability mechanism, notifications, and
//! minting a capability with a chosen badge. Everything it consumes is
//! expressed through the [`KernelInterface`] trait so the manager can
//! be exercised on a host with a fake in tests and bound to the real
//! kernel by component glue.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub type CPtr = usize;
pub const NULL_CPTR: CPtr = 0;

pub const PAGE_BITS: u8 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

bitflags! {
    /// Access rights carried by a capability or a memory mapping.
    pub struct CapRights: u8 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        const EXECUTE = 0b0100;
        const GRANT   = 0b1000;
    }
}

impl CapRights {
    pub const RW: CapRights = CapRights::from_bits_truncate(0b0011);
    pub const RX: CapRights = CapRights::from_bits_truncate(0b0101);
}

// Opaque kernel object handles. The kernel hands these out; the RM
// never looks inside them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Frame(pub usize);
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VSpace(pub usize);
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Tcb(pub usize);
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CNode(pub usize);
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint(pub usize);
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Notification(pub usize);
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ReplyCap(pub usize);

/// Full path to a capability slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CSlot {
    pub cnode: CNode,
    pub slot: CPtr,
}

impl CSlot {
    pub fn new(cnode: CNode, slot: CPtr) -> Self { CSlot { cnode, slot } }
}

/// Register state written to a thread before first dispatch.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    pub pc: usize,
    pub sp: usize,
    pub tls: usize,
    /// First argument registers (argc, argv, ...).
    pub gpr: [usize; 8],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    OutOfMemory,
    InvalidArgument,
    InvalidCapability,
    NotSupported,
}

pub type KernelResult<T> = Result<T, KernelError>;

/// The kernel operations the RM consumes. One instance serves the whole
/// manager; every call happens between a `recv` and the matching reply
/// so no interior locking is assumed.
pub trait KernelInterface {
    // -- cspace --
    fn create_cnode(&mut self, size_bits: usize) -> KernelResult<CNode>;
    fn destroy_cnode(&mut self, cnode: CNode) -> KernelResult<()>;
    /// Mints a badged capability to |ep| into |dst|. This is how every
    /// resource capability clients hold comes to exist.
    fn mint_badged_endpoint(
        &mut self,
        dst: CSlot,
        ep: Endpoint,
        badge: u64,
        rights: CapRights,
    ) -> KernelResult<()>;
    fn copy_cap(&mut self, dst: CSlot, src: CSlot, rights: CapRights) -> KernelResult<()>;
    fn delete_cap(&mut self, slot: CSlot) -> KernelResult<()>;
    fn revoke_cap(&mut self, slot: CSlot) -> KernelResult<()>;

    // -- ipc --
    fn create_endpoint(&mut self) -> KernelResult<Endpoint>;
    fn destroy_endpoint(&mut self, ep: Endpoint) -> KernelResult<()>;
    fn create_notification(&mut self) -> KernelResult<Notification>;
    fn destroy_notification(&mut self, ntfn: Notification) -> KernelResult<()>;
    fn signal(&mut self, ntfn: Notification);
    /// Saves the in-flight caller's reply capability so the reply can
    /// be sent after returning to the receive loop.
    fn save_reply(&mut self) -> KernelResult<ReplyCap>;
    fn send_reply(&mut self, reply: ReplyCap, label: usize, body: &[u8]) -> KernelResult<()>;

    // -- memory --
    fn alloc_frame(&mut self, page_bits: u8) -> KernelResult<Frame>;
    fn free_frame(&mut self, frame: Frame) -> KernelResult<()>;
    /// Maps |frame| into a scratch window of the RM's own address space
    /// for the duration of |f|. Used for ELF segment copies and for
    /// reading subgraphs delivered in memory objects.
    fn with_frame_mut(
        &mut self,
        frame: Frame,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> KernelResult<()>;
    fn create_vspace(&mut self) -> KernelResult<VSpace>;
    fn destroy_vspace(&mut self, vspace: VSpace) -> KernelResult<()>;
    fn map_frame(
        &mut self,
        vspace: VSpace,
        frame: Frame,
        vaddr: usize,
        rights: CapRights,
        cacheable: bool,
    ) -> KernelResult<()>;
    fn unmap_frame(&mut self, vspace: VSpace, vaddr: usize) -> KernelResult<()>;
    fn clean_cache(&mut self, vspace: VSpace, vaddr: usize, len: usize) -> KernelResult<()>;

    // -- threads --
    fn create_tcb(&mut self) -> KernelResult<Tcb>;
    fn destroy_tcb(&mut self, tcb: Tcb) -> KernelResult<()>;
    #[allow(clippy::too_many_arguments)]
    fn configure_tcb(
        &mut self,
        tcb: Tcb,
        cspace: CNode,
        cnode_guard: usize,
        fault_ep: Option<CSlot>,
        vspace: VSpace,
        ipc_buf: Option<(Frame, usize)>,
        priority: u8,
    ) -> KernelResult<()>;
    fn bind_notification(&mut self, tcb: Tcb, ntfn: Notification) -> KernelResult<()>;
    /// Rebinds a configured thread to a different address space.
    fn bind_vspace(&mut self, tcb: Tcb, vspace: VSpace) -> KernelResult<()>;
    fn write_registers(&mut self, tcb: Tcb, regs: &UserContext, resume: bool)
        -> KernelResult<()>;
    fn read_registers(&mut self, tcb: Tcb) -> KernelResult<UserContext>;
    fn set_tls_base(&mut self, tcb: Tcb, tls_base: usize) -> KernelResult<()>;
    fn start_tcb(&mut self, tcb: Tcb) -> KernelResult<()>;
    fn suspend_tcb(&mut self, tcb: Tcb) -> KernelResult<()>;
    fn resume_tcb(&mut self, tcb: Tcb) -> KernelResult<()>;

    // -- virtualization --
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_inject_irq(&mut self, tcb: Tcb, irq: u32) -> KernelResult<()>;
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_ack_vppi(&mut self, tcb: Tcb, irq: u32) -> KernelResult<()>;
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_read_regs(&mut self, tcb: Tcb) -> KernelResult<UserContext>;
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_elevate(&mut self, tcb: Tcb) -> KernelResult<()>;
}
