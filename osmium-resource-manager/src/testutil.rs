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

//! In-memory kernel used to exercise the Resource Manager on a host.
//! Tracks every object handed out so tests can assert the universal
//! invariants (frames outstanding, mappings live, signals raised,
//! replies sent).

use hashbrown::{HashMap, HashSet};
use osmium_os_common::caps::*;

struct TcbState {
    configured: bool,
    running: bool,
    regs: UserContext,
    vspace: Option<VSpace>,
}

#[derive(Clone, Debug)]
pub struct SentReply {
    pub reply: ReplyCap,
    pub label: usize,
    pub body: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MintedCap {
    pub target: Endpoint,
    pub badge: u64,
}

pub struct FakeKernel {
    next_handle: usize,
    frames: HashMap<usize, Box<[u8]>>,
    frame_limit: Option<usize>,
    cnodes: HashSet<usize>,
    endpoints: HashSet<usize>,
    notifications: HashSet<usize>,
    vspaces: HashMap<usize, HashMap<usize, Frame>>,
    tcbs: HashMap<usize, TcbState>,
    caps: HashMap<(usize, usize), MintedCap>,
    signals: HashMap<usize, usize>,
    replies: Vec<SentReply>,
    next_reply: usize,
    fail_bind_vspace: bool,
}

impl FakeKernel {
    pub fn new() -> Self {
        FakeKernel {
            next_handle: 1,
            frames: HashMap::new(),
            frame_limit: None,
            cnodes: HashSet::new(),
            endpoints: HashSet::new(),
            notifications: HashSet::new(),
            vspaces: HashMap::new(),
            tcbs: HashMap::new(),
            caps: HashMap::new(),
            signals: HashMap::new(),
            replies: Vec::new(),
            next_reply: 1,
            fail_bind_vspace: false,
        }
    }

    fn handle(&mut self) -> usize {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    // -- introspection for tests --

    pub fn frames_outstanding(&self) -> usize { self.frames.len() }
    pub fn set_frame_limit(&mut self, limit: usize) { self.frame_limit = Some(limit) }
    pub fn fail_next_bind_vspace(&mut self) { self.fail_bind_vspace = true }

    pub fn is_mapped(&self, vspace: VSpace, vaddr: usize) -> bool {
        self.vspaces
            .get(&vspace.0)
            .map_or(false, |m| m.contains_key(&vaddr))
    }

    pub fn signal_count(&self, ntfn: Notification) -> usize {
        self.signals.get(&ntfn.0).copied().unwrap_or(0)
    }

    pub fn sent_replies(&self) -> &[SentReply] { &self.replies }

    pub fn cap_at(&self, slot: CSlot) -> Option<MintedCap> {
        self.caps.get(&(slot.cnode.0, slot.slot)).copied()
    }

    pub fn endpoints_live(&self) -> usize { self.endpoints.len() }
}

impl Default for FakeKernel {
    fn default() -> Self { Self::new() }
}

impl KernelInterface for FakeKernel {
    fn create_cnode(&mut self, _size_bits: usize) -> KernelResult<CNode> {
        let h = self.handle();
        self.cnodes.insert(h);
        Ok(CNode(h))
    }

    fn destroy_cnode(&mut self, cnode: CNode) -> KernelResult<()> {
        if !self.cnodes.remove(&cnode.0) {
            return Err(KernelError::InvalidCapability);
        }
        self.caps.retain(|(c, _), _| *c != cnode.0);
        Ok(())
    }

    fn mint_badged_endpoint(
        &mut self,
        dst: CSlot,
        ep: Endpoint,
        badge: u64,
        _rights: CapRights,
    ) -> KernelResult<()> {
        if !self.cnodes.contains(&dst.cnode.0) || !self.endpoints.contains(&ep.0) {
            return Err(KernelError::InvalidCapability);
        }
        self.caps
            .insert((dst.cnode.0, dst.slot), MintedCap { target: ep, badge });
        Ok(())
    }

    fn copy_cap(&mut self, dst: CSlot, src: CSlot, _rights: CapRights) -> KernelResult<()> {
        let cap = self
            .caps
            .get(&(src.cnode.0, src.slot))
            .copied()
            .ok_or(KernelError::InvalidCapability)?;
        self.caps.insert((dst.cnode.0, dst.slot), cap);
        Ok(())
    }

    fn delete_cap(&mut self, slot: CSlot) -> KernelResult<()> {
        self.caps.remove(&(slot.cnode.0, slot.slot));
        Ok(())
    }

    fn revoke_cap(&mut self, slot: CSlot) -> KernelResult<()> { self.delete_cap(slot) }

    fn create_endpoint(&mut self) -> KernelResult<Endpoint> {
        let h = self.handle();
        self.endpoints.insert(h);
        Ok(Endpoint(h))
    }

    fn destroy_endpoint(&mut self, ep: Endpoint) -> KernelResult<()> {
        if self.endpoints.remove(&ep.0) {
            Ok(())
        } else {
            Err(KernelError::InvalidCapability)
        }
    }

    fn create_notification(&mut self) -> KernelResult<Notification> {
        let h = self.handle();
        self.notifications.insert(h);
        Ok(Notification(h))
    }

    fn destroy_notification(&mut self, ntfn: Notification) -> KernelResult<()> {
        if self.notifications.remove(&ntfn.0) {
            Ok(())
        } else {
            Err(KernelError::InvalidCapability)
        }
    }

    fn signal(&mut self, ntfn: Notification) {
        *self.signals.entry(ntfn.0).or_insert(0) += 1;
    }

    fn save_reply(&mut self) -> KernelResult<ReplyCap> {
        let r = ReplyCap(self.next_reply);
        self.next_reply += 1;
        Ok(r)
    }

    fn send_reply(&mut self, reply: ReplyCap, label: usize, body: &[u8]) -> KernelResult<()> {
        self.replies.push(SentReply {
            reply,
            label,
            body: body.to_vec(),
        });
        Ok(())
    }

    fn alloc_frame(&mut self, page_bits: u8) -> KernelResult<Frame> {
        if let Some(limit) = self.frame_limit {
            if self.frames.len() >= limit {
                return Err(KernelError::OutOfMemory);
            }
        }
        let h = self.handle();
        self.frames
            .insert(h, vec![0u8; 1usize << page_bits].into_boxed_slice());
        Ok(Frame(h))
    }

    fn free_frame(&mut self, frame: Frame) -> KernelResult<()> {
        if self.frames.remove(&frame.0).is_some() {
            Ok(())
        } else {
            Err(KernelError::InvalidCapability)
        }
    }

    fn with_frame_mut(
        &mut self,
        frame: Frame,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> KernelResult<()> {
        let data = self
            .frames
            .get_mut(&frame.0)
            .ok_or(KernelError::InvalidCapability)?;
        f(data);
        Ok(())
    }

    fn create_vspace(&mut self) -> KernelResult<VSpace> {
        let h = self.handle();
        self.vspaces.insert(h, HashMap::new());
        Ok(VSpace(h))
    }

    fn destroy_vspace(&mut self, vspace: VSpace) -> KernelResult<()> {
        if self.vspaces.remove(&vspace.0).is_some() {
            Ok(())
        } else {
            Err(KernelError::InvalidCapability)
        }
    }

    fn map_frame(
        &mut self,
        vspace: VSpace,
        frame: Frame,
        vaddr: usize,
        _rights: CapRights,
        _cacheable: bool,
    ) -> KernelResult<()> {
        if !self.frames.contains_key(&frame.0) {
            return Err(KernelError::InvalidCapability);
        }
        let map = self
            .vspaces
            .get_mut(&vspace.0)
            .ok_or(KernelError::InvalidCapability)?;
        if map.contains_key(&vaddr) {
            return Err(KernelError::InvalidArgument);
        }
        map.insert(vaddr, frame);
        Ok(())
    }

    fn unmap_frame(&mut self, vspace: VSpace, vaddr: usize) -> KernelResult<()> {
        let map = self
            .vspaces
            .get_mut(&vspace.0)
            .ok_or(KernelError::InvalidCapability)?;
        map.remove(&vaddr).ok_or(KernelError::InvalidArgument)?;
        Ok(())
    }

    fn clean_cache(&mut self, _vspace: VSpace, _vaddr: usize, _len: usize) -> KernelResult<()> {
        Ok(())
    }

    fn create_tcb(&mut self) -> KernelResult<Tcb> {
        let h = self.handle();
        self.tcbs.insert(
            h,
            TcbState {
                configured: false,
                running: false,
                regs: UserContext::default(),
                vspace: None,
            },
        );
        Ok(Tcb(h))
    }

    fn destroy_tcb(&mut self, tcb: Tcb) -> KernelResult<()> {
        if self.tcbs.remove(&tcb.0).is_some() {
            Ok(())
        } else {
            Err(KernelError::InvalidCapability)
        }
    }

    fn configure_tcb(
        &mut self,
        tcb: Tcb,
        cspace: CNode,
        _cnode_guard: usize,
        _fault_ep: Option<CSlot>,
        vspace: VSpace,
        _ipc_buf: Option<(Frame, usize)>,
        _priority: u8,
    ) -> KernelResult<()> {
        if !self.cnodes.contains(&cspace.0) || !self.vspaces.contains_key(&vspace.0) {
            return Err(KernelError::InvalidCapability);
        }
        let t = self
            .tcbs
            .get_mut(&tcb.0)
            .ok_or(KernelError::InvalidCapability)?;
        t.configured = true;
        t.vspace = Some(vspace);
        Ok(())
    }

    fn bind_notification(&mut self, tcb: Tcb, ntfn: Notification) -> KernelResult<()> {
        if !self.tcbs.contains_key(&tcb.0) || !self.notifications.contains(&ntfn.0) {
            return Err(KernelError::InvalidCapability);
        }
        Ok(())
    }

    fn bind_vspace(&mut self, tcb: Tcb, vspace: VSpace) -> KernelResult<()> {
        if self.fail_bind_vspace {
            self.fail_bind_vspace = false;
            return Err(KernelError::InvalidArgument);
        }
        if !self.vspaces.contains_key(&vspace.0) {
            return Err(KernelError::InvalidCapability);
        }
        let t = self
            .tcbs
            .get_mut(&tcb.0)
            .ok_or(KernelError::InvalidCapability)?;
        t.vspace = Some(vspace);
        Ok(())
    }

    fn write_registers(
        &mut self,
        tcb: Tcb,
        regs: &UserContext,
        resume: bool,
    ) -> KernelResult<()> {
        let t = self
            .tcbs
            .get_mut(&tcb.0)
            .ok_or(KernelError::InvalidCapability)?;
        t.regs = *regs;
        if resume {
            t.running = true;
        }
        Ok(())
    }

    fn read_registers(&mut self, tcb: Tcb) -> KernelResult<UserContext> {
        self.tcbs
            .get(&tcb.0)
            .map(|t| t.regs)
            .ok_or(KernelError::InvalidCapability)
    }

    fn set_tls_base(&mut self, tcb: Tcb, tls_base: usize) -> KernelResult<()> {
        let t = self
            .tcbs
            .get_mut(&tcb.0)
            .ok_or(KernelError::InvalidCapability)?;
        t.regs.tls = tls_base;
        Ok(())
    }

    fn start_tcb(&mut self, tcb: Tcb) -> KernelResult<()> {
        let t = self
            .tcbs
            .get_mut(&tcb.0)
            .ok_or(KernelError::InvalidCapability)?;
        if !t.configured {
            return Err(KernelError::InvalidArgument);
        }
        t.running = true;
        Ok(())
    }

    fn suspend_tcb(&mut self, tcb: Tcb) -> KernelResult<()> {
        let t = self
            .tcbs
            .get_mut(&tcb.0)
            .ok_or(KernelError::InvalidCapability)?;
        t.running = false;
        Ok(())
    }

    fn resume_tcb(&mut self, tcb: Tcb) -> KernelResult<()> {
        let t = self
            .tcbs
            .get_mut(&tcb.0)
            .ok_or(KernelError::InvalidCapability)?;
        t.running = true;
        Ok(())
    }

    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_inject_irq(&mut self, _tcb: Tcb, _irq: u32) -> KernelResult<()> { Ok(()) }
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_ack_vppi(&mut self, _tcb: Tcb, _irq: u32) -> KernelResult<()> { Ok(()) }
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_read_regs(&mut self, tcb: Tcb) -> KernelResult<UserContext> {
        self.read_registers(tcb)
    }
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_elevate(&mut self, _tcb: Tcb) -> KernelResult<()> { Ok(()) }
}

/// Clonable handle to a FakeKernel, for tests that need to inspect
/// kernel state after handing ownership to the ResourceManager.
#[derive(Clone)]
pub struct SharedKernel(pub std::rc::Rc<std::cell::RefCell<FakeKernel>>);

impl SharedKernel {
    pub fn new() -> Self {
        SharedKernel(std::rc::Rc::new(std::cell::RefCell::new(FakeKernel::new())))
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, FakeKernel> { self.0.borrow() }
}

impl KernelInterface for SharedKernel {
    fn create_cnode(&mut self, size_bits: usize) -> KernelResult<CNode> {
        self.0.borrow_mut().create_cnode(size_bits)
    }
    fn destroy_cnode(&mut self, cnode: CNode) -> KernelResult<()> {
        self.0.borrow_mut().destroy_cnode(cnode)
    }
    fn mint_badged_endpoint(
        &mut self,
        dst: CSlot,
        ep: Endpoint,
        badge: u64,
        rights: CapRights,
    ) -> KernelResult<()> {
        self.0.borrow_mut().mint_badged_endpoint(dst, ep, badge, rights)
    }
    fn copy_cap(&mut self, dst: CSlot, src: CSlot, rights: CapRights) -> KernelResult<()> {
        self.0.borrow_mut().copy_cap(dst, src, rights)
    }
    fn delete_cap(&mut self, slot: CSlot) -> KernelResult<()> {
        self.0.borrow_mut().delete_cap(slot)
    }
    fn revoke_cap(&mut self, slot: CSlot) -> KernelResult<()> {
        self.0.borrow_mut().revoke_cap(slot)
    }
    fn create_endpoint(&mut self) -> KernelResult<Endpoint> {
        self.0.borrow_mut().create_endpoint()
    }
    fn destroy_endpoint(&mut self, ep: Endpoint) -> KernelResult<()> {
        self.0.borrow_mut().destroy_endpoint(ep)
    }
    fn create_notification(&mut self) -> KernelResult<Notification> {
        self.0.borrow_mut().create_notification()
    }
    fn destroy_notification(&mut self, ntfn: Notification) -> KernelResult<()> {
        self.0.borrow_mut().destroy_notification(ntfn)
    }
    fn signal(&mut self, ntfn: Notification) { self.0.borrow_mut().signal(ntfn) }
    fn save_reply(&mut self) -> KernelResult<ReplyCap> { self.0.borrow_mut().save_reply() }
    fn send_reply(&mut self, reply: ReplyCap, label: usize, body: &[u8]) -> KernelResult<()> {
        self.0.borrow_mut().send_reply(reply, label, body)
    }
    fn alloc_frame(&mut self, page_bits: u8) -> KernelResult<Frame> {
        self.0.borrow_mut().alloc_frame(page_bits)
    }
    fn free_frame(&mut self, frame: Frame) -> KernelResult<()> {
        self.0.borrow_mut().free_frame(frame)
    }
    fn with_frame_mut(
        &mut self,
        frame: Frame,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> KernelResult<()> {
        self.0.borrow_mut().with_frame_mut(frame, f)
    }
    fn create_vspace(&mut self) -> KernelResult<VSpace> { self.0.borrow_mut().create_vspace() }
    fn destroy_vspace(&mut self, vspace: VSpace) -> KernelResult<()> {
        self.0.borrow_mut().destroy_vspace(vspace)
    }
    fn map_frame(
        &mut self,
        vspace: VSpace,
        frame: Frame,
        vaddr: usize,
        rights: CapRights,
        cacheable: bool,
    ) -> KernelResult<()> {
        self.0
            .borrow_mut()
            .map_frame(vspace, frame, vaddr, rights, cacheable)
    }
    fn unmap_frame(&mut self, vspace: VSpace, vaddr: usize) -> KernelResult<()> {
        self.0.borrow_mut().unmap_frame(vspace, vaddr)
    }
    fn clean_cache(&mut self, vspace: VSpace, vaddr: usize, len: usize) -> KernelResult<()> {
        self.0.borrow_mut().clean_cache(vspace, vaddr, len)
    }
    fn create_tcb(&mut self) -> KernelResult<Tcb> { self.0.borrow_mut().create_tcb() }
    fn destroy_tcb(&mut self, tcb: Tcb) -> KernelResult<()> {
        self.0.borrow_mut().destroy_tcb(tcb)
    }
    fn configure_tcb(
        &mut self,
        tcb: Tcb,
        cspace: CNode,
        cnode_guard: usize,
        fault_ep: Option<CSlot>,
        vspace: VSpace,
        ipc_buf: Option<(Frame, usize)>,
        priority: u8,
    ) -> KernelResult<()> {
        self.0
            .borrow_mut()
            .configure_tcb(tcb, cspace, cnode_guard, fault_ep, vspace, ipc_buf, priority)
    }
    fn bind_notification(&mut self, tcb: Tcb, ntfn: Notification) -> KernelResult<()> {
        self.0.borrow_mut().bind_notification(tcb, ntfn)
    }
    fn bind_vspace(&mut self, tcb: Tcb, vspace: VSpace) -> KernelResult<()> {
        self.0.borrow_mut().bind_vspace(tcb, vspace)
    }
    fn write_registers(
        &mut self,
        tcb: Tcb,
        regs: &UserContext,
        resume: bool,
    ) -> KernelResult<()> {
        self.0.borrow_mut().write_registers(tcb, regs, resume)
    }
    fn read_registers(&mut self, tcb: Tcb) -> KernelResult<UserContext> {
        self.0.borrow_mut().read_registers(tcb)
    }
    fn set_tls_base(&mut self, tcb: Tcb, tls_base: usize) -> KernelResult<()> {
        self.0.borrow_mut().set_tls_base(tcb, tls_base)
    }
    fn start_tcb(&mut self, tcb: Tcb) -> KernelResult<()> { self.0.borrow_mut().start_tcb(tcb) }
    fn suspend_tcb(&mut self, tcb: Tcb) -> KernelResult<()> {
        self.0.borrow_mut().suspend_tcb(tcb)
    }
    fn resume_tcb(&mut self, tcb: Tcb) -> KernelResult<()> {
        self.0.borrow_mut().resume_tcb(tcb)
    }
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_inject_irq(&mut self, tcb: Tcb, irq: u32) -> KernelResult<()> {
        self.0.borrow_mut().vcpu_inject_irq(tcb, irq)
    }
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_ack_vppi(&mut self, tcb: Tcb, irq: u32) -> KernelResult<()> {
        self.0.borrow_mut().vcpu_ack_vppi(tcb, irq)
    }
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_read_regs(&mut self, tcb: Tcb) -> KernelResult<UserContext> {
        self.0.borrow_mut().vcpu_read_regs(tcb)
    }
    #[cfg(feature = "CONFIG_VM_SUPPORT")]
    fn vcpu_elevate(&mut self, tcb: Tcb) -> KernelResult<()> {
        self.0.borrow_mut().vcpu_elevate(tcb)
    }
}

// -- minimal ELF64 image builder for loader tests --

pub struct ElfSegSpec {
    pub vaddr: u64,
    pub flags: u32, // PF_X=1 PF_W=2 PF_R=4
    pub data: Vec<u8>,
}

impl ElfSegSpec {
    pub fn new(vaddr: u64, flags: u32, data: &[u8]) -> Self {
        ElfSegSpec {
            vaddr,
            flags,
            data: data.to_vec(),
        }
    }
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) { buf[off..off + 2].copy_from_slice(&v.to_le_bytes()) }
fn put_u32(buf: &mut [u8], off: usize, v: u32) { buf[off..off + 4].copy_from_slice(&v.to_le_bytes()) }
fn put_u64(buf: &mut [u8], off: usize, v: u64) { buf[off..off + 8].copy_from_slice(&v.to_le_bytes()) }

/// Builds a little ELF64 EXEC image with the given PT_LOAD segments.
pub fn build_test_elf(entry: u64, segs: &[ElfSegSpec]) -> Vec<u8> {
    const EHSIZE: usize = 64;
    const PHENTSIZE: usize = 56;
    let phoff = EHSIZE;
    let mut data_off = EHSIZE + segs.len() * PHENTSIZE;
    let mut image = vec![0u8; data_off + segs.iter().map(|s| s.data.len()).sum::<usize>()];

    // ELF header.
    image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little-endian
    image[6] = 1; // EV_CURRENT
    put_u16(&mut image, 16, 2); // ET_EXEC
    put_u16(&mut image, 18, 0x3e); // EM_X86_64
    put_u32(&mut image, 20, 1);
    put_u64(&mut image, 24, entry);
    put_u64(&mut image, 32, phoff as u64);
    put_u16(&mut image, 52, EHSIZE as u16);
    put_u16(&mut image, 54, PHENTSIZE as u16);
    put_u16(&mut image, 56, segs.len() as u16);

    // Program headers + segment bytes.
    for (i, seg) in segs.iter().enumerate() {
        let ph = phoff + i * PHENTSIZE;
        put_u32(&mut image, ph, 1); // PT_LOAD
        put_u32(&mut image, ph + 4, seg.flags);
        put_u64(&mut image, ph + 8, data_off as u64);
        put_u64(&mut image, ph + 16, seg.vaddr);
        put_u64(&mut image, ph + 24, seg.vaddr);
        put_u64(&mut image, ph + 32, seg.data.len() as u64);
        put_u64(&mut image, ph + 40, seg.data.len() as u64);
        put_u64(&mut image, ph + 48, 0x1000);
        image[data_off..data_off + seg.data.len()].copy_from_slice(&seg.data);
        data_off += seg.data.len();
    }
    image
}
