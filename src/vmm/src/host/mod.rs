// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The host interface (HI): the only surface allowed to talk to the kernel.
//!
//! Every other module reaches the outside world through a `HostInterface`
//! implementation. The trait is deliberately narrow and mirrors the
//! capability invocations a seL4-style microkernel exposes: register
//! read/write, SMC forwarding, page mapping, and endpoint IPC. No kernel
//! identifiers leak past this boundary (see the glossary entry for HI).

pub mod sim;

use std::fmt;

/// Guest-physical address (an IPA).
pub type GuestAddr = u64;

/// A raw machine word as the host ABI would deliver it.
pub type Word = u64;

/// Target CPU architecture of the guest this VM is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm32,
    Arm64,
}

/// An opaque reference to a vCPU, minted by the runtime when it creates one.
/// Carried as a plain index into the runtime's vCPU arena rather than a
/// pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuToken(pub u32);

/// Opaque handle to a slot in a VM's capability space (CNode index). Never
/// interpreted by this crate; a production backend resolves it against the
/// kernel's actual cspace layout.
pub type CapSlot = u64;

/// Names a single architectural register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegId {
    /// A general-purpose register, rN (A32) or xN (A64).
    Gpr(u8),
    Pc,
    /// CPSR on A32, PSTATE/SPSR on A64.
    Cpsr,
    Sp,
}

/// A full general-purpose register file snapshot for one vCPU.
#[derive(Debug, Clone)]
pub struct Regs {
    pub arch: Arch,
    pub gprs: [Word; 31],
    pub pc: Word,
    pub cpsr: Word,
    pub sp: Word,
}

impl Regs {
    pub fn new(arch: Arch) -> Self {
        Regs {
            arch,
            gprs: [0; 31],
            pc: 0,
            cpsr: 0,
            sp: 0,
        }
    }

    pub fn read(&self, reg: RegId) -> Word {
        match reg {
            // A64's 5-bit Rt field can name x31, which architecturally
            // reads as the zero register (XZR) rather than a storage slot.
            RegId::Gpr(31) => 0,
            RegId::Gpr(n) => self.gprs[n as usize],
            RegId::Pc => self.pc,
            RegId::Cpsr => self.cpsr,
            RegId::Sp => self.sp,
        }
    }

    pub fn write(&mut self, reg: RegId, value: Word) {
        match reg {
            // Writes to x31/XZR are discarded, per A64 convention.
            RegId::Gpr(31) => {}
            RegId::Gpr(n) => self.gprs[n as usize] = value,
            RegId::Pc => self.pc = value,
            RegId::Cpsr => self.cpsr = value,
            RegId::Sp => self.sp = value,
        }
    }
}

/// Page mapping permission bits requested of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRights {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl MapRights {
    pub const RW: MapRights = MapRights {
        read: true,
        write: true,
        exec: false,
    };
    pub const RO: MapRights = MapRights {
        read: true,
        write: false,
        exec: false,
    };
    pub const RWX: MapRights = MapRights {
        read: true,
        write: true,
        exec: true,
    };
}

/// Classifies the IPC tag the kernel used to wake the VMM thread, feeding
/// the runtime's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    VmFault,
    UnknownSyscall,
    VgicMaintenance,
    Notification,
    VcpuFault,
}

/// A decoded trap delivered by `ipc_recv`.
#[derive(Debug, Clone)]
pub struct FaultMessage {
    pub vcpu: VcpuToken,
    pub class: ExitClass,
    /// Faulting IPA, meaningful for `VmFault`.
    pub addr: GuestAddr,
    /// IP at the time of the fault.
    pub ip: GuestAddr,
    /// Raw syndrome register (ISS+IL packed as the architecture defines).
    pub syndrome: u32,
    pub is_prefetch: bool,
    pub is_write: bool,
    /// Right-justified write data, valid when `is_write`.
    pub data: Word,
    /// Badge carried by a `Notification` message.
    pub badge: u64,
}

/// A reply to resume (or not resume) the faulting vCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMessage {
    /// Resume with PC advanced by `delta` bytes.
    Advance { delta: u8 },
    /// Resume without touching PC (after a mapping was installed).
    Restart,
    /// Drop the reply capability; the vCPU does not resume.
    Abandon,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("host invocation failed: {0}")]
    HostError(i32),
    #[error("no pending fault message")]
    NoMessage,
}

pub type Result<T> = std::result::Result<T, Error>;

/// The narrow, capability-mediated surface used to talk to the kernel.
///
/// A production backend wraps the platform's actual invocation ABI; the
/// `sim` submodule provides an in-process double used by the rest of the
/// crate's unit tests.
pub trait HostInterface {
    fn tcb_read_regs(&self, vcpu: VcpuToken) -> Result<Regs>;
    fn tcb_write_regs(&self, vcpu: VcpuToken, regs: &Regs) -> Result<()>;

    fn vcpu_read_reg(&self, vcpu: VcpuToken, reg: RegId) -> Result<Word> {
        Ok(self.tcb_read_regs(vcpu)?.read(reg))
    }

    fn vcpu_write_reg(&self, vcpu: VcpuToken, reg: RegId, value: Word) -> Result<()> {
        let mut regs = self.tcb_read_regs(vcpu)?;
        regs.write(reg, value);
        self.tcb_write_regs(vcpu, &regs)
    }

    fn read_mem(&self, vcpu: VcpuToken, ipa: GuestAddr, buf: &mut [u8]) -> Result<()>;
    fn write_mem(&self, vcpu: VcpuToken, ipa: GuestAddr, buf: &[u8]) -> Result<()>;

    fn map_frame(
        &self,
        vcpu: VcpuToken,
        ipa: GuestAddr,
        size_bits: u8,
        rights: MapRights,
        cacheable: bool,
    ) -> Result<()>;

    fn unmap_frame(&self, vcpu: VcpuToken, ipa: GuestAddr) -> Result<()>;

    fn smc_call(&self, vcpu: VcpuToken, args: [Word; 8]) -> Result<[Word; 8]>;

    fn ipc_recv(&self) -> Result<FaultMessage>;
    fn ipc_reply(&self, vcpu: VcpuToken, msg: ReplyMessage) -> Result<()>;

    /// CNode_Mint: derive a new capability at `dst` from `src`, masking its
    /// rights down to `rights` and attaching `badge`. A production backend
    /// uses this during VM setup to mint each vCPU's badged fault-endpoint
    /// capability, so a single shared endpoint's `ipc_recv` can tell vCPUs
    /// apart by badge instead of by a separate capability per vCPU.
    fn cnode_mint(&self, src: CapSlot, dst: CapSlot, rights: MapRights, badge: u64) -> Result<()>;
}

impl fmt::Display for VcpuToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vcpu{}", self.0)
    }
}
