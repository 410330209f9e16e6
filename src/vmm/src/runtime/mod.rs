// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The vCPU / VM runtime (RT).
//!
//! Owns the reservation table, interrupt controller, and vCPU set for one
//! VM; runs the `recv -> classify -> dispatch -> reply` loop, classifying
//! each wakeup by the `ExitClass` tags a capability-based kernel delivers
//! rather than a hardware-specific exit-reason enum.

mod psci;

pub use psci::PsciOutcome;

use crate::devices::Device;
use crate::fault::Fault;
use crate::host::{Arch, ExitClass, HostInterface, ReplyMessage, VcpuToken};
use crate::memory::GuestMemoryMap;
use crate::vgic::v2::Distributor;

/// GICv2 distributor frame base, matching the `virt` machine's layout
/// (qemu's `-M virt` puts GICD here). The distributor is dispatched
/// directly by the runtime rather than through a GMM reservation, since it
/// is the one device every VM always has and the runtime already owns it.
pub const GICD_BASE: crate::host::GuestAddr = 0x0800_0000;
pub const GICD_SIZE: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Init,
    Configured,
    Running,
    Stopped,
    Halted,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("host invocation failed")]
    Host(#[from] crate::host::Error),
    #[error("fault handling failed")]
    Fault(#[from] crate::fault::Error),
    #[error("vcpu index out of range: {0}")]
    NoSuchVcpu(u32),
    #[error("VM halted: {0}")]
    Halted(String),
    #[error("reboot hook failed")]
    RebootHookFailed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// One guest CPU. Index 0 is always the boot vCPU and starts online; the
/// rest begin offline until a PSCI `CPU_ON`.
pub struct Vcpu {
    pub token: VcpuToken,
    pub online: bool,
    pub suspended: bool,
    pub last_fault: Option<Fault>,
}

impl Vcpu {
    fn new(index: u32, online: bool) -> Self {
        Vcpu {
            token: VcpuToken(index),
            online,
            suspended: false,
            last_fault: None,
        }
    }
}

type UnhandledVcpuCallback = Box<dyn FnMut(VcpuToken, u32) + Send>;
type RebootHook = Box<dyn FnMut() -> std::result::Result<(), ()> + Send>;

/// The arena that owns everything a running guest needs: vCPUs are held
/// by index, not by pointer, so nothing here needs `Rc` or interior
/// mutability to express ownership.
pub struct Vm {
    pub name: String,
    arch: Arch,
    state: VmState,
    vcpus: Vec<Vcpu>,
    pub memory: GuestMemoryMap,
    pub distributor: Distributor,
    reboot_hooks: Vec<(RebootHook, &'static str)>,
    unhandled_vcpu: Option<UnhandledVcpuCallback>,
    custom_smc: Option<Box<dyn FnMut(&mut Vm, VcpuToken, [u64; 8]) -> Option<[u64; 8]> + Send>>,
}

impl Vm {
    /// `vm_init`: allocate the vCPU set (boot vCPU online, the rest
    /// offline) and the default interrupt controller.
    pub fn init(name: impl Into<String>, arch: Arch, num_vcpus: u32) -> Self {
        let vcpus = (0..num_vcpus)
            .map(|i| Vcpu::new(i, i == 0))
            .collect();
        Vm {
            name: name.into(),
            arch,
            state: VmState::Init,
            vcpus,
            memory: GuestMemoryMap::new(),
            distributor: Distributor::new(crate::vgic::Vgic::create_default(num_vcpus as usize)),
            reboot_hooks: Vec::new(),
            unhandled_vcpu: None,
            custom_smc: None,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn vcpus(&self) -> &[Vcpu] {
        &self.vcpus
    }

    pub fn set_configured(&mut self) {
        self.state = VmState::Configured;
    }

    pub fn install_device(&mut self, start: u64, size: u64, device: Device) -> crate::memory::Result<()> {
        match device {
            Device::Emulated { handler, .. } => self.memory.reserve_mmio_emulated(start, size, handler),
            Device::Passthrough { .. } => self.memory.reserve_device_passthrough(start, size),
            Device::AccessControlled { writable_offsets, .. } => {
                self.memory.reserve_io_access_controlled(start, size, writable_offsets)
            }
            Device::Forwarding { channel, replies, .. } => {
                self.memory.reserve_io_forwarding(start, size, channel, replies)
            }
        }
    }

    pub fn register_unhandled_vcpu_callback(&mut self, cb: impl FnMut(VcpuToken, u32) + Send + 'static) {
        self.unhandled_vcpu = Some(Box::new(cb));
    }

    /// `vm_reboot`: invoke each hook in registration order, aborting on
    /// the first failure. Hooks must be idempotent.
    pub fn reboot(&mut self) -> Result<()> {
        for (hook, name) in self.reboot_hooks.iter_mut() {
            if hook().is_err() {
                log::error!("reboot hook '{name}' failed");
                return Err(Error::RebootHookFailed);
            }
        }
        self.state = VmState::Configured;
        Ok(())
    }

    pub fn register_reboot_hook(&mut self, name: &'static str, hook: impl FnMut() -> std::result::Result<(), ()> + Send + 'static) {
        self.reboot_hooks.push((Box::new(hook), name));
    }

    fn vcpu_mut(&mut self, vcpu: VcpuToken) -> Result<&mut Vcpu> {
        self.vcpus
            .get_mut(vcpu.0 as usize)
            .ok_or(Error::NoSuchVcpu(vcpu.0))
    }

    /// `run_once`: block for one fault IPC, classify it, dispatch, reply.
    /// Returns `Ok(false)` once the VM reaches `Halted`/`Stopped`.
    pub fn run_once(&mut self, host: &dyn HostInterface) -> Result<bool> {
        let msg = match host.ipc_recv() {
            Ok(msg) => msg,
            Err(crate::host::Error::NoMessage) => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let vcpu = msg.vcpu;

        match msg.class {
            ExitClass::VmFault => {
                let fault = Fault::from_message(self.arch, &msg);
                self.dispatch_mmio(host, vcpu, fault)?;
            }
            ExitClass::UnknownSyscall => {
                self.dispatch_smc(host, vcpu, &msg)?;
            }
            ExitClass::VgicMaintenance => {
                self.distributor.vgic().drain_pending(vcpu.0 as usize);
            }
            ExitClass::Notification => {
                log::debug!("notification badge={:#x}", msg.badge);
            }
            ExitClass::VcpuFault => {
                if let Some(cb) = self.unhandled_vcpu.as_mut() {
                    cb(vcpu, msg.syndrome);
                } else {
                    self.state = VmState::Halted;
                    return Err(Error::Halted(format!(
                        "unhandled vcpu fault on {vcpu}: syndrome={:#x}",
                        msg.syndrome
                    )));
                }
            }
        }

        Ok(!matches!(self.state, VmState::Halted | VmState::Stopped))
    }

    /// `run`: drive `run_once` until the VM stops or halts.
    pub fn run(&mut self, host: &dyn HostInterface) -> Result<()> {
        self.state = VmState::Running;
        while self.run_once(host)? {}
        Ok(())
    }

    fn dispatch_mmio(&mut self, host: &dyn HostInterface, vcpu: VcpuToken, mut fault: Fault) -> Result<()> {
        use crate::memory::{FaultHandler, FaultResult};

        let addr = fault.addr();
        let result = if addr >= GICD_BASE && addr < GICD_BASE + GICD_SIZE {
            self.distributor.on_fault(host, vcpu, addr - GICD_BASE, &mut fault)
        } else {
            self.memory.handle_mmio(host, vcpu, &mut fault)
        };
        // `advance`/`ignore` both require `Decoded`; a handler that only
        // touched is_write/width/data (the common case) leaves the fault
        // un-decoded, so decode lazily right before commit.
        match result {
            FaultResult::Handled => {
                if fault.state() != crate::fault::State::Decoded {
                    fault.decode(host)?;
                }
                fault.advance(host)?;
            }
            FaultResult::Restart => {
                fault.restart();
            }
            FaultResult::Ignore => {
                if fault.state() != crate::fault::State::Decoded {
                    fault.decode(host)?;
                }
                fault.ignore(host)?;
            }
            FaultResult::Unhandled => {
                log::warn!("unhandled MMIO fault at {:#x}", fault.addr());
                self.vcpu_mut(vcpu)?.last_fault = Some(fault);
                host.ipc_reply(vcpu, ReplyMessage::Abandon)?;
            }
            FaultResult::Error => {
                self.state = VmState::Halted;
                return Err(Error::Halted(format!("fatal MMIO fault at {:#x}", fault.addr())));
            }
        }
        Ok(())
    }

    fn dispatch_smc(&mut self, host: &dyn HostInterface, vcpu: VcpuToken, _msg: &crate::host::FaultMessage) -> Result<()> {
        use crate::host::RegId;

        // The fault message only ever carries one data word; the full SMC
        // argument registers (x0-x7/r0-r7) live in the vCPU's register file,
        // so calls that pass more than the function ID in x0 (CPU_ON's
        // target vcpu and entry point, notably) need a real register read.
        let regs = host.tcb_read_regs(vcpu)?;
        let mut args = [0u64; 8];
        for (i, arg) in args.iter_mut().enumerate() {
            *arg = regs.read(RegId::Gpr(i as u8));
        }

        if let Some(mut handler) = self.custom_smc.take() {
            let result = handler(self, vcpu, args);
            self.custom_smc = Some(handler);
            if let Some(ret) = result {
                host.vcpu_write_reg(vcpu, RegId::Gpr(0), ret[0])?;
                host.ipc_reply(vcpu, ReplyMessage::Advance { delta: 4 })?;
                return Ok(());
            }
        }
        match psci::handle(self, host, vcpu, args) {
            PsciOutcome::Handled(ret) => {
                host.vcpu_write_reg(vcpu, RegId::Gpr(0), ret as u64)?;
                host.ipc_reply(vcpu, ReplyMessage::Advance { delta: 4 })?;
            }
            PsciOutcome::NotSupported => {
                host.vcpu_write_reg(vcpu, RegId::Gpr(0), psci::NOT_SUPPORTED as i64 as u64)?;
                host.ipc_reply(vcpu, ReplyMessage::Advance { delta: 4 })?;
            }
            PsciOutcome::Halt => {
                self.state = VmState::Halted;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::{mmio_fault, SimHost};

    #[test]
    fn boot_vcpu_starts_online_others_offline() {
        let vm = Vm::init("test", Arch::Arm32, 4);
        assert!(vm.vcpus()[0].online);
        assert!(!vm.vcpus()[1].online);
    }

    #[test]
    fn unhandled_fault_without_reservation_abandons_vcpu() {
        let mut vm = Vm::init("test", Arch::Arm32, 1);
        let host = SimHost::new(1, 4096, Arch::Arm32);
        host.push_fault(mmio_fault(VcpuToken(0), 0xdead0000, 0x8000, true, 0xAB, 1 << 25));
        assert!(vm.run_once(&host).unwrap());
        assert_eq!(vm.vcpus()[0].last_fault.as_ref().map(|f| f.addr()), Some(0xdead0000));
    }

    #[test]
    fn no_pending_message_is_not_an_error() {
        let mut vm = Vm::init("test", Arch::Arm32, 1);
        let host = SimHost::new(1, 4096, Arch::Arm32);
        assert!(vm.run_once(&host).unwrap());
    }

    #[test]
    fn gicd_range_fault_routes_to_distributor_not_gmm() {
        let mut vm = Vm::init("test", Arch::Arm64, 1);
        let host = SimHost::new(1, 4096, Arch::Arm64);
        // GICD_ISENABLER word 1 (IRQs 32-63), bit 1 -> SPI 33. Enabling it
        // should be visible on the distributor itself, proving the fault
        // never reached the GMM (which has no reservation over GICD_BASE).
        host.push_fault(mmio_fault(VcpuToken(0), GICD_BASE + 0x104, 0x8000, true, 1 << 1, 1 << 24));
        assert!(vm.run_once(&host).unwrap());
        assert_eq!(crate::vgic::v2::reg_read(vm.distributor.vgic(), 0, 0x104) & (1 << 1), 1 << 1);
    }

    #[test]
    fn cpu_on_smc_targets_x1_and_sets_pc_from_x2() {
        use crate::host::{ExitClass, FaultMessage, RegId};

        let mut vm = Vm::init("test", Arch::Arm64, 2);
        let host = SimHost::new(2, 4096, Arch::Arm64);
        host.vcpu_write_reg(VcpuToken(0), RegId::Gpr(0), 0x8400_0003).unwrap();
        host.vcpu_write_reg(VcpuToken(0), RegId::Gpr(1), 1).unwrap();
        host.vcpu_write_reg(VcpuToken(0), RegId::Gpr(2), 0x4000_1000).unwrap();
        host.push_fault(FaultMessage {
            vcpu: VcpuToken(0),
            class: ExitClass::UnknownSyscall,
            addr: 0,
            ip: 0x8000,
            syndrome: 0,
            is_prefetch: false,
            is_write: false,
            data: 0,
            badge: 0,
        });
        assert!(vm.run_once(&host).unwrap());
        assert!(vm.vcpus()[1].online);
        assert_eq!(host.vcpu_read_reg(VcpuToken(1), crate::host::RegId::Pc).unwrap(), 0x4000_1000);
        assert_eq!(host.vcpu_read_reg(VcpuToken(0), crate::host::RegId::Gpr(0)).unwrap(), 0);
    }
}
