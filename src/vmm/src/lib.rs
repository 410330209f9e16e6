// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A type-1 hypervisor's userspace half, running as an unprivileged thread
//! pair of capability invocations against a seL4-style microkernel. The
//! [`Vmm`] facade ties together every module this crate exposes:
//!
//! - [`host`] (HI): the capability-invocation surface, kernel-agnostic.
//! - [`fault`] (FD): decodes the trap syndrome into a committable access.
//! - [`memory`] (GMM/DD): the guest-physical reservation table.
//! - [`vgic`]: the virtual interrupt controller.
//! - [`devices`]: concrete `MmioHandler`/`Device` implementations.
//! - [`runtime`] (RT): the vCPU/VM arena and its dispatch loop.
//! - [`boot`] (IB): image detection, loading, and boot-register seeding.
//! - [`config`]: CLI-facing configuration, feeding `runtime::Vm::init`.
//! - [`ioport`] (IOP): a generic 16-bit port-range registry, for guests
//!   that need one; this crate's own `Vmm` facade is ARM-only and never
//!   wires one up (see the design ledger).

pub mod boot;
pub mod config;
pub mod devices;
pub mod fault;
pub mod host;
pub mod ioport;
pub mod memory;
pub mod runtime;
pub mod vgic;

use std::fs;
use std::path::PathBuf;

use host::{GuestAddr, HostInterface, VcpuToken};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Boot(#[from] boot::Error),
    #[error(transparent)]
    Memory(#[from] memory::Error),
    #[error(transparent)]
    Runtime(#[from] runtime::Error),
    #[error(transparent)]
    Host(#[from] host::Error),
    #[error("failed to read {0:?}: {1}")]
    ImageRead(PathBuf, #[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Guest RAM base, matching the `virt`-style machine layout `runtime`'s
/// `GICD_BASE` already assumes (RAM well above the GICD/console MMIO
/// windows at `0x0800_0000`/`0x0900_0000`).
pub const RAM_BASE: GuestAddr = 0x4000_0000;
const CONSOLE_BASE: GuestAddr = 0x0900_0000;
const CONSOLE_SIZE: u64 = 0x1000;
/// SPI the console's `IrqLine` is wired to; picked clear of the handful of
/// SPIs a `virt`-style platform reserves for its other fixed devices.
const CONSOLE_IRQ: u32 = 33;

fn align_up(addr: GuestAddr, align: u64) -> GuestAddr {
    (addr + align - 1) & !(align - 1)
}

/// End-to-end facade: builds a [`runtime::Vm`] from a [`config::VmConfig`],
/// installs the always-present console device, loads the boot image, seeds
/// boot registers, and exposes [`Vmm::run`] to drive it to completion.
pub struct Vmm<H: HostInterface> {
    pub vm: runtime::Vm,
    pub host: H,
    console_irq: devices::console::IrqLine,
}

impl<H: HostInterface> Vmm<H> {
    /// `vm_init` + boot, folded into one constructor: reserve RAM, install
    /// the console, detect and load the kernel image, build the ATAG list
    /// (and, on AArch64 with a `--dtb` path, the device tree blob), and
    /// seed the boot vCPU's entry registers per the Linux boot
    /// convention.
    pub fn new(cfg: config::VmConfig, host: H) -> Result<Self> {
        let mut vm = runtime::Vm::init(cfg.name.clone(), cfg.arch, cfg.num_vcpus);

        let ram_size = (cfg.memory_mb as u64) * 1024 * 1024;
        vm.memory.reserve_ram_one_to_one(RAM_BASE, ram_size)?;

        let (console, irq) = devices::console::Console::new();
        vm.install_device(
            CONSOLE_BASE,
            CONSOLE_SIZE,
            devices::Device::Emulated {
                name: "console".into(),
                handler: Box::new(console),
            },
        )?;

        let boot_vcpu = VcpuToken(cfg.boot_vcpu_index);
        let kernel_bytes = fs::read(&cfg.kernel_path).map_err(|e| Error::ImageRead(cfg.kernel_path.clone(), e))?;
        let kind = boot::detect(&kernel_bytes)?;
        let hint = match kind {
            boot::ImageKind::ZImage => boot::zimage_load_address(&kernel_bytes, RAM_BASE),
            _ => RAM_BASE,
        };
        let loaded = boot::load_kernel(&host, boot_vcpu, &kernel_bytes, kind, hint)?;

        let mut tail = loaded.end;
        if let Some(initrd_path) = cfg.initrd_path.as_ref() {
            let initrd_bytes = fs::read(initrd_path).map_err(|e| Error::ImageRead(initrd_path.clone(), e))?;
            let initrd_base = align_up(tail, 0x1000);
            host.write_mem(boot_vcpu, initrd_base, &initrd_bytes)?;
            tail = initrd_base + initrd_bytes.len() as u64;
        }

        let atags_ipa = align_up(tail, 0x100);
        let mut atags = boot::atags::AtagList::new();
        atags.add_mem(ram_size as u32, RAM_BASE as u32);
        atags.append_cmdline(cfg.cmdline.as_str());
        host.write_mem(boot_vcpu, atags_ipa, &atags.to_bytes())?;
        tail = atags_ipa;

        // AArch32 boots off ATAGS (r1=machine_id, r2=atags_ipa); AArch64
        // wants a DTB in x0. Without a supplied DTB there is nothing valid
        // to hand an AArch64 kernel in x0, so the ATAG block's address is
        // passed through as a best-effort placeholder (see DESIGN.md).
        let machine_id_or_dtb = match cfg.arch {
            host::Arch::Arm32 => cfg.machine_id as u64,
            host::Arch::Arm64 => match cfg.dtb_path.as_ref() {
                Some(dtb_path) => {
                    let dtb_bytes = fs::read(dtb_path).map_err(|e| Error::ImageRead(dtb_path.clone(), e))?;
                    let dtb_base = align_up(tail, 0x1000);
                    host.write_mem(boot_vcpu, dtb_base, &dtb_bytes)?;
                    dtb_base
                }
                None => atags_ipa,
            },
        };

        boot::set_bootargs(&host, boot_vcpu, cfg.arch, loaded.entry, machine_id_or_dtb, atags_ipa)?;

        vm.set_configured();

        Ok(Vmm { vm, host, console_irq: irq })
    }

    /// Drive the VM to completion, forwarding the console's latched IRQ
    /// line into the vGIC as a level-triggered SPI once per dispatch
    /// iteration; the vGIC maintenance IPC covers everything else.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.console_irq.take_pending() {
                self.vm.distributor.vgic().set_irq_level(0, CONSOLE_IRQ, true);
            }
            if !self.vm.run_once(&self.host)? {
                break;
            }
        }
        Ok(())
    }
}
