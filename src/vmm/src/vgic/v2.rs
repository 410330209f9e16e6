// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! GICv2 distributor register layout, MMIO-emulated directly against a
//! `Vgic`. Installed via `GuestMemoryMap::reserve_memory_at` rather than
//! `reserve_mmio_emulated`, because several registers (`ISENABLER`,
//! `ISPENDR`, `SGIR`) are banked per accessing vCPU and the plain
//! `devices::MmioHandler` contract has no vcpu parameter.

use crate::fault::Fault;
use crate::host::{HostInterface, VcpuToken};
use crate::memory::{FaultHandler, FaultResult};
use crate::vgic::Vgic;

pub(crate) const GICD_CTLR: u64 = 0x000;
const GICD_TYPER: u64 = 0x004;
const GICD_ISENABLER: u64 = 0x100;
const GICD_ICENABLER: u64 = 0x180;
const GICD_ISPENDR: u64 = 0x200;
const GICD_ICPENDR: u64 = 0x280;
const GICD_IPRIORITYR: u64 = 0x400;
const GICD_ITARGETSR: u64 = 0x800;
const GICD_SGIR: u64 = 0xf00;

/// The distributor's register decode, free of any owning struct so the
/// v3 redistributor wrapper can reuse the shared-SPI half of the map
/// (`DistributorV3::on_fault`) against its own `Vgic` field.
pub(crate) fn reg_read(vgic: &Vgic, vcpu: usize, offset: u64) -> u64 {
    match offset {
        GICD_CTLR => 1,
        GICD_TYPER => ((vgic.num_vcpus().saturating_sub(1)) as u64) << 5 | 0x1f,
        o if (GICD_ISENABLER..GICD_ICENABLER).contains(&o) => {
            let word_idx = ((o - GICD_ISENABLER) / 4) as usize;
            read_enable_word(vgic, vcpu, word_idx)
        }
        o if (GICD_ICENABLER..GICD_ISPENDR).contains(&o) => {
            let word_idx = ((o - GICD_ICENABLER) / 4) as usize;
            read_enable_word(vgic, vcpu, word_idx)
        }
        o if (GICD_ISPENDR..GICD_ICPENDR).contains(&o) => {
            let word_idx = ((o - GICD_ISPENDR) / 4) as usize;
            read_pending_word(vgic, vcpu, word_idx)
        }
        o if (GICD_ICPENDR..GICD_IPRIORITYR).contains(&o) => {
            let word_idx = ((o - GICD_ICPENDR) / 4) as usize;
            read_pending_word(vgic, vcpu, word_idx)
        }
        o if (GICD_IPRIORITYR..GICD_ITARGETSR).contains(&o) => {
            let irq = (o - GICD_IPRIORITYR) as usize;
            vgic.priority.get(irq).copied().unwrap_or(0) as u64
        }
        o if (GICD_ITARGETSR..GICD_SGIR).contains(&o) => {
            let irq = (o - GICD_ITARGETSR) as usize;
            vgic.target_cpu.get(irq).copied().unwrap_or(0) as u64
        }
        _ => {
            log::debug!("gicv2: read from unimplemented offset {offset:#x}");
            0
        }
    }
}

fn read_enable_word(vgic: &Vgic, vcpu: usize, word_idx: usize) -> u64 {
    if word_idx == 0 {
        // Word 0 covers IRQs 0-31, which are the banked SGI/PPI range.
        vgic.banked_enabled[vcpu] as u64
    } else {
        vgic.enabled.get(word_idx).copied().unwrap_or(0) as u64
    }
}

fn read_pending_word(vgic: &Vgic, vcpu: usize, word_idx: usize) -> u64 {
    if word_idx == 0 {
        vgic.banked_pending[vcpu] as u64
    } else {
        vgic.pending.get(word_idx).copied().unwrap_or(0) as u64
    }
}

pub(crate) fn reg_write(vgic: &mut Vgic, vcpu: usize, offset: u64, value: u64) {
    match offset {
        GICD_CTLR | GICD_TYPER => {}
        o if (GICD_ISENABLER..GICD_ICENABLER).contains(&o) => {
            let word_idx = ((o - GICD_ISENABLER) / 4) as usize;
            set_enable_bits(vgic, vcpu, word_idx, value as u32, true);
        }
        o if (GICD_ICENABLER..GICD_ISPENDR).contains(&o) => {
            let word_idx = ((o - GICD_ICENABLER) / 4) as usize;
            set_enable_bits(vgic, vcpu, word_idx, value as u32, false);
        }
        o if (GICD_ISPENDR..GICD_ICPENDR).contains(&o) => {
            let word_idx = ((o - GICD_ISPENDR) / 4) as usize;
            set_pending_bits(vgic, vcpu, word_idx, value as u32, true);
        }
        o if (GICD_ICPENDR..GICD_IPRIORITYR).contains(&o) => {
            let word_idx = ((o - GICD_ICPENDR) / 4) as usize;
            set_pending_bits(vgic, vcpu, word_idx, value as u32, false);
        }
        o if (GICD_IPRIORITYR..GICD_ITARGETSR).contains(&o) => {
            let irq = (o - GICD_IPRIORITYR) as usize;
            if let Some(slot) = vgic.priority.get_mut(irq) {
                *slot = value as u8;
            }
        }
        o if (GICD_ITARGETSR..GICD_SGIR).contains(&o) => {
            let irq = (o - GICD_ITARGETSR) as usize;
            if let Some(slot) = vgic.target_cpu.get_mut(irq) {
                *slot = value as u8;
            }
        }
        GICD_SGIR => dispatch_sgir(vgic, vcpu, value),
        _ => log::debug!("gicv2: write to unimplemented offset {offset:#x}, dropped"),
    }
}

fn set_enable_bits(vgic: &mut Vgic, vcpu: usize, word_idx: usize, bits: u32, set: bool) {
    let base_irq = (word_idx * 32) as u32;
    for i in 0..32u32 {
        if bits & (1 << i) != 0 {
            let irq = base_irq + i;
            vgic.set_enabled(vcpu, irq, set);
        }
    }
}

fn set_pending_bits(vgic: &mut Vgic, vcpu: usize, word_idx: usize, bits: u32, set: bool) {
    let base_irq = (word_idx * 32) as u32;
    for i in 0..32u32 {
        if bits & (1 << i) != 0 {
            let irq = base_irq + i;
            if set {
                let _ = vgic.inject_irq(vcpu, irq);
            } else {
                vgic.set_pending_bit(vcpu, irq, false);
            }
        }
    }
}

/// `GICD_SGIR` write: dispatch an SGI to the vCPU set named by the
/// `TargetListFilter`/`CPUTargetList` fields (bits [25:24]/[23:16]),
/// self-targets included.
fn dispatch_sgir(vgic: &mut Vgic, vcpu: usize, value: u64) {
    let irq = (value & 0xf) as u32;
    let filter = (value >> 24) & 0b11;
    let target_list = ((value >> 16) & 0xff) as u32;
    let targets: Vec<usize> = match filter {
        0b00 => (0..vgic.num_vcpus())
            .filter(|i| target_list & (1 << i) != 0)
            .collect(),
        0b01 => (0..vgic.num_vcpus()).filter(|&i| i != vcpu).collect(),
        0b10 => vec![vcpu],
        _ => vec![],
    };
    for target in targets {
        let _ = vgic.inject_irq(target, irq);
    }
}

/// MMIO-facing wrapper around a shared `Vgic`; one instance is installed
/// per VM, touched only from the vCPU thread handling the current fault,
/// so no internal locking is needed.
pub struct Distributor {
    vgic: Vgic,
}

impl Distributor {
    pub fn new(vgic: Vgic) -> Self {
        Distributor { vgic }
    }

    pub fn vgic(&mut self) -> &mut Vgic {
        &mut self.vgic
    }
}

impl FaultHandler for Distributor {
    fn on_fault(
        &mut self,
        _host: &dyn HostInterface,
        vcpu: VcpuToken,
        offset: u64,
        fault: &mut Fault,
    ) -> FaultResult {
        let vcpu_idx = vcpu.0 as usize;
        if fault.is_write() {
            reg_write(&mut self.vgic, vcpu_idx, offset, fault.data());
        } else {
            let value = reg_read(&self.vgic, vcpu_idx, offset);
            fault.set_data(value);
        }
        FaultResult::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::{mmio_fault, SimHost};
    use crate::host::Arch;

    #[test]
    fn ctlr_reads_enabled() {
        let dist = Distributor::new(Vgic::new(1));
        assert_eq!(reg_read(&dist.vgic, 0, GICD_CTLR), 1);
    }

    #[test]
    fn isenabler_write_then_read_round_trips() {
        let mut dist = Distributor::new(Vgic::new(1));
        let host = SimHost::new(1, 4096, Arch::Arm32);
        let msg = mmio_fault(VcpuToken(0), GICD_ISENABLER, 0, true, 1 << 5, 1 << 25);
        let mut fault = Fault::from_message(Arch::Arm32, &msg);
        dist.on_fault(&host, VcpuToken(0), GICD_ISENABLER, &mut fault);
        assert!(dist.vgic.is_enabled(0, 5));
    }

    #[test]
    fn sgir_self_target_injects_locally() {
        let mut dist = Distributor::new(Vgic::new(2));
        dist.vgic.set_enabled(0, 3, true);
        dispatch_sgir(&mut dist.vgic, 0, 3 | (0b10 << 24));
        assert!(dist.vgic.list_registers[0].iter().any(|lr| matches!(lr, Some(l) if l.irq == 3)));
    }
}
