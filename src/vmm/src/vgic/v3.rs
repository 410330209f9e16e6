// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! GICv3 distributor + redistributor, reduced relative to v2:
//! the shared distributor half reuses `v2::Distributor`'s SPI bit-array
//! logic verbatim (GICv3 keeps SPI config in `GICD_*` at the same
//! offsets), while the per-vCPU redistributor frame is a register-
//! readback stub for the banked SGI/PPI bits. As with v2, priority
//! registers read back what was written but do not affect LR ordering.
//!
//! Real hardware places one redistributor frame pair (RD_base + SGI_base)
//! per vCPU, contiguous at a fixed stride; `DistributorV3` models that by
//! treating any offset past the GICD region as
//! `vcpu = (offset - GICD_SIZE) / FRAME_STRIDE`, which is also the vCPU
//! that issued the access on real GICv3 hardware (a CPU only ever maps its
//! own redistributor frame).

use crate::fault::Fault;
use crate::host::{HostInterface, VcpuToken};
use crate::memory::{FaultHandler, FaultResult};
use crate::vgic::Vgic;

/// Matches `v2::GICD_SIZE`; the GICD register map itself is identical
/// between v2 and v3 for the SPI-only subset this crate implements.
const GICD_SIZE: u64 = 0x1000;
/// RD_base (64KiB) + SGI_base (64KiB), the minimum GICv3 redistributor
/// frame pair size per the architecture.
const FRAME_STRIDE: u64 = 0x2_0000;
/// SGI_base starts 64KiB into each frame pair; its offsets are unchanged
/// from the constants below regardless of which vCPU's frame this is.
const SGI_BASE_OFFSET: u64 = 0x1_0000;

const GICR_CTLR: u64 = 0x0000;
const GICR_TYPER: u64 = 0x0008;
const GICR_WAKER: u64 = 0x0014;
const GICR_ISENABLER0: u64 = 0x0100;
const GICR_ICENABLER0: u64 = 0x0180;
const GICR_ISPENDR0: u64 = 0x0200;
const GICR_ICPENDR0: u64 = 0x0280;
const GICR_IPRIORITYR: u64 = 0x0400;

fn redistributor_read(vgic: &Vgic, vcpu: usize, offset: u64) -> u64 {
    match offset {
        GICR_CTLR => 0,
        GICR_TYPER => ((vcpu + 1 == vgic.num_vcpus()) as u64) << 4,
        GICR_WAKER => 0,
        GICR_ISENABLER0 | GICR_ICENABLER0 => vgic.banked_enabled[vcpu] as u64,
        GICR_ISPENDR0 | GICR_ICPENDR0 => vgic.banked_pending[vcpu] as u64,
        o if (GICR_IPRIORITYR..GICR_IPRIORITYR + 32).contains(&o) => {
            vgic.priority.get((o - GICR_IPRIORITYR) as usize).copied().unwrap_or(0) as u64
        }
        _ => {
            log::debug!("gicv3 redistributor: read from unimplemented offset {offset:#x}");
            0
        }
    }
}

fn redistributor_write(vgic: &mut Vgic, vcpu: usize, offset: u64, value: u64) {
    match offset {
        GICR_CTLR | GICR_WAKER => {}
        GICR_ISENABLER0 => {
            for irq in set_bits(value as u32) {
                vgic.set_enabled(vcpu, irq, true);
            }
        }
        GICR_ICENABLER0 => {
            for irq in set_bits(value as u32) {
                vgic.set_enabled(vcpu, irq, false);
            }
        }
        GICR_ISPENDR0 => {
            for irq in set_bits(value as u32) {
                let _ = vgic.inject_irq(vcpu, irq);
            }
        }
        GICR_ICPENDR0 => {
            for irq in set_bits(value as u32) {
                vgic.set_pending_bit(vcpu, irq, false);
            }
        }
        o if (GICR_IPRIORITYR..GICR_IPRIORITYR + 32).contains(&o) => {
            if let Some(slot) = vgic.priority.get_mut((o - GICR_IPRIORITYR) as usize) {
                *slot = value as u8;
            }
        }
        _ => log::debug!("gicv3 redistributor: write to unimplemented offset {offset:#x}, dropped"),
    }
}

fn set_bits(word: u32) -> impl Iterator<Item = u32> {
    (0..32u32).filter(move |i| word & (1 << i) != 0)
}

/// MMIO-facing wrapper installed over the combined GICD + GICR address
/// range, mirroring `v2::Distributor`'s role for the v2 layout.
pub struct DistributorV3 {
    vgic: Vgic,
}

impl DistributorV3 {
    pub fn new(vgic: Vgic) -> Self {
        DistributorV3 { vgic }
    }

    pub fn vgic(&mut self) -> &mut Vgic {
        &mut self.vgic
    }
}

impl FaultHandler for DistributorV3 {
    fn on_fault(&mut self, host: &dyn HostInterface, vcpu: VcpuToken, offset: u64, fault: &mut Fault) -> FaultResult {
        if offset < GICD_SIZE {
            // Delegate to the v2 distributor's SPI-only register logic;
            // it never touches banked state for the accessing vcpu
            // outside word 0, which GICv3 routes through GICR instead.
            let vcpu_idx = vcpu.0 as usize;
            if fault.is_write() {
                crate::vgic::v2::reg_write(&mut self.vgic, vcpu_idx, offset, fault.data());
            } else {
                fault.set_data(crate::vgic::v2::reg_read(&self.vgic, vcpu_idx, offset));
            }
            return FaultResult::Handled;
        }
        let frame_offset = offset - GICD_SIZE;
        let rd_index = (frame_offset / FRAME_STRIDE) as usize;
        let within_frame = frame_offset % FRAME_STRIDE;
        if within_frame < SGI_BASE_OFFSET {
            // RD_base frame: only TYPER/CTLR/WAKER are modelled, already
            // covered by the SGI_base-relative offsets above zero.
            let value = redistributor_read(&self.vgic, rd_index, within_frame);
            if fault.is_write() {
                redistributor_write(&mut self.vgic, rd_index, within_frame, fault.data());
            } else {
                fault.set_data(value);
            }
        } else {
            let sgi_offset = within_frame - SGI_BASE_OFFSET;
            if fault.is_write() {
                redistributor_write(&mut self.vgic, rd_index, sgi_offset, fault.data());
            } else {
                fault.set_data(redistributor_read(&self.vgic, rd_index, sgi_offset));
            }
        }
        let _ = host;
        FaultResult::Handled
    }
}

/// `ICC_SGI1R_EL1` write (v3's system-register replacement for v2's
/// `GICD_SGIR` MMIO write): dispatch an SGI per the affinity/target-list
/// encoding. Routed here from the runtime's vCPU-fault path (a system
/// register trap, not an MMIO fault), since v3 SGI generation never goes
/// through device dispatch at all.
pub fn handle_icc_sgi1r(vgic: &mut Vgic, from_vcpu: usize, value: u64) {
    let irq = ((value >> 24) & 0xf) as u32;
    let irm = (value >> 40) & 1;
    let target_list = (value & 0xffff) as u32;
    if irm == 1 {
        for target in 0..vgic.num_vcpus() {
            if target != from_vcpu {
                let _ = vgic.inject_irq(target, irq);
            }
        }
        return;
    }
    for target in set_bits(target_list).map(|b| b as usize) {
        if target < vgic.num_vcpus() {
            let _ = vgic.inject_irq(target, irq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_bit_set_only_for_final_redistributor() {
        let vgic = Vgic::new(2);
        assert_eq!(redistributor_read(&vgic, 0, GICR_TYPER) & 0x10, 0);
        assert_eq!(redistributor_read(&vgic, 1, GICR_TYPER) & 0x10, 0x10);
    }

    #[test]
    fn isenabler0_write_then_read_round_trips() {
        let mut vgic = Vgic::new(1);
        redistributor_write(&mut vgic, 0, GICR_ISENABLER0, 1 << 5);
        assert!(vgic.is_enabled(0, 5));
        assert_eq!(redistributor_read(&vgic, 0, GICR_ISENABLER0) & (1 << 5), 1 << 5);
    }

    #[test]
    fn icc_sgi1r_interrupt_routing_broadcast_skips_sender() {
        let mut vgic = Vgic::new(3);
        for v in 0..3 {
            vgic.set_enabled(v, 9, true);
        }
        handle_icc_sgi1r(&mut vgic, 0, (9u64 << 24) | (1u64 << 40));
        assert!(vgic.list_registers[0].iter().all(|lr| lr.is_none()));
        assert!(vgic.list_registers[1].iter().any(|lr| matches!(lr, Some(l) if l.irq == 9)));
        assert!(vgic.list_registers[2].iter().any(|lr| matches!(lr, Some(l) if l.irq == 9)));
    }

    #[test]
    fn distributor_v3_dispatches_gicd_range_to_v2_logic() {
        use crate::host::sim::{mmio_fault, SimHost};
        use crate::host::Arch;
        let mut dist = DistributorV3::new(Vgic::new(1));
        let host = SimHost::new(1, 4096, Arch::Arm64);
        let msg = mmio_fault(VcpuToken(0), 0, 0, false, 0, 1 << 25);
        let mut fault = Fault::from_message(Arch::Arm64, &msg);
        let result = dist.on_fault(&host, VcpuToken(0), 0x000, &mut fault);
        assert_eq!(result, FaultResult::Handled);
        assert_eq!(fault.data(), 1);
    }
}
