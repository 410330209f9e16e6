// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Default PSCI/SMC handling, grounded in the ARM Power State Coordination
//! Interface function-ID conventions and the reboot/power semantics built
//! around `vm_reboot` in the seL4 ARM VMM this crate generalizes.

use super::Vm;
use crate::host::{HostInterface, RegId, VcpuToken};

const CPU_SUSPEND: u32 = 0x8400_0001;
const CPU_OFF: u32 = 0x8400_0002;
const CPU_ON: u32 = 0x8400_0003;
const SYSTEM_OFF: u32 = 0x8400_0008;
const SYSTEM_RESET: u32 = 0x8400_0009;

/// Returned in x0/r0 for an unrecognised function ID.
pub const NOT_SUPPORTED: i32 = -1;
const SUCCESS: i64 = 0;
const INVALID_PARAMETERS: i64 = -2;
const ALREADY_ON: i64 = -4;
const INTERNAL_FAILURE: i64 = -6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsciOutcome {
    /// Function handled; carries the value the caller writes to x0/r0.
    Handled(i64),
    /// Unknown function ID; caller writes `NOT_SUPPORTED`.
    NotSupported,
    /// `SYSTEM_OFF`: the VM should halt.
    Halt,
}

/// Dispatch a PSCI function ID against the default handler. `args` is the
/// vCPU's x0-x7/r0-r7 at the time of the SMC trap (x0 is `args[0]`, i.e. the
/// function ID itself). A VM-installed custom SMC handler pre-empts this
/// (see `Vm::dispatch_smc`).
pub fn handle(vm: &mut Vm, host: &dyn HostInterface, vcpu: VcpuToken, args: [u64; 8]) -> PsciOutcome {
    let function_id = args[0] as u32;
    match function_id {
        CPU_ON => {
            let target_id = args[1] as u32;
            let entry_pc = args[2];
            log::info!("psci: CPU_ON requested by {vcpu} for vcpu{target_id} entry={entry_pc:#x}");
            match vm.vcpus.get_mut(target_id as usize) {
                Some(target) if !target.online => {
                    if let Err(e) = host.vcpu_write_reg(VcpuToken(target_id), RegId::Pc, entry_pc) {
                        log::error!("psci: failed to seed entry pc for vcpu{target_id}: {e:?}");
                        return PsciOutcome::Handled(INTERNAL_FAILURE);
                    }
                    target.online = true;
                    PsciOutcome::Handled(SUCCESS)
                }
                Some(_) => PsciOutcome::Handled(ALREADY_ON),
                None => PsciOutcome::Handled(INVALID_PARAMETERS),
            }
        }
        CPU_OFF => {
            log::info!("psci: CPU_OFF on {vcpu}");
            if let Some(this) = vm.vcpus.get_mut(vcpu.0 as usize) {
                this.online = false;
                this.suspended = true;
            }
            PsciOutcome::Handled(SUCCESS)
        }
        CPU_SUSPEND => {
            if let Some(this) = vm.vcpus.get_mut(vcpu.0 as usize) {
                this.suspended = true;
            }
            PsciOutcome::Handled(SUCCESS)
        }
        SYSTEM_RESET => {
            log::info!("psci: SYSTEM_RESET");
            match vm.reboot() {
                Ok(()) => PsciOutcome::Handled(SUCCESS),
                Err(_) => PsciOutcome::Halt,
            }
        }
        SYSTEM_OFF => {
            log::info!("psci: SYSTEM_OFF");
            PsciOutcome::Halt
        }
        _ => PsciOutcome::NotSupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimHost;
    use crate::host::Arch;

    fn smc_args(function_id: u32, a1: u64, a2: u64) -> [u64; 8] {
        [function_id as u64, a1, a2, 0, 0, 0, 0, 0]
    }

    #[test]
    fn cpu_on_brings_target_vcpu_online_with_entry_pc() {
        let mut vm = Vm::init("test", Arch::Arm64, 2);
        let host = SimHost::new(2, 4096, Arch::Arm64);
        assert!(!vm.vcpus()[1].online);
        let outcome = handle(&mut vm, &host, VcpuToken(0), smc_args(CPU_ON, 1, 0x4000_1000));
        assert_eq!(outcome, PsciOutcome::Handled(SUCCESS));
        assert!(vm.vcpus()[1].online);
        assert_eq!(host.vcpu_read_reg(VcpuToken(1), RegId::Pc).unwrap(), 0x4000_1000);
    }

    #[test]
    fn cpu_on_already_online_target_is_rejected() {
        let mut vm = Vm::init("test", Arch::Arm64, 2);
        let host = SimHost::new(2, 4096, Arch::Arm64);
        let outcome = handle(&mut vm, &host, VcpuToken(0), smc_args(CPU_ON, 0, 0));
        assert_eq!(outcome, PsciOutcome::Handled(ALREADY_ON));
    }

    #[test]
    fn cpu_on_out_of_range_target_is_invalid() {
        let mut vm = Vm::init("test", Arch::Arm64, 1);
        let host = SimHost::new(1, 4096, Arch::Arm64);
        let outcome = handle(&mut vm, &host, VcpuToken(0), smc_args(CPU_ON, 5, 0));
        assert_eq!(outcome, PsciOutcome::Handled(INVALID_PARAMETERS));
    }

    #[test]
    fn unknown_function_id_is_not_supported() {
        let mut vm = Vm::init("test", Arch::Arm32, 1);
        let host = SimHost::new(1, 4096, Arch::Arm32);
        assert_eq!(handle(&mut vm, &host, VcpuToken(0), smc_args(0xdead, 0, 0)), PsciOutcome::NotSupported);
    }

    #[test]
    fn system_off_requests_halt() {
        let mut vm = Vm::init("test", Arch::Arm32, 1);
        let host = SimHost::new(1, 4096, Arch::Arm32);
        assert_eq!(handle(&mut vm, &host, VcpuToken(0), smc_args(SYSTEM_OFF, 0, 0)), PsciOutcome::Halt);
    }
}
