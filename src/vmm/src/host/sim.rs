// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! An in-process `HostInterface` test double.
//!
//! `SimHost` keeps a per-vcpu register file and a flat byte-addressed guest
//! memory buffer, plus a queue of fault messages an owning test (or the
//! `capvmm` binary in `sim` mode) can feed in. It exists so the rest of the
//! engine is exercisable without a real microkernel; production deployments
//! plug in a different `HostInterface` implementation that talks to the
//! actual kernel ABI, which is out of scope here by design.

use std::collections::VecDeque;
use std::sync::Mutex;

use super::{
    Arch, Error, ExitClass, FaultMessage, GuestAddr, HostInterface, MapRights, RegId, Regs,
    ReplyMessage, Result, VcpuToken, Word,
};

struct SimState {
    regs: Vec<Regs>,
    mem: Vec<u8>,
    pending: VecDeque<FaultMessage>,
    replies: Vec<ReplyMessage>,
}

pub struct SimHost {
    inner: Mutex<SimState>,
}

impl SimHost {
    pub fn new(num_vcpus: usize, mem_size: usize, arch: Arch) -> Self {
        SimHost {
            inner: Mutex::new(SimState {
                regs: (0..num_vcpus).map(|_| Regs::new(arch)).collect(),
                mem: vec![0u8; mem_size],
                pending: VecDeque::new(),
                replies: Vec::new(),
            }),
        }
    }

    /// Enqueue a fault message as if the kernel had delivered it.
    pub fn push_fault(&self, msg: FaultMessage) {
        self.inner.lock().unwrap().pending.push_back(msg);
    }

    /// Drain the replies issued so far via `ipc_reply`, oldest first.
    pub fn take_replies(&self) -> Vec<ReplyMessage> {
        std::mem::take(&mut self.inner.lock().unwrap().replies)
    }

    pub fn mem_len(&self) -> usize {
        self.inner.lock().unwrap().mem.len()
    }
}

impl HostInterface for SimHost {
    fn tcb_read_regs(&self, vcpu: VcpuToken) -> Result<Regs> {
        let state = self.inner.lock().unwrap();
        state
            .regs
            .get(vcpu.0 as usize)
            .cloned()
            .ok_or(Error::HostError(-1))
    }

    fn tcb_write_regs(&self, vcpu: VcpuToken, regs: &Regs) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let slot = state.regs.get_mut(vcpu.0 as usize).ok_or(Error::HostError(-1))?;
        *slot = regs.clone();
        Ok(())
    }

    fn read_mem(&self, _vcpu: VcpuToken, ipa: GuestAddr, buf: &mut [u8]) -> Result<()> {
        let state = self.inner.lock().unwrap();
        let start = ipa as usize;
        let end = start.checked_add(buf.len()).ok_or(Error::HostError(-1))?;
        if end > state.mem.len() {
            return Err(Error::HostError(-1));
        }
        buf.copy_from_slice(&state.mem[start..end]);
        Ok(())
    }

    fn write_mem(&self, _vcpu: VcpuToken, ipa: GuestAddr, buf: &[u8]) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        let start = ipa as usize;
        let end = start.checked_add(buf.len()).ok_or(Error::HostError(-1))?;
        if end > state.mem.len() {
            return Err(Error::HostError(-1));
        }
        state.mem[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn map_frame(
        &self,
        _vcpu: VcpuToken,
        _ipa: GuestAddr,
        _size_bits: u8,
        _rights: MapRights,
        _cacheable: bool,
    ) -> Result<()> {
        // The sim backend's memory is always "mapped"; mapping is a no-op.
        Ok(())
    }

    fn unmap_frame(&self, _vcpu: VcpuToken, _ipa: GuestAddr) -> Result<()> {
        Ok(())
    }

    fn smc_call(&self, _vcpu: VcpuToken, args: [Word; 8]) -> Result<[Word; 8]> {
        // No secure firmware behind the sim backend; echo back NOT_SUPPORTED
        // in the PSCI convention (x0/w0 for the caller to interpret).
        let mut ret = [0u64; 8];
        ret[0] = args[0];
        Ok(ret)
    }

    fn ipc_recv(&self) -> Result<FaultMessage> {
        let mut state = self.inner.lock().unwrap();
        state.pending.pop_front().ok_or(Error::NoMessage)
    }

    fn ipc_reply(&self, _vcpu: VcpuToken, msg: ReplyMessage) -> Result<()> {
        self.inner.lock().unwrap().replies.push(msg);
        Ok(())
    }

    fn cnode_mint(&self, _src: crate::host::CapSlot, _dst: crate::host::CapSlot, _rights: MapRights, _badge: u64) -> Result<()> {
        // The sim backend has no real cspace to mint capabilities into.
        Ok(())
    }
}

/// Convenience builder for a `VmFault` message, used throughout the test
/// suites for FD/GMM/DD.
pub fn mmio_fault(
    vcpu: VcpuToken,
    addr: GuestAddr,
    ip: GuestAddr,
    is_write: bool,
    data: Word,
    syndrome: u32,
) -> FaultMessage {
    FaultMessage {
        vcpu,
        class: ExitClass::VmFault,
        addr,
        ip,
        syndrome,
        is_prefetch: false,
        is_write,
        data,
        badge: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regs_round_trip() {
        let host = SimHost::new(1, 4096, Arch::Arm32);
        host.tcb_write_regs(
            VcpuToken(0),
            &Regs {
                arch: Arch::Arm32,
                gprs: [7; 31],
                pc: 0x8000,
                cpsr: 0x13,
                sp: 0,
            },
        )
        .unwrap();
        let regs = host.tcb_read_regs(VcpuToken(0)).unwrap();
        assert_eq!(regs.pc, 0x8000);
        assert_eq!(regs.read(RegId::Gpr(3)), 7);
    }

    #[test]
    fn mem_round_trip() {
        let host = SimHost::new(1, 4096, Arch::Arm32);
        host.write_mem(VcpuToken(0), 0x100, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        host.read_mem(VcpuToken(0), 0x100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn mem_out_of_bounds_fails() {
        let host = SimHost::new(1, 16, Arch::Arm32);
        let mut buf = [0u8; 4];
        assert!(host.read_mem(VcpuToken(0), 100, &mut buf).is_err());
    }

    #[test]
    fn fault_queue_is_fifo() {
        let host = SimHost::new(1, 4096, Arch::Arm32);
        host.push_fault(mmio_fault(VcpuToken(0), 0x10, 0x8000, true, 0xAB, 0));
        let msg = host.ipc_recv().unwrap();
        assert_eq!(msg.addr, 0x10);
        assert!(host.ipc_recv().is_err());
    }
}
