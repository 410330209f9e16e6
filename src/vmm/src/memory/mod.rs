// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The guest memory map (GMM) and device dispatch (DD).
//!
//! A sorted, non-overlapping reservation table covering the guest-physical
//! address space. Grounded in `sel4vm/guest_memory.h`'s
//! `vm_reserve_memory_at`/`vm_reserve_anon_memory`/`vm_memory_handle_fault`
//! contract, and backed by `vm-memory`'s `GuestMemoryMmap` for the actual
//! byte storage the fault decoder touches.

mod alloc;

pub use alloc::AllocationMap;

use crate::host::{GuestAddr, HostInterface, MapRights, VcpuToken, Word};

/// Result of dispatching a fault to a reservation's handler, mirroring the
/// original `memory_fault_result_t` (`FAULT_HANDLED` etc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    /// The handler wrote a result; commit with `advance`.
    Handled,
    /// A mapping was installed; re-execute with `restart`.
    Restart,
    /// Advance PC with no register side-effects.
    Ignore,
    /// No reservation (or handler) claims this address.
    Unhandled,
    /// Fatal; the VM must be halted.
    Error,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reservation [{new_start:#x}, {new_end:#x}) overlaps existing [{old_start:#x}, {old_end:#x})")]
    Overlap {
        new_start: GuestAddr,
        new_end: GuestAddr,
        old_start: GuestAddr,
        old_end: GuestAddr,
    },
    #[error("no reservation covers address {0:#x}")]
    NotFound(GuestAddr),
    #[error("host invocation failed")]
    Host(#[from] crate::host::Error),
    #[error("RAM region exhausted")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-reservation behavior. GMM itself only knows how to route a fault to
/// the right reservation; everything about *what happens* for a given
/// `ReservationKind` lives behind this trait, built once by the
/// constructor that created the reservation (`reserve_ram_allocated`,
/// `reserve_mmio_emulated`, ...). Object-safe so it can be boxed rather
/// than requiring an inheritance hierarchy of reservation types.
pub trait FaultHandler: Send {
    fn on_fault(
        &mut self,
        host: &dyn HostInterface,
        vcpu: VcpuToken,
        offset: u64,
        fault: &mut crate::fault::Fault,
    ) -> FaultResult;
}

/// Which of the eight kinds a reservation is. Carried
/// alongside the handler purely for introspection and for
/// `vm_map_reservation`-style bulk mapping; the handler already encodes the
/// runtime behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationKind {
    RamOneToOne,
    RamAllocated,
    Anonymous,
    DevicePassthrough,
    MmioEmulated,
    IoAccessControlled,
    IoListening,
    IoForwarding,
}

pub struct Reservation {
    pub start: GuestAddr,
    pub size: u64,
    pub kind: ReservationKind,
    handler: Box<dyn FaultHandler>,
    /// Present only for RAM reservations; tracks sub-allocation state.
    pub ram: Option<AllocationMap>,
}

impl Reservation {
    pub fn end(&self) -> GuestAddr {
        self.start + self.size
    }

    fn contains(&self, addr: GuestAddr) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// The sorted reservation table plus the dispatch entry point (`handle_mmio`).
#[derive(Default)]
pub struct GuestMemoryMap {
    reservations: Vec<Reservation>,
}

impl GuestMemoryMap {
    pub fn new() -> Self {
        GuestMemoryMap {
            reservations: Vec::new(),
        }
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    fn insert(&mut self, start: GuestAddr, size: u64, kind: ReservationKind, handler: Box<dyn FaultHandler>, ram: Option<AllocationMap>) -> Result<()> {
        let end = start + size;
        let idx = self
            .reservations
            .partition_point(|r| r.start < start);

        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.reservations.get(i)) {
            if prev.end() > start {
                return Err(Error::Overlap {
                    new_start: start,
                    new_end: end,
                    old_start: prev.start,
                    old_end: prev.end(),
                });
            }
        }
        if let Some(next) = self.reservations.get(idx) {
            if next.start < end {
                return Err(Error::Overlap {
                    new_start: start,
                    new_end: end,
                    old_start: next.start,
                    old_end: next.end(),
                });
            }
        }

        self.reservations.insert(
            idx,
            Reservation {
                start,
                size,
                kind,
                handler,
                ram,
            },
        );
        Ok(())
    }

    /// `reserve_memory_at`: install a reservation with a caller-supplied
    /// handler at a fixed base address.
    pub fn reserve_memory_at(
        &mut self,
        start: GuestAddr,
        size: u64,
        kind: ReservationKind,
        handler: Box<dyn FaultHandler>,
    ) -> Result<()> {
        self.insert(start, size, kind, handler, None)
    }

    pub fn reserve_ram_one_to_one(&mut self, start: GuestAddr, size: u64) -> Result<()> {
        self.insert(
            start,
            size,
            ReservationKind::RamOneToOne,
            Box::new(RamOneToOneHandler),
            None,
        )
    }

    pub fn reserve_ram_allocated(&mut self, start: GuestAddr, size: u64) -> Result<()> {
        self.insert(
            start,
            size,
            ReservationKind::RamAllocated,
            Box::new(DemandMapHandler),
            Some(AllocationMap::new(size)),
        )
    }

    /// `reserve_anon_memory`: identical behavior to RAM-allocated, bound to
    /// a dynamically chosen base address instead of a fixed one.
    pub fn reserve_anon_memory(&mut self, size: u64, after: GuestAddr) -> Result<GuestAddr> {
        let start = self
            .reservations
            .last()
            .map(|r| r.end().max(after))
            .unwrap_or(after);
        self.insert(
            start,
            size,
            ReservationKind::Anonymous,
            Box::new(DemandMapHandler),
            Some(AllocationMap::new(size)),
        )?;
        Ok(start)
    }

    pub fn reserve_device_passthrough(&mut self, start: GuestAddr, size: u64) -> Result<()> {
        self.insert(
            start,
            size,
            ReservationKind::DevicePassthrough,
            Box::new(PassthroughHandler),
            None,
        )
    }

    pub fn reserve_mmio_emulated(
        &mut self,
        start: GuestAddr,
        size: u64,
        device: Box<dyn crate::devices::MmioHandler>,
    ) -> Result<()> {
        self.insert(
            start,
            size,
            ReservationKind::MmioEmulated,
            Box::new(EmulatedHandler { device }),
            None,
        )
    }

    pub fn reserve_io_access_controlled(
        &mut self,
        start: GuestAddr,
        size: u64,
        allowed: Vec<bool>,
    ) -> Result<()> {
        self.insert(
            start,
            size,
            ReservationKind::IoAccessControlled,
            Box::new(AccessControlledHandler { allowed }),
            None,
        )
    }

    pub fn reserve_io_listening(&mut self, start: GuestAddr, size: u64) -> Result<()> {
        self.insert(
            start,
            size,
            ReservationKind::IoListening,
            Box::new(ListeningHandler),
            None,
        )
    }

    pub fn reserve_io_forwarding(
        &mut self,
        start: GuestAddr,
        size: u64,
        channel: std::sync::mpsc::Sender<(u64, Option<u64>)>,
        replies: std::sync::mpsc::Receiver<u64>,
    ) -> Result<()> {
        self.insert(
            start,
            size,
            ReservationKind::IoForwarding,
            Box::new(ForwardingHandler { channel, replies }),
            None,
        )
    }

    pub fn free_reserved_memory(&mut self, start: GuestAddr) -> Result<()> {
        let idx = self
            .reservations
            .iter()
            .position(|r| r.start == start)
            .ok_or(Error::NotFound(start))?;
        self.reservations.remove(idx);
        Ok(())
    }

    fn lookup(&self, addr: GuestAddr) -> Option<usize> {
        let idx = self.reservations.partition_point(|r| r.start <= addr);
        idx.checked_sub(1)
            .filter(|&i| self.reservations[i].contains(addr))
    }

    pub fn lookup_ram_mut(&mut self, start: GuestAddr) -> Option<&mut AllocationMap> {
        let idx = self.reservations.iter().position(|r| r.start == start)?;
        self.reservations[idx].ram.as_mut()
    }

    /// `handle_mmio(vcpu, ipa, size) -> FaultResult`: find the covering
    /// reservation and invoke its handler. No reservation -> `Unhandled`.
    pub fn handle_mmio(
        &mut self,
        host: &dyn HostInterface,
        vcpu: VcpuToken,
        fault: &mut crate::fault::Fault,
    ) -> FaultResult {
        let addr = fault.addr();
        match self.lookup(addr) {
            Some(idx) => {
                let reservation = &mut self.reservations[idx];
                let offset = addr - reservation.start;
                reservation.handler.on_fault(host, vcpu, offset, fault)
            }
            None => FaultResult::Unhandled,
        }
    }
}

struct RamOneToOneHandler;
impl FaultHandler for RamOneToOneHandler {
    fn on_fault(
        &mut self,
        _host: &dyn HostInterface,
        _vcpu: VcpuToken,
        _offset: u64,
        _fault: &mut crate::fault::Fault,
    ) -> FaultResult {
        // Pre-mapped 1:1 RAM should never fault; if it does, the mapping
        // is wrong and there is no safe recovery.
        log::error!("unexpected fault on RAM-one-to-one reservation");
        FaultResult::Error
    }
}

struct DemandMapHandler;
impl FaultHandler for DemandMapHandler {
    fn on_fault(
        &mut self,
        host: &dyn HostInterface,
        vcpu: VcpuToken,
        offset: u64,
        fault: &mut crate::fault::Fault,
    ) -> FaultResult {
        let page = offset & !0xfff;
        match host.map_frame(vcpu, fault.addr() - offset + page, 12, MapRights::RW, true) {
            Ok(()) => FaultResult::Restart,
            Err(e) => {
                log::error!("demand mapping failed: {e:?}");
                FaultResult::Error
            }
        }
    }
}

struct PassthroughHandler;
impl FaultHandler for PassthroughHandler {
    fn on_fault(
        &mut self,
        host: &dyn HostInterface,
        vcpu: VcpuToken,
        offset: u64,
        fault: &mut crate::fault::Fault,
    ) -> FaultResult {
        match host.map_frame(vcpu, fault.addr() - offset, 12, MapRights::RW, false) {
            Ok(()) => FaultResult::Restart,
            Err(e) => {
                log::error!("passthrough mapping failed: {e:?}");
                FaultResult::Error
            }
        }
    }
}

struct EmulatedHandler {
    device: Box<dyn crate::devices::MmioHandler>,
}
impl FaultHandler for EmulatedHandler {
    fn on_fault(
        &mut self,
        _host: &dyn HostInterface,
        _vcpu: VcpuToken,
        offset: u64,
        fault: &mut crate::fault::Fault,
    ) -> FaultResult {
        if fault.is_write() {
            let bits = fault.width().bytes() * 8;
            let mask: Word = if bits >= Word::BITS { Word::MAX } else { (1u64 << bits) - 1 };
            self.device.write(offset, fault.width(), fault.data() & mask);
        } else {
            let raw = self.device.read(offset, fault.width());
            fault.set_data(raw);
        }
        FaultResult::Handled
    }
}

struct AccessControlledHandler {
    allowed: Vec<bool>,
}
impl FaultHandler for AccessControlledHandler {
    fn on_fault(
        &mut self,
        _host: &dyn HostInterface,
        _vcpu: VcpuToken,
        offset: u64,
        fault: &mut crate::fault::Fault,
    ) -> FaultResult {
        let permitted = self.allowed.get(offset as usize).copied().unwrap_or(false);
        if fault.is_write() {
            if !permitted {
                log::debug!("denied write at offset {offset:#x} masked out");
                return FaultResult::Ignore;
            }
            FaultResult::Handled
        } else {
            if !permitted {
                fault.set_data(0);
            }
            FaultResult::Handled
        }
    }
}

struct ListeningHandler;
impl FaultHandler for ListeningHandler {
    fn on_fault(
        &mut self,
        host: &dyn HostInterface,
        vcpu: VcpuToken,
        offset: u64,
        fault: &mut crate::fault::Fault,
    ) -> FaultResult {
        log::info!(
            "listening device access: offset={offset:#x} write={}",
            fault.is_write()
        );
        match host.map_frame(vcpu, fault.addr() - offset, 12, MapRights::RW, false) {
            Ok(()) => FaultResult::Restart,
            Err(_) => FaultResult::Error,
        }
    }
}

struct ForwardingHandler {
    channel: std::sync::mpsc::Sender<(u64, Option<u64>)>,
    replies: std::sync::mpsc::Receiver<u64>,
}
impl FaultHandler for ForwardingHandler {
    fn on_fault(
        &mut self,
        _host: &dyn HostInterface,
        _vcpu: VcpuToken,
        offset: u64,
        fault: &mut crate::fault::Fault,
    ) -> FaultResult {
        // Synchronous on the read side, asynchronous (fire-and-forget)
        // on the write side.
        if fault.is_write() {
            let bits = fault.width().bytes() * 8;
            let mask: Word = if bits >= Word::BITS { Word::MAX } else { (1u64 << bits) - 1 };
            if self.channel.send((offset, Some(fault.data() & mask))).is_err() {
                return FaultResult::Error;
            }
            FaultResult::Handled
        } else {
            if self.channel.send((offset, None)).is_err() {
                return FaultResult::Error;
            }
            match self.replies.recv() {
                Ok(value) => {
                    fault.set_data(value);
                    FaultResult::Handled
                }
                Err(_) => FaultResult::Error,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn overlapping_reservations_are_rejected() {
        let mut gmm = GuestMemoryMap::new();
        gmm.reserve_ram_one_to_one(0x1000, 0x1000).unwrap();
        let err = gmm.reserve_ram_one_to_one(0x1800, 0x1000).unwrap_err();
        assert!(matches!(err, Error::Overlap { .. }));
    }

    #[test]
    fn adjacent_reservations_are_accepted() {
        let mut gmm = GuestMemoryMap::new();
        gmm.reserve_ram_one_to_one(0x1000, 0x1000).unwrap();
        gmm.reserve_ram_one_to_one(0x2000, 0x1000).unwrap();
        assert_eq!(gmm.reservations().len(), 2);
    }

    #[test]
    fn lookup_finds_covering_reservation() {
        let mut gmm = GuestMemoryMap::new();
        gmm.reserve_ram_one_to_one(0x40000000, 16 * 1024 * 1024).unwrap();
        assert_eq!(gmm.lookup(0x40001000), Some(0));
        assert_eq!(gmm.lookup(0x50000000), None);
    }

    #[test]
    fn unhandled_when_no_reservation_covers_address() {
        use crate::host::{sim::{mmio_fault, SimHost}, Arch, VcpuToken};
        let mut gmm = GuestMemoryMap::new();
        let host = SimHost::new(1, 4096, Arch::Arm32);
        let msg = mmio_fault(VcpuToken(0), 0xdead0000, 0, true, 0, 1 << 25);
        let mut fault = crate::fault::Fault::from_message(Arch::Arm32, &msg);
        let result = gmm.handle_mmio(&host, VcpuToken(0), &mut fault);
        assert_eq!(result, FaultResult::Unhandled);
    }

    proptest::proptest! {
        /// Whatever mix of (possibly overlapping) reservation requests gets
        /// thrown at a `GuestMemoryMap`, the surviving table stays sorted by
        /// `start` with no two entries overlapping — `reserve_*` either
        /// accepts a request whole or rejects it with `Overlap`, never
        /// leaving a partially-applied reservation behind.
        #[test]
        fn accepted_reservations_never_overlap(
            requests in proptest::collection::vec((0u64..64, 1u64..8), 1..20),
        ) {
            let mut gmm = GuestMemoryMap::new();
            for (start_unit, len_unit) in requests {
                // Scale onto a coarse grid so the random draws actually
                // collide with each other with non-negligible probability.
                let start = start_unit * 0x1000;
                let size = len_unit * 0x1000;
                let _ = gmm.reserve_ram_one_to_one(start, size);
            }
            let reservations = gmm.reservations();
            for pair in reservations.windows(2) {
                prop_assert!(pair[0].start < pair[1].start);
                prop_assert!(pair[0].end() <= pair[1].start);
            }
        }
    }
}
