// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The IO-port registry (IOP, x86 only).
//!
//! Identical container shape to the GMM but keyed by 16-bit port
//! ranges instead of guest-physical addresses, for the x86 guests this
//! crate's ARM-first design otherwise does not need. Generalized from a
//! single fixed serial-port range into the sorted, non-overlapping range
//! container GMM already uses for guest-physical addresses.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSize {
    Byte = 1,
    Word = 2,
    DWord = 4,
}

impl PortSize {
    pub fn from_bytes(n: u32) -> Option<Self> {
        match n {
            1 => Some(PortSize::Byte),
            2 => Some(PortSize::Word),
            4 => Some(PortSize::DWord),
            _ => None,
        }
    }
}

/// The register-level contract an emulated IO-port range implements.
pub trait PortHandler: Send {
    fn port_in(&mut self, port: u16, size: PortSize) -> u32;
    fn port_out(&mut self, port: u16, size: PortSize, value: u32);
}

enum RangeKind {
    /// Granted to the VM via a kernel IO-port capability; no host
    /// involvement at all, so there is nothing to dispatch.
    Passthrough,
    Emulated(Box<dyn PortHandler>),
}

struct Range {
    start: u16,
    end: u16,
    kind: RangeKind,
    description: &'static str,
}

impl Range {
    fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("port range [{new_start:#x}, {new_end:#x}] overlaps existing [{old_start:#x}, {old_end:#x}]")]
    Overlap {
        new_start: u16,
        new_end: u16,
        old_start: u16,
        old_end: u16,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Sorted, non-overlapping table of 16-bit port ranges.
#[derive(Default)]
pub struct IoPortRegistry {
    ranges: Vec<Range>,
    logged_misses: std::collections::HashSet<u16>,
}

impl IoPortRegistry {
    pub fn new() -> Self {
        IoPortRegistry::default()
    }

    fn insert(&mut self, start: u16, end: u16, kind: RangeKind, description: &'static str) -> Result<()> {
        let idx = self.ranges.partition_point(|r| r.start < start);
        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.ranges.get(i)) {
            if prev.end >= start {
                return Err(Error::Overlap { new_start: start, new_end: end, old_start: prev.start, old_end: prev.end });
            }
        }
        if let Some(next) = self.ranges.get(idx) {
            if next.start <= end {
                return Err(Error::Overlap { new_start: start, new_end: end, old_start: next.start, old_end: next.end });
            }
        }
        self.ranges.insert(idx, Range { start, end, kind, description });
        Ok(())
    }

    pub fn register_passthrough(&mut self, start: u16, end: u16, description: &'static str) -> Result<()> {
        self.insert(start, end, RangeKind::Passthrough, description)
    }

    pub fn register_emulated(&mut self, start: u16, end: u16, handler: Box<dyn PortHandler>, description: &'static str) -> Result<()> {
        self.insert(start, end, RangeKind::Emulated(handler), description)
    }

    fn lookup(&mut self, port: u16) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.start <= port);
        idx.checked_sub(1).filter(|&i| self.ranges[i].contains(port))
    }

    /// `port_in`: binary-search dispatch. A miss returns 0 and logs once
    /// per distinct port.
    pub fn port_in(&mut self, port: u16, size: PortSize) -> u32 {
        match self.lookup(port) {
            Some(idx) => match &mut self.ranges[idx].kind {
                RangeKind::Passthrough => 0,
                RangeKind::Emulated(handler) => handler.port_in(port, size),
            },
            None => {
                self.log_miss(port);
                0
            }
        }
    }

    /// `port_out`: a miss swallows the write, logging once per distinct
    /// port.
    pub fn port_out(&mut self, port: u16, size: PortSize, value: u32) {
        match self.lookup(port) {
            Some(idx) => {
                if let RangeKind::Emulated(handler) = &mut self.ranges[idx].kind {
                    handler.port_out(port, size, value);
                }
            }
            None => self.log_miss(port),
        }
    }

    fn log_miss(&mut self, port: u16) {
        if self.logged_misses.insert(port) {
            log::debug!("ioport: no handler for port {port:#x}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler {
        reads: u32,
    }
    impl PortHandler for CountingHandler {
        fn port_in(&mut self, _port: u16, _size: PortSize) -> u32 {
            self.reads += 1;
            self.reads
        }
        fn port_out(&mut self, _port: u16, _size: PortSize, _value: u32) {}
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut io = IoPortRegistry::new();
        io.register_passthrough(0x3f8, 0x3ff, "com1").unwrap();
        let err = io.register_passthrough(0x3fa, 0x400, "overlap").unwrap_err();
        assert!(matches!(err, Error::Overlap { .. }));
    }

    #[test]
    fn miss_read_returns_zero_and_write_is_swallowed() {
        let mut io = IoPortRegistry::new();
        assert_eq!(io.port_in(0x80, PortSize::Byte), 0);
        io.port_out(0x80, PortSize::Byte, 0xff);
    }

    #[test]
    fn emulated_range_dispatches_to_handler() {
        let mut io = IoPortRegistry::new();
        io.register_emulated(0x60, 0x64, Box::new(CountingHandler { reads: 0 }), "kbd").unwrap();
        assert_eq!(io.port_in(0x60, PortSize::Byte), 1);
        assert_eq!(io.port_in(0x60, PortSize::Byte), 2);
    }
}
