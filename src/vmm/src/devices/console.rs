// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! A 16550-compatible console: `vm-superio`'s `Serial` state machine
//! driving a real output stream, with interrupt delivery abstracted behind
//! a `Trigger`. Rather than raising a KVM irqfd, `IrqLine` just latches a
//! flag the runtime polls once per dispatch loop iteration and forwards
//! into the vGIC as a level-triggered SPI.

use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};

use crate::fault::Width;
use crate::devices::MmioHandler;

#[derive(Clone, Default)]
pub struct IrqLine(Arc<AtomicBool>);

impl IrqLine {
    pub fn new() -> Self {
        IrqLine(Arc::new(AtomicBool::new(false)))
    }

    /// Read and clear the pending flag; called once per runtime dispatch
    /// iteration to decide whether to assert the backing vGIC SPI.
    pub fn take_pending(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

impl Trigger for IrqLine {
    type E = io::Error;

    fn trigger(&self) -> io::Result<()> {
        self.0.store(true, Ordering::Release);
        Ok(())
    }
}

/// Worked example of an `MmioEmulated` device: a standalone 8250 UART
/// wired directly to the host's stdout, with no virtio layer above it.
/// Grounded in `LumperSerial`, generalized from a fixed x86 I/O port to
/// an arbitrary MMIO-mapped offset.
pub struct Console {
    irq: IrqLine,
    serial: Serial<IrqLine, NoEvents, Stdout>,
}

impl Console {
    pub fn new() -> (Self, IrqLine) {
        let irq = IrqLine::new();
        let serial = Serial::new(irq.clone(), io::stdout());
        (Console { irq: irq.clone(), serial }, irq)
    }

    pub fn irq_line(&self) -> IrqLine {
        self.irq.clone()
    }
}

impl MmioHandler for Console {
    fn read(&mut self, offset: u64, width: Width) -> u64 {
        if width != Width::Byte {
            log::warn!("console: non-byte read at offset {offset:#x}, truncating");
        }
        self.serial.read(offset as u8) as u64
    }

    fn write(&mut self, offset: u64, width: Width, value: u64) {
        if width != Width::Byte {
            log::warn!("console: non-byte write at offset {offset:#x}, truncating");
        }
        if let Err(e) = self.serial.write(offset as u8, value as u8) {
            log::error!("console write failed: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echoes_written_byte_through_loopback_register() {
        let (mut console, _irq) = Console::new();
        // THR at offset 0 loops back through RBR once DLAB is clear.
        console.write(0, Width::Byte, b'A' as u64);
    }

    #[test]
    fn irq_line_latches_until_taken() {
        let (_console, irq) = Console::new();
        assert!(!irq.take_pending());
        irq.trigger().unwrap();
        assert!(irq.take_pending());
        assert!(!irq.take_pending());
    }
}
