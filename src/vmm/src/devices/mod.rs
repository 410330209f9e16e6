// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Device dispatch (DD): the emulated-device half of the GMM and vGIC.
//!
//! A `Device` is one of a small closed set of shapes:
//! passthrough, access-controlled, emulated, or forwarding. There is no
//! device base class to subclass; an emulated device is just anything
//! implementing `MmioHandler`, boxed behind the `MmioEmulated` reservation
//! kind in the memory module.

pub mod console;

use crate::fault::Width;

/// The register-level contract an emulated MMIO device implements. Reads
/// and writes arrive pre-decoded and right-justified by the fault decoder;
/// a device never sees raw byte-lane shifting.
pub trait MmioHandler: Send {
    fn read(&mut self, offset: u64, width: Width) -> u64;
    fn write(&mut self, offset: u64, width: Width, value: u64);
}

/// Mirrors the four reservation shapes that actually need device-side
/// state (`RamOneToOne`/`RamAllocated`/`Anonymous` are plain memory and
/// carry no `Device`).
pub enum Device {
    /// 1:1 host-device passthrough; no emulation, just mapping rights.
    Passthrough { name: String },
    /// Guest-visible but reads/writes are filtered by a static mask.
    AccessControlled {
        name: String,
        writable_offsets: Vec<bool>,
    },
    /// Fully emulated in software.
    Emulated {
        name: String,
        handler: Box<dyn MmioHandler>,
    },
    /// Forwarded to an out-of-process handler over a channel: reads block
    /// on `replies`, writes are fire-and-forget sends on `channel`.
    Forwarding {
        name: String,
        channel: std::sync::mpsc::Sender<(u64, Option<u64>)>,
        replies: std::sync::mpsc::Receiver<u64>,
    },
}

impl Device {
    pub fn name(&self) -> &str {
        match self {
            Device::Passthrough { name }
            | Device::AccessControlled { name, .. }
            | Device::Emulated { name, .. }
            | Device::Forwarding { name, .. } => name,
        }
    }
}
