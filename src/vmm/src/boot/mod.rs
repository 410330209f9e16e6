// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Image & Boot (IB).
//!
//! Detects the boot image format, loads it into guest memory at its
//! preferred address, and seeds the registers/ATAG list the Linux boot
//! convention expects. `detect`/`zimage_load_address`/the ATAG builder are
//! pure functions with no process-wide state, grounded
//! verbatim on `libsel4vm`'s `image_get_type`/`zImage_get_load_address`
//! and `libsel4vm/sel4-arm-vmm/src/images/atags.c`.
//! ELF loading drives `linux_loader::loader::elf::Elf` against a scratch
//! `vm-memory` region, then copies the placed segments out through the
//! `HostInterface` abstraction instead of handing the guest a directly-owned
//! memory region.

pub mod atags;

use std::io::Cursor;

use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::host::{Arch, GuestAddr, HostInterface, RegId, VcpuToken, Word};

const ZIMAGE_MAGIC: u32 = 0x016F_2818;
const ZIMAGE_MAGIC_OFFSET: usize = 36;
const UIMAGE_MAGIC: u32 = 0x5619_0527;
const DTB_MAGIC: u32 = 0xd00d_feed;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Closed set of recognised boot image formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Elf,
    ZImage,
    UImage,
    Dtb,
    GzipInitrd,
    Raw,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("image too short to classify")]
    Empty,
    #[error("ELF load failed")]
    ElfLoad(#[from] linux_loader::loader::Error),
    #[error("host invocation failed")]
    Host(#[from] crate::host::Error),
    #[error("guest memory error")]
    GuestMemory(#[from] vm_memory::GuestMemoryError),
    #[error("image does not fit in the supplied RAM region")]
    TooLarge,
}

pub type Result<T> = std::result::Result<T, Error>;

/// `detect(bytes)`: a total function over any non-empty byte slice.
/// Order matters: a zImage/uImage/DTB magic is checked before falling
/// through to `Raw`, exactly as `image_get_type` chains its `is_*` probes.
pub fn detect(bytes: &[u8]) -> Result<ImageKind> {
    if bytes.is_empty() {
        return Err(Error::Empty);
    }
    if bytes.len() >= 4 && &bytes[0..4] == b"\x7fELF" {
        return Ok(ImageKind::Elf);
    }
    if bytes.len() >= ZIMAGE_MAGIC_OFFSET + 4 {
        let magic = u32::from_le_bytes(bytes[ZIMAGE_MAGIC_OFFSET..ZIMAGE_MAGIC_OFFSET + 4].try_into().unwrap());
        if magic == ZIMAGE_MAGIC {
            return Ok(ImageKind::ZImage);
        }
    }
    if bytes.len() >= 4 {
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic == UIMAGE_MAGIC {
            return Ok(ImageKind::UImage);
        }
    }
    if bytes.len() >= 4 {
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic == DTB_MAGIC {
            return Ok(ImageKind::Dtb);
        }
    }
    if bytes.len() >= 2 && bytes[0..2] == GZIP_MAGIC {
        return Ok(ImageKind::GzipInitrd);
    }
    Ok(ImageKind::Raw)
}

/// `zimage_load_address(bytes, ram_base) = hdr.start if hdr.start != 0 else
/// ram_base + 0x8000`. Deterministic and total over any buffer long
/// enough to carry a zImage header; callers that have already run
/// `detect` and gotten `ZImage` are guaranteed that.
pub fn zimage_load_address(bytes: &[u8], ram_base: GuestAddr) -> GuestAddr {
    const START_OFFSET: usize = ZIMAGE_MAGIC_OFFSET + 4;
    let start = bytes
        .get(START_OFFSET..START_OFFSET + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .unwrap_or(0);
    if start != 0 {
        start as GuestAddr
    } else {
        ram_base + 0x8000
    }
}

/// A successfully loaded kernel image, enough to seed boot registers and
/// size the region reserved for it.
#[derive(Debug, Clone, Copy)]
pub struct LoadedKernel {
    pub entry: GuestAddr,
    pub end: GuestAddr,
}

/// `load_kernel`: place `bytes` at its preferred address for `kind` and
/// write it into guest memory through the host's touch primitive. ELF
/// segments are placed per their program headers; every other format is
/// placed as a flat raw image at `hint` (zImage's hint is the output of
/// `zimage_load_address`; uImage/DTB/raw use the caller-supplied address
/// as-is).
pub fn load_kernel(
    host: &dyn HostInterface,
    vcpu: VcpuToken,
    bytes: &[u8],
    kind: ImageKind,
    hint: GuestAddr,
) -> Result<LoadedKernel> {
    match kind {
        ImageKind::Elf => load_elf(host, vcpu, bytes, hint),
        _ => {
            host.write_mem(vcpu, hint, bytes)?;
            Ok(LoadedKernel {
                entry: hint,
                end: hint + bytes.len() as u64,
            })
        }
    }
}

/// Parses the ELF image with `linux-loader`'s loader against a scratch
/// `vm-memory` region sized to the image, then copies the placed bytes
/// out through `HostInterface::write_mem`. The scratch region only ever
/// exists to drive the existing, well-tested ELF loader; it is not the
/// guest's real memory (that is reached exclusively through `HostInterface`).
fn load_elf(host: &dyn HostInterface, vcpu: VcpuToken, bytes: &[u8], hint: GuestAddr) -> Result<LoadedKernel> {
    let span = (bytes.len() as u64).max(0x10_0000) * 4;
    let scratch = GuestMemoryMmap::<()>::from_ranges(&[(GuestAddress(hint), span as usize)])
        .map_err(|_| Error::TooLarge)?;
    let mut cursor = Cursor::new(bytes);
    let loaded = linux_loader::loader::elf::Elf::load(&scratch, None, &mut cursor, Some(GuestAddress(hint)))?;

    let entry = loaded.kernel_load.raw_value();
    let end = loaded.kernel_end;
    let len = (end - hint).max(bytes.len() as u64) as usize;
    let mut buf = vec![0u8; len];
    scratch.read_slice(&mut buf, GuestAddress(hint))?;
    host.write_mem(vcpu, hint, &buf)?;

    Ok(LoadedKernel { entry, end })
}

/// AArch32 SVC mode, IRQ/FIQ masked (`cpsr.M = 0b10011`, `cpsr.I = cpsr.F = 1`).
const PSR_SVC_MASKED: Word = 0xd3;
/// AArch64 EL1h, all exceptions masked (`pstate.M = 0b0101`, `DAIF = 1111`).
const PSR_EL1H_MASKED: Word = 0x3c5;

/// `set_bootargs`: seed the registers the Linux boot convention reads on
/// entry. AArch32 takes `(r0=0, r1=machine_id, r2=atags_ipa, cpsr=SVC)`;
/// AArch64 takes `(x0=dtb_ipa, x1=x2=x3=0, pstate=EL1h)`. Both set `pc=entry`.
pub fn set_bootargs(
    host: &dyn HostInterface,
    vcpu: VcpuToken,
    arch: Arch,
    entry: GuestAddr,
    machine_id_or_dtb: Word,
    atags_ipa: GuestAddr,
) -> crate::host::Result<()> {
    match arch {
        Arch::Arm32 => {
            host.vcpu_write_reg(vcpu, RegId::Gpr(0), 0)?;
            host.vcpu_write_reg(vcpu, RegId::Gpr(1), machine_id_or_dtb)?;
            host.vcpu_write_reg(vcpu, RegId::Gpr(2), atags_ipa)?;
            host.vcpu_write_reg(vcpu, RegId::Cpsr, PSR_SVC_MASKED)?;
        }
        Arch::Arm64 => {
            host.vcpu_write_reg(vcpu, RegId::Gpr(0), machine_id_or_dtb)?;
            host.vcpu_write_reg(vcpu, RegId::Gpr(1), 0)?;
            host.vcpu_write_reg(vcpu, RegId::Gpr(2), 0)?;
            host.vcpu_write_reg(vcpu, RegId::Gpr(3), 0)?;
            host.vcpu_write_reg(vcpu, RegId::Cpsr, PSR_EL1H_MASKED)?;
        }
    }
    host.vcpu_write_reg(vcpu, RegId::Pc, entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_elf_magic() {
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(b"\x7fELF");
        assert_eq!(detect(&bytes).unwrap(), ImageKind::Elf);
    }

    #[test]
    fn detects_zimage_magic_at_offset_36() {
        let mut bytes = vec![0u8; 64];
        bytes[ZIMAGE_MAGIC_OFFSET..ZIMAGE_MAGIC_OFFSET + 4].copy_from_slice(&ZIMAGE_MAGIC.to_le_bytes());
        assert_eq!(detect(&bytes).unwrap(), ImageKind::ZImage);
    }

    #[test]
    fn detects_dtb_big_endian_magic() {
        let mut bytes = vec![0u8; 16];
        bytes[0..4].copy_from_slice(&DTB_MAGIC.to_be_bytes());
        assert_eq!(detect(&bytes).unwrap(), ImageKind::Dtb);
    }

    #[test]
    fn falls_through_to_raw() {
        let bytes = vec![0x42u8; 16];
        assert_eq!(detect(&bytes).unwrap(), ImageKind::Raw);
    }

    #[test]
    fn empty_buffer_is_an_error_not_a_silent_raw() {
        assert!(matches!(detect(&[]), Err(Error::Empty)));
    }

    #[test]
    fn zimage_load_address_falls_back_to_ram_base_plus_0x8000() {
        let mut bytes = vec![0u8; 64];
        bytes[ZIMAGE_MAGIC_OFFSET..ZIMAGE_MAGIC_OFFSET + 4].copy_from_slice(&ZIMAGE_MAGIC.to_le_bytes());
        // start == 0
        assert_eq!(zimage_load_address(&bytes, 0x4000_0000), 0x4000_0000 + 0x8000);
    }

    #[test]
    fn zimage_load_address_honors_explicit_start() {
        let mut bytes = vec![0u8; 64];
        bytes[ZIMAGE_MAGIC_OFFSET..ZIMAGE_MAGIC_OFFSET + 4].copy_from_slice(&ZIMAGE_MAGIC.to_le_bytes());
        bytes[40..44].copy_from_slice(&0x8100_0000u32.to_le_bytes());
        assert_eq!(zimage_load_address(&bytes, 0x4000_0000), 0x8100_0000);
    }

    #[test]
    fn raw_image_loads_at_hint_through_host() {
        use crate::host::sim::SimHost;
        let host = SimHost::new(1, 0x10000, Arch::Arm32);
        let bytes = vec![1, 2, 3, 4];
        let loaded = load_kernel(&host, VcpuToken(0), &bytes, ImageKind::Raw, 0x1000).unwrap();
        assert_eq!(loaded.entry, 0x1000);
        let mut buf = [0u8; 4];
        host.read_mem(VcpuToken(0), 0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn set_bootargs_arm32_follows_linux_boot_convention() {
        use crate::host::sim::SimHost;
        let host = SimHost::new(1, 0x10000, Arch::Arm32);
        set_bootargs(&host, VcpuToken(0), Arch::Arm32, 0x8000, 2, 0x100).unwrap();
        let regs = host.tcb_read_regs(VcpuToken(0)).unwrap();
        assert_eq!(regs.read(RegId::Gpr(0)), 0);
        assert_eq!(regs.read(RegId::Gpr(1)), 2);
        assert_eq!(regs.read(RegId::Gpr(2)), 0x100);
        assert_eq!(regs.pc, 0x8000);
        assert_eq!(regs.read(RegId::Cpsr), PSR_SVC_MASKED);
    }

    #[test]
    fn set_bootargs_arm64_enters_at_el1h_with_exceptions_masked() {
        use crate::host::sim::SimHost;
        let host = SimHost::new(1, 0x10000, Arch::Arm64);
        set_bootargs(&host, VcpuToken(0), Arch::Arm64, 0x8000_0000, 0x4100_0000, 0x100).unwrap();
        let regs = host.tcb_read_regs(VcpuToken(0)).unwrap();
        assert_eq!(regs.read(RegId::Gpr(0)), 0x4100_0000);
        assert_eq!(regs.read(RegId::Gpr(1)), 0);
        assert_eq!(regs.pc, 0x8000_0000);
        assert_eq!(regs.read(RegId::Cpsr), PSR_EL1H_MASKED);
    }
}
