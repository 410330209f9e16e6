// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! VM configuration surface: a `clap`-driven options struct feeds a
//! builder that produces a `VmConfig`, the input `runtime::Vm::init` and the
//! boot sequence need. Kept close to the original kernel/cmdline-path
//! config layer, generalized to the ARM boot convention and dropping
//! the x86-only network/tap surface: PCI/virtio wiring is reachable
//! programmatically through `devices`/`ioport`, not from the CLI.

mod builder;

pub use builder::VmConfigBuilder;

use std::path::PathBuf;

use linux_loader::cmdline::Cmdline;

use crate::host::Arch;

const CMDLINE_CAPACITY: usize = 4096;
const DEFAULT_CMDLINE: &str = "console=ttyAMA0 root=/dev/vda rw panic=1";
const DEFAULT_MACHINE_ID: u32 = 0xffff_ffff; // Generic/DT-described machine, per the Linux boot convention.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kernel image not found at {0}")]
    KernelNotFound(PathBuf),
    #[error("command line exceeds the {CMDLINE_CAPACITY} byte capacity")]
    CmdlineTooLong(#[from] linux_loader::cmdline::Error),
    #[error("num_vcpus must be nonzero and at most {max}, got {got}")]
    BadVcpuCount { got: u32, max: u32 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Resolved configuration for one VM, handed to `runtime::Vm::init` and the
/// boot sequence. Mirrors the VM entity's identity/scheduling fields
/// plus the paths the boot loader needs.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub name: String,
    pub arch: Arch,
    pub num_vcpus: u32,
    pub boot_vcpu_index: u32,
    pub priority: u8,
    pub memory_mb: u32,
    pub kernel_path: PathBuf,
    pub dtb_path: Option<PathBuf>,
    pub initrd_path: Option<PathBuf>,
    pub machine_id: u32,
    pub cmdline: Cmdline,
}

impl VmConfig {
    pub fn builder(name: impl Into<String>, arch: Arch, kernel_path: impl Into<PathBuf>) -> VmConfigBuilder {
        VmConfigBuilder::new(name, arch, kernel_path)
    }

    pub fn default_cmdline() -> Result<Cmdline> {
        let mut cmdline = Cmdline::new(CMDLINE_CAPACITY);
        cmdline.insert_str(DEFAULT_CMDLINE)?;
        Ok(cmdline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_rejects_missing_kernel_file() {
        let err = VmConfig::builder("test", Arch::Arm64, "/no/such/kernel")
            .num_vcpus(1)
            .build();
        assert!(matches!(err, Err(Error::KernelNotFound(_))));
    }

    #[test]
    fn builder_rejects_zero_vcpus() {
        let err = VmConfig::builder("test", Arch::Arm64, "./Cargo.toml")
            .num_vcpus(0)
            .build();
        assert!(matches!(err, Err(Error::BadVcpuCount { got: 0, .. })));
    }

    #[test]
    fn builder_accepts_valid_config() {
        let cfg = VmConfig::builder("test", Arch::Arm64, "./Cargo.toml")
            .num_vcpus(2)
            .memory_mb(256)
            .machine_id(7)
            .build()
            .unwrap();
        assert_eq!(cfg.num_vcpus, 2);
        assert_eq!(cfg.memory_mb, 256);
        assert_eq!(cfg.machine_id, 7);
        assert_eq!(cfg.boot_vcpu_index, 0);
    }
}
