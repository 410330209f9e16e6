// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::path::PathBuf;

use crate::config::{Error, Result, VmConfig, DEFAULT_MACHINE_ID};
use crate::host::Arch;

/// Upper bound on vCPUs per VM.
pub const MAX_NUM_VCPUS: u32 = 8;

/// See `VmConfig` for the meaning of each field.
#[derive(Debug)]
pub struct VmConfigBuilder {
    name: String,
    arch: Arch,
    kernel_path: PathBuf,
    num_vcpus: u32,
    boot_vcpu_index: u32,
    priority: u8,
    memory_mb: u32,
    dtb_path: Option<PathBuf>,
    initrd_path: Option<PathBuf>,
    machine_id: u32,
    cmdline: Option<String>,
}

impl VmConfigBuilder {
    pub fn new(name: impl Into<String>, arch: Arch, kernel_path: impl Into<PathBuf>) -> Self {
        VmConfigBuilder {
            name: name.into(),
            arch,
            kernel_path: kernel_path.into(),
            num_vcpus: 1,
            boot_vcpu_index: 0,
            priority: 0,
            memory_mb: 256,
            dtb_path: None,
            initrd_path: None,
            machine_id: DEFAULT_MACHINE_ID,
            cmdline: None,
        }
    }

    pub fn num_vcpus(mut self, n: u32) -> Self {
        self.num_vcpus = n;
        self
    }

    pub fn boot_vcpu_index(mut self, idx: u32) -> Self {
        self.boot_vcpu_index = idx;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn memory_mb(mut self, mb: u32) -> Self {
        self.memory_mb = mb;
        self
    }

    pub fn dtb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dtb_path = Some(path.into());
        self
    }

    pub fn initrd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.initrd_path = Some(path.into());
        self
    }

    pub fn machine_id(mut self, id: u32) -> Self {
        self.machine_id = id;
        self
    }

    pub fn cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = Some(cmdline.into());
        self
    }

    /// Validates and produces the final `VmConfig`. Errors rather than
    /// panicking: a CLI-driven build should report bad input, not crash.
    pub fn build(self) -> Result<VmConfig> {
        if !self.kernel_path.exists() {
            return Err(Error::KernelNotFound(self.kernel_path));
        }
        if self.num_vcpus == 0 || self.num_vcpus > MAX_NUM_VCPUS {
            return Err(Error::BadVcpuCount {
                got: self.num_vcpus,
                max: MAX_NUM_VCPUS,
            });
        }

        let mut cmdline = VmConfig::default_cmdline()?;
        if let Some(extra) = self.cmdline {
            cmdline.insert_str(extra)?;
        }

        Ok(VmConfig {
            name: self.name,
            arch: self.arch,
            num_vcpus: self.num_vcpus,
            boot_vcpu_index: self.boot_vcpu_index,
            priority: self.priority,
            memory_mb: self.memory_mb,
            kernel_path: self.kernel_path,
            dtb_path: self.dtb_path,
            initrd_path: self.initrd_path,
            machine_id: self.machine_id,
            cmdline,
        })
    }
}
