use std::path::PathBuf;

use clap::Parser;

use vmm::config::VmConfig;
use vmm::host::{sim::SimHost, Arch};
use vmm::Vmm;

#[derive(Parser)]
#[clap(version = "0.1", author = "Polytech Montpellier - DevOps")]
struct VmmOpts {
    /// Linux kernel path (ELF, zImage, uImage, or a raw flat image).
    #[clap(short, long)]
    kernel: String,

    /// Initramfs path.
    #[clap(short, long)]
    initramfs: Option<String>,

    /// Device tree blob path, used as the AArch64 boot DTB.
    #[clap(long)]
    dtb: Option<String>,

    /// Guest architecture.
    #[clap(long, default_value = "arm64")]
    arch: String,

    /// Number of virtual CPUs assigned to the guest.
    #[clap(short, long, default_value = "1")]
    cpus: u32,

    /// Memory amount (in MBytes) assigned to the guest.
    #[clap(short, long, default_value = "512")]
    memory: u32,

    /// AArch32 ATAG machine ID. Ignored on AArch64.
    #[clap(long, default_value = "0xffffffff", parse(try_from_str = parse_machine_id))]
    machine_id: u32,

    /// Extra kernel command line, appended to the default.
    #[clap(long)]
    atags: Option<String>,

    /// A level of verbosity, and can be used multiple times.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_machine_id(s: &str) -> std::result::Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown --arch {0:?}, expected \"arm32\" or \"arm64\"")]
    UnknownArch(String),
    #[error(transparent)]
    Config(#[from] vmm::config::Error),
    #[error(transparent)]
    Vmm(#[from] vmm::Error),
}

fn main() -> std::result::Result<(), Error> {
    let opts = VmmOpts::parse();

    let log_level = match opts.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(log_level).init();

    let arch = match opts.arch.as_str() {
        "arm32" | "aarch32" => Arch::Arm32,
        "arm64" | "aarch64" => Arch::Arm64,
        other => return Err(Error::UnknownArch(other.to_string())),
    };

    let mut builder = VmConfig::builder("capvmm-guest", arch, PathBuf::from(&opts.kernel))
        .num_vcpus(opts.cpus)
        .memory_mb(opts.memory)
        .machine_id(opts.machine_id);

    if let Some(initramfs) = opts.initramfs {
        builder = builder.initrd_path(PathBuf::from(initramfs));
    }
    if let Some(dtb) = opts.dtb {
        builder = builder.dtb_path(PathBuf::from(dtb));
    }
    if let Some(extra) = opts.atags {
        builder = builder.cmdline(extra);
    }

    let cfg = builder.build()?;

    // This binary's only `HostInterface` backend is the in-process
    // simulator: a production deployment supplies a different
    // `HostInterface` implementation that speaks the real kernel ABI
    // and links against this same `vmm` library.
    let host = SimHost::new(cfg.num_vcpus as usize, (cfg.memory_mb as usize) * 1024 * 1024 + 0x10_0000, arch);
    let mut vmm = Vmm::new(cfg, host)?;
    vmm.run()?;

    Ok(())
}
