use clap::Parser;
use tracing::Level;

use crate::capture::{CaptureOpts, ChecksumMode, CopyMode, RunMode};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Interface to capture from.
    #[arg(short, long, env = "HARRIER_IFACE")]
    pub iface: String,

    /// Number of receive threads for the interface.
    #[arg(short, long, env = "HARRIER_THREADS", default_value_t = 1)]
    pub threads: usize,

    /// Post-verdict frame handling (none, tap, ips).
    #[arg(long, value_enum, env = "HARRIER_COPY_MODE", default_value_t = CopyMode::None)]
    pub copy_mode: CopyMode,

    /// Egress interface for tap/ips modes.
    #[arg(long, env = "HARRIER_COPY_IFACE")]
    pub copy_iface: Option<String>,

    /// Checksum validation policy.
    #[arg(long, value_enum, env = "HARRIER_CHECKSUM", default_value_t = ChecksumMode::Auto)]
    pub checksum: ChecksumMode,

    /// Put the capture interface in promiscuous mode.
    #[arg(long, env = "HARRIER_PROMISC", default_value_t = false)]
    pub promisc: bool,

    /// BPF filter expression applied before decode.
    #[arg(long, env = "HARRIER_BPF")]
    pub bpf: Option<String>,

    /// Pipeline threading model.
    #[arg(long, value_enum, env = "HARRIER_RUN_MODE", default_value_t = RunMode::Workers)]
    pub run_mode: RunMode,

    /// Packet pool size shared by the interface's workers.
    #[arg(long, env = "HARRIER_POOL_SIZE", default_value_t = 1024)]
    pub pool_size: usize,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        env = "HARRIER_LOG_LEVEL",
        default_value = "info"
    )]
    pub log_level: Level,
}

impl Cli {
    /// Per-interface capture configuration derived from the arguments.
    pub fn capture_opts(&self) -> CaptureOpts {
        CaptureOpts {
            iface: self.iface.clone(),
            threads: self.threads,
            copy_mode: self.copy_mode,
            copy_iface: self.copy_iface.clone(),
            checksum: self.checksum,
            promisc: self.promisc,
            bpf_filter: self.bpf.clone(),
            run_mode: self.run_mode,
        }
    }
}
