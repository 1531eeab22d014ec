use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::CaptureError;

/// Default owned-buffer size for pooled packets; one full Ethernet frame.
pub const DEFAULT_PACKET_SIZE: usize = 1514;

/// What happens to a frame after the pipeline's verdict.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Capture only.
    #[default]
    None,
    /// Mirror every frame to the egress interface.
    Tap,
    /// Forward unless the verdict is drop (bump-in-the-wire).
    Ips,
}

/// Checksum validation policy applied at capture time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    Disable,
    #[default]
    Auto,
    Validate,
}

/// Pipeline threading model. Zero-copy capture is only safe when the whole
/// pipeline for a frame runs on the thread that owns its source ring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Workers,
    Autofp,
}

/// Per-interface capture configuration record.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CaptureOpts {
    pub iface: String,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub copy_mode: CopyMode,
    /// Egress interface for TAP/IPS deployments.
    #[serde(default)]
    pub copy_iface: Option<String>,
    #[serde(default)]
    pub checksum: ChecksumMode,
    #[serde(default)]
    pub promisc: bool,
    #[serde(default)]
    pub bpf_filter: Option<String>,
    #[serde(default)]
    pub run_mode: RunMode,
}

fn default_threads() -> usize {
    1
}

impl CaptureOpts {
    #[allow(dead_code)]
    pub fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            threads: 1,
            copy_mode: CopyMode::default(),
            copy_iface: None,
            checksum: ChecksumMode::default(),
            promisc: false,
            bpf_filter: None,
            run_mode: RunMode::default(),
        }
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.iface.is_empty() {
            return Err(CaptureError::Config("interface name is empty".into()));
        }
        if self.threads == 0 {
            return Err(CaptureError::Config("thread count must be at least 1".into()));
        }
        if self.copy_mode != CopyMode::None
            && self.copy_iface.as_deref().unwrap_or("").is_empty()
        {
            return Err(CaptureError::Config(format!(
                "copy mode {:?} requires an egress interface",
                self.copy_mode
            )));
        }
        Ok(())
    }
}
