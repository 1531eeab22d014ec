//! Packet capture engine over the kernel-bypass ring fabric.
//!
//! A shared [`device::DeviceRegistry`] hands out reference-counted handles
//! to memory-mapped NIC devices; one [`worker::CaptureWorker`] per thread
//! claims a slice of a device's hardware rings, polls them, filters frames
//! and injects them into the downstream pipeline. In inline deployments the
//! [`inline::WireForwarder`] moves accepted frames to the egress device by
//! swapping ring buffer indices, without copying payload bytes.

use std::io;

use thiserror::Error;

pub mod device;
pub mod fabric;
pub mod filter;
pub mod inline;
pub mod opts;
pub mod threads;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use device::{DeviceRegistry, NetmapDevice};
pub use filter::BpfFilter;
pub use inline::WireForwarder;
pub use opts::{CaptureOpts, ChecksumMode, CopyMode, RunMode};
pub use worker::CaptureWorker;

/// Capture setup and runtime errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Bad configuration: invalid name, thread/ring mismatch, missing
    /// egress interface, unequal RX/TX rings.
    #[error("invalid capture configuration: {0}")]
    Config(String),

    /// The interface is administratively down.
    #[error("interface '{0}' is down")]
    IfaceDown(String),

    /// A syscall in the open/register path failed.
    #[error("{op} failed for interface '{iface}': {source}")]
    Resource {
        op: &'static str,
        iface: String,
        #[source]
        source: io::Error,
    },

    /// Packet filter did not compile.
    #[error("bpf filter compilation failed: {0}")]
    BadFilter(#[from] pcap::Error),

    /// Release of a handle the registry does not know.
    #[error("device '{0}' is not registered")]
    UnknownDevice(String),
}

impl CaptureError {
    pub(crate) fn resource(op: &'static str, iface: &str) -> Self {
        Self::Resource {
            op,
            iface: iface.to_string(),
            source: io::Error::last_os_error(),
        }
    }
}

/// Transient failure inside one ring drain iteration. The cursor is left
/// unpublished so the next poll cycle retries the same slots.
#[derive(Debug, Error)]
pub enum DrainError {
    #[error("packet pool exhausted")]
    PoolExhausted,
    #[error("payload publication failed: {0}")]
    Publish(#[from] harrier_common::PacketError),
    #[error("downstream slot rejected the packet")]
    Downstream,
}
