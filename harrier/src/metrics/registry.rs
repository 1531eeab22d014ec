//! Prometheus counter definitions for the capture engine.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, register_int_counter_vec};

lazy_static! {
    pub static ref CAPTURE_KERNEL_PACKETS: IntCounterVec = register_int_counter_vec!(
        "capture_kernel_packets",
        "Packets received from the ring fabric, per interface and worker.",
        &["iface", "worker"]
    )
    .unwrap();
    pub static ref CAPTURE_KERNEL_DROPS: IntCounterVec = register_int_counter_vec!(
        "capture_kernel_drops",
        "Frames dropped for lack of egress TX space, per interface and worker.",
        &["iface", "worker"]
    )
    .unwrap();
}
