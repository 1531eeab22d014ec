//! Helper functions for the capture counters.
//!
//! Workers buffer counters locally and flush here once per poll cycle.

use crate::metrics::registry;

/// Add to the kernel-packets counter for one interface/worker pair.
pub fn add_kernel_packets(iface: &str, worker: &str, count: u64) {
    registry::CAPTURE_KERNEL_PACKETS
        .with_label_values(&[iface, worker])
        .inc_by(count);
}

/// Add to the kernel-drops counter for one interface/worker pair.
pub fn add_kernel_drops(iface: &str, worker: &str, count: u64) {
    registry::CAPTURE_KERNEL_DROPS
        .with_label_values(&[iface, worker])
        .inc_by(count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        add_kernel_packets("testif0", "w0", 3);
        add_kernel_packets("testif0", "w0", 2);
        add_kernel_drops("testif0", "w0", 1);

        let pkts = registry::CAPTURE_KERNEL_PACKETS.with_label_values(&["testif0", "w0"]);
        let drops = registry::CAPTURE_KERNEL_DROPS.with_label_values(&["testif0", "w0"]);
        assert_eq!(pkts.get(), 5);
        assert_eq!(drops.get(), 1);
    }
}
