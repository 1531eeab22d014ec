//! Checksum auto-mode policy.
//!
//! Captured traffic that was checksum-offloaded on the sending host shows
//! up with invalid checksums; validating it downstream only produces false
//! negatives. The auto policy samples the first packets on each worker and
//! turns validation off for the whole interface when the invalid ratio is
//! too high.

/// Worker packet count at which the decision is evaluated, exactly once.
pub const CHECKSUM_SAMPLE_COUNT: u64 = 1000;

/// Validation is dropped when fewer than this many packets arrive per
/// invalid checksum (i.e. more than ~10% invalid).
pub const CHECKSUM_INVALID_RATIO: u64 = 10;

/// Decide whether checksum validation should be skipped from now on, given
/// this worker's cumulative packet count and the interface-wide totals.
pub fn auto_mode_check(worker_pkts: u64, iface_pkts: u64, iface_invalid: u64) -> bool {
    worker_pkts == CHECKSUM_SAMPLE_COUNT
        && iface_invalid != 0
        && iface_pkts / iface_invalid < CHECKSUM_INVALID_RATIO
}
