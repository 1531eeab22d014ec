//! Receive worker: claims a slice of a device's hardware rings, polls
//! them, and feeds frames into the downstream pipeline.
//!
//! Workers on the same device negotiate disjoint contiguous ring ranges
//! through the device's atomic claim counter. Each worker owns the RX side
//! of its rings outright; the egress TX rings it touches in inline mode are
//! shared and go through the per-ring TX lock.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use harrier_common::{
    Datalink, LiveDevice, Packet, PacketFlags, PacketPool, PacketSource, PacketTime, WireRef,
};
use tracing::{debug, info, trace, warn};

use crate::checksum;
use crate::livedev::LiveDeviceRegistry;
use crate::metrics;
use crate::pipeline::Downstream;
use crate::shutdown::ShutdownFlag;

use super::device::{self, DeviceRegistry, NetmapDevice};
use super::fabric::NIOCTXSYNC;
use super::filter::BpfFilter;
use super::inline::WireForwarder;
use super::opts::{CaptureOpts, ChecksumMode, CopyMode, RunMode};
use super::{CaptureError, DrainError};

const POLL_TIMEOUT_MS: libc::c_int = 100;

const FATAL_EVENTS: libc::c_short =
    libc::POLLHUP | libc::POLLRDHUP | libc::POLLERR | libc::POLLNVAL;

/// Lifetime totals reported when a worker stops.
#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub name: String,
    pub pkts: u64,
    pub bytes: u64,
    pub drops: u64,
}

/// Contiguous ring range for worker `idx` of `threads` on a device with
/// `rings_cnt` rings. The last worker absorbs any remainder.
pub(crate) fn ring_bounds(rings_cnt: usize, threads: usize, idx: usize) -> (usize, usize) {
    let chunk = rings_cnt / threads;
    let from = idx * chunk;
    let to = if idx + 1 == threads {
        rings_cnt - 1
    } else {
        (from + chunk - 1).min(rings_cnt - 1)
    };
    (from, to)
}

pub struct CaptureWorker {
    name: String,
    registry: Arc<DeviceRegistry>,
    pool: Arc<PacketPool>,
    downstream: Arc<dyn Downstream>,
    shutdown: ShutdownFlag,
    livedev: Arc<LiveDevice>,

    src: Arc<NetmapDevice>,
    dst: Option<Arc<NetmapDevice>>,
    ring_from: usize,
    ring_to: usize,
    worker_idx: u32,

    zero_copy: bool,
    copy_mode: CopyMode,
    checksum_mode: ChecksumMode,
    filter: Option<BpfFilter>,
    forwarder: Option<Arc<WireForwarder>>,

    // Per-cycle counters; pkts/bytes are single-writer, drops is shared
    // with the release hook.
    pkts: u64,
    bytes: u64,
    drops: Arc<AtomicU64>,
    total_pkts: u64,
    total_bytes: u64,
    total_drops: u64,
}

impl CaptureWorker {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<DeviceRegistry>,
        pool: Arc<PacketPool>,
        livedevs: &LiveDeviceRegistry,
        opts: &CaptureOpts,
        downstream: Arc<dyn Downstream>,
        shutdown: ShutdownFlag,
    ) -> Result<Self, CaptureError> {
        opts.validate()?;

        let livedev = livedevs.get_or_register(&opts.iface);
        let src = registry.open(&opts.iface, opts.promisc, true)?;

        // From here the handles are released through Drop on every path.
        let mut worker = Self {
            name: name.into(),
            registry,
            pool,
            downstream,
            shutdown,
            livedev,
            src,
            dst: None,
            ring_from: 0,
            ring_to: 0,
            worker_idx: 0,
            zero_copy: false,
            copy_mode: opts.copy_mode,
            checksum_mode: opts.checksum,
            filter: None,
            forwarder: None,
            pkts: 0,
            bytes: 0,
            drops: Arc::new(AtomicU64::new(0)),
            total_pkts: 0,
            total_bytes: 0,
            total_drops: 0,
        };

        let rings_cnt = worker.src.rings_cnt();
        if opts.threads > rings_cnt {
            return Err(CaptureError::Config(format!(
                "thread count can't be greater than ring count: {} threads for '{}' with {} rings",
                opts.threads, opts.iface, rings_cnt
            )));
        }

        worker.worker_idx = worker.src.claim_worker();
        let (ring_from, ring_to) = ring_bounds(rings_cnt, opts.threads, worker.worker_idx as usize);
        worker.ring_from = ring_from;
        worker.ring_to = ring_to;

        if opts.copy_mode != CopyMode::None {
            // validate() guarantees the egress name is present.
            let out_iface = opts.copy_iface.as_deref().unwrap_or_default();
            worker.dst = Some(worker.registry.open(out_iface, false, true)?);
        }

        if let Some(expr) = opts.bpf_filter.as_deref().filter(|e| !e.is_empty()) {
            info!(
                event.name = "capture.worker.filter",
                iface = %opts.iface,
                filter = %expr,
                "using bpf filter"
            );
            worker.filter = Some(BpfFilter::compile(expr)?);
        }

        if opts.run_mode == RunMode::Workers {
            worker.zero_copy = true;
            info!(
                event.name = "capture.worker.zero_copy",
                iface = %opts.iface,
                "enabling zero copy mode"
            );
        }

        if let Some(dst) = &worker.dst {
            worker.forwarder = Some(Arc::new(WireForwarder::new(
                worker.src.clone(),
                dst.clone(),
                opts.copy_mode,
                worker.drops.clone(),
            )));
        }

        if device::iface_offloading(&opts.iface).unwrap_or(false) {
            warn!(
                event.name = "capture.worker.offload",
                iface = %opts.iface,
                "GRO or LRO is active; offloaded frames can exceed the ring slot size"
            );
        }

        Ok(worker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(dead_code)]
    pub fn ring_range(&self) -> (usize, usize) {
        (self.ring_from, self.ring_to)
    }

    /// Poll the claimed rings until shutdown.
    pub fn run(&mut self) -> Result<WorkerSummary, CaptureError> {
        let nrings = self.ring_to - self.ring_from + 1;
        let mut fds: Vec<libc::pollfd> = (0..nrings)
            .map(|i| libc::pollfd {
                fd: self.src.ring(self.ring_from + i).fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        info!(
            event.name = "capture.worker.started",
            worker = %self.name,
            iface = %self.src.ifname(),
            ring_from = self.ring_from,
            ring_to = self.ring_to,
            "receive worker entering poll loop"
        );

        loop {
            if self.shutdown.is_set() {
                break;
            }

            // Backpressure: never poll faster than packets can be recycled.
            self.pool.wait_free();

            // SAFETY: fds is a live array of initialized pollfd entries.
            let r = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
            if r < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    warn!(
                        event.name = "capture.worker.poll_failed",
                        iface = %self.src.ifname(),
                        error = %err,
                        "poll failed, retrying"
                    );
                }
                continue;
            }
            if r == 0 {
                trace!(
                    event.name = "capture.worker.poll_timeout",
                    iface = %self.src.ifname(),
                    "poll timeout"
                );
                continue;
            }

            let mut fatal_logged = false;
            for i in 0..fds.len() {
                let revents = fds[i].revents;

                if revents & FATAL_EVENTS != 0 {
                    // One diagnostic per cycle; the ring stays degraded
                    // until operator intervention.
                    if !fatal_logged {
                        warn!(
                            event.name = "capture.worker.ring_error",
                            iface = %self.src.ifname(),
                            ring = self.ring_from + i,
                            revents = revents as i32,
                            "fatal poll event on ring, skipping"
                        );
                        fatal_logged = true;
                    }
                    continue;
                }

                if revents & libc::POLLIN != 0 {
                    let ring_idx = self.ring_from + i;
                    if let Err(e) = self.drain_ring(ring_idx) {
                        debug!(
                            event.name = "capture.worker.drain_aborted",
                            iface = %self.src.ifname(),
                            ring = ring_idx,
                            error = %e,
                            "drain aborted, retrying next cycle"
                        );
                    }
                    if self.copy_mode != CopyMode::None {
                        self.sync_egress(ring_idx);
                    }
                }
            }

            self.flush_counters();
        }

        self.flush_counters();
        info!(
            event.name = "capture.worker.stopped",
            worker = %self.name,
            iface = %self.src.ifname(),
            "receive worker exiting"
        );
        Ok(self.summary())
    }

    /// Drain every currently readable slot of one ring.
    fn drain_ring(&mut self, ring_idx: usize) -> Result<(), DrainError> {
        let ring = self.src.ring(ring_idx).rx();
        let mut avail = ring.space();
        let mut cur = ring.cur();

        while avail > 0 {
            avail -= 1;
            let (data_ptr, len) = ring.slot_data(cur);
            // SAFETY: the slot buffer is valid for len bytes, and only this
            // worker touches the RX side of the ring.
            let frame = unsafe { std::slice::from_raw_parts(data_ptr, len) };

            if let Some(filter) = &self.filter {
                if !filter.matches(frame) {
                    cur = ring.next(cur);
                    continue;
                }
            }

            let Some(mut pkt) = self.pool.get() else {
                return Err(DrainError::PoolExhausted);
            };

            pkt.source = PacketSource::Wire;
            pkt.datalink = Datalink::Ethernet;
            let ts = ring.timestamp();
            pkt.ts = PacketTime {
                sec: ts.tv_sec as i64,
                usec: ts.tv_usec as i64,
            };
            pkt.livedev = Some(self.livedev.clone());

            self.pkts += 1;
            self.bytes += len as u64;

            self.apply_checksum_policy(&mut pkt);

            if self.zero_copy {
                if let Err(e) = pkt.set_extern_data(data_ptr, len) {
                    self.pool.put(pkt);
                    return Err(DrainError::Publish(e));
                }
                pkt.wire = Some(WireRef {
                    ring: ring_idx,
                    slot: cur,
                });
                if let Some(fwd) = &self.forwarder {
                    pkt.set_release_hook(fwd.clone());
                }
            } else if let Err(e) = pkt.copy_data(frame) {
                self.pool.put(pkt);
                return Err(DrainError::Publish(e));
            }

            if let Err(pkt) = self.downstream.process(pkt) {
                self.pool.put(pkt);
                return Err(DrainError::Downstream);
            }

            cur = ring.next(cur);
        }

        // Hand every visited slot back to the NIC. Swapped buffers carry
        // NS_BUF_CHANGED, set before this publish.
        ring.publish_cursor(cur);
        Ok(())
    }

    fn apply_checksum_policy(&self, pkt: &mut Packet) {
        match self.checksum_mode {
            ChecksumMode::Disable => {
                pkt.flags |= PacketFlags::SKIP_CHECKSUM;
            }
            ChecksumMode::Auto => {
                if self.livedev.ignore_checksum() {
                    pkt.flags |= PacketFlags::SKIP_CHECKSUM;
                } else if checksum::auto_mode_check(
                    self.total_pkts + self.pkts,
                    self.livedev.pkts.load(Ordering::Relaxed),
                    self.livedev.invalid_checksums.load(Ordering::Relaxed),
                ) {
                    self.livedev.set_ignore_checksum(true);
                    pkt.flags |= PacketFlags::SKIP_CHECKSUM;
                }
            }
            ChecksumMode::Validate => {}
        }
    }

    /// Push staged egress TX slots out to the NIC. Non-blocking: the ring
    /// may be under the release hook's lock right now, in which case the
    /// next cycle retries.
    fn sync_egress(&self, src_ring: usize) {
        let Some(dst) = &self.dst else { return };
        let ring = dst.ring(src_ring % dst.rings_cnt());

        if let Some(_guard) = ring.tx_lock().try_lock() {
            // SAFETY: fd is a registered fabric descriptor; this ioctl
            // takes no argument.
            if unsafe { libc::ioctl(ring.fd(), NIOCTXSYNC) } != 0 {
                debug!(
                    event.name = "capture.worker.txsync_failed",
                    iface = %dst.ifname(),
                    error = %io::Error::last_os_error(),
                    "tx sync ioctl failed"
                );
            }
        }
    }

    /// Fold per-cycle counters into the metrics registry and the
    /// live-device aggregates, then reset them.
    fn flush_counters(&mut self) {
        let drops = self.drops.swap(0, Ordering::Relaxed);
        if self.pkts > 0 {
            metrics::capture::add_kernel_packets(self.src.ifname(), &self.name, self.pkts);
            self.livedev.pkts.fetch_add(self.pkts, Ordering::Relaxed);
        }
        if drops > 0 {
            metrics::capture::add_kernel_drops(self.src.ifname(), &self.name, drops);
            self.livedev.drops.fetch_add(drops, Ordering::Relaxed);
        }
        self.total_pkts += self.pkts;
        self.total_bytes += self.bytes;
        self.total_drops += drops;
        self.pkts = 0;
        self.bytes = 0;
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            name: self.name.clone(),
            pkts: self.total_pkts,
            bytes: self.total_bytes,
            drops: self.total_drops,
        }
    }
}

#[cfg(test)]
impl CaptureWorker {
    /// Assemble a worker over synthetic devices, bypassing the open path.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn synthetic(
        name: &str,
        registry: Arc<DeviceRegistry>,
        pool: Arc<PacketPool>,
        src: Arc<NetmapDevice>,
        dst: Option<Arc<NetmapDevice>>,
        threads: usize,
        copy_mode: CopyMode,
        zero_copy: bool,
        downstream: Arc<dyn Downstream>,
        shutdown: ShutdownFlag,
    ) -> Self {
        let livedev = Arc::new(LiveDevice::new(src.ifname()));
        let worker_idx = src.claim_worker();
        let (ring_from, ring_to) = ring_bounds(src.rings_cnt(), threads, worker_idx as usize);
        let drops = Arc::new(AtomicU64::new(0));
        let forwarder = dst.as_ref().map(|d| {
            Arc::new(WireForwarder::new(
                src.clone(),
                d.clone(),
                copy_mode,
                drops.clone(),
            ))
        });
        Self {
            name: name.into(),
            registry,
            pool,
            downstream,
            shutdown,
            livedev,
            src,
            dst,
            ring_from,
            ring_to,
            worker_idx,
            zero_copy,
            copy_mode,
            checksum_mode: ChecksumMode::Validate,
            filter: None,
            forwarder,
            pkts: 0,
            bytes: 0,
            drops,
            total_pkts: 0,
            total_bytes: 0,
            total_drops: 0,
        }
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        // Egress first, then the source; both before the context goes away.
        if let Some(dst) = self.dst.take() {
            if let Err(e) = self.registry.release(&dst) {
                warn!(
                    event.name = "capture.worker.release_failed",
                    iface = %dst.ifname(),
                    error = %e,
                    "egress device release failed"
                );
            }
        }
        if let Err(e) = self.registry.release(&self.src) {
            warn!(
                event.name = "capture.worker.release_failed",
                iface = %self.src.ifname(),
                error = %e,
                "source device release failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testutil::FakeFabric;
    use crate::pipeline::SinkSlot;
    use harrier_common::PacketAction;
    use parking_lot::Mutex;

    fn test_worker(
        name: &str,
        registry: &Arc<DeviceRegistry>,
        pool: &Arc<PacketPool>,
        src: Arc<NetmapDevice>,
        dst: Option<Arc<NetmapDevice>>,
        threads: usize,
        copy_mode: CopyMode,
        zero_copy: bool,
        downstream: Arc<dyn Downstream>,
    ) -> CaptureWorker {
        CaptureWorker::synthetic(
            name,
            registry.clone(),
            pool.clone(),
            src,
            dst,
            threads,
            copy_mode,
            zero_copy,
            downstream,
            ShutdownFlag::new(),
        )
    }

    /// Counts processed packets and releases them right away.
    struct CountingSlot {
        pool: Arc<PacketPool>,
        seen: AtomicU64,
    }

    impl Downstream for CountingSlot {
        fn process(&self, pkt: Box<Packet>) -> Result<(), Box<Packet>> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.pool.release(pkt);
            Ok(())
        }
    }

    /// Tags every packet with a drop verdict before releasing it.
    struct DropSlot {
        pool: Arc<PacketPool>,
    }

    impl Downstream for DropSlot {
        fn process(&self, mut pkt: Box<Packet>) -> Result<(), Box<Packet>> {
            pkt.action = PacketAction::Drop;
            self.pool.release(pkt);
            Ok(())
        }
    }

    /// Holds on to packets, starving the pool.
    struct HoldSlot {
        held: Mutex<Vec<Box<Packet>>>,
    }

    impl Downstream for HoldSlot {
        fn process(&self, pkt: Box<Packet>) -> Result<(), Box<Packet>> {
            self.held.lock().push(pkt);
            Ok(())
        }
    }

    #[test]
    fn partition_bounds() {
        // threads == rings: one ring each.
        assert_eq!(ring_bounds(4, 4, 0), (0, 0));
        assert_eq!(ring_bounds(4, 4, 3), (3, 3));
        // one worker owns everything.
        assert_eq!(ring_bounds(4, 1, 0), (0, 3));
        // even split.
        assert_eq!(ring_bounds(4, 2, 0), (0, 1));
        assert_eq!(ring_bounds(4, 2, 1), (2, 3));
        // the last worker absorbs the remainder.
        assert_eq!(ring_bounds(5, 2, 0), (0, 1));
        assert_eq!(ring_bounds(5, 2, 1), (2, 4));
        assert_eq!(ring_bounds(6, 4, 2), (2, 2));
        assert_eq!(ring_bounds(6, 4, 3), (3, 5));
    }

    #[test]
    fn partition_ranges_are_disjoint_and_ordered() {
        for (rings, threads) in [(4usize, 2usize), (5, 2), (6, 4), (8, 3), (4, 4)] {
            let mut prev_to = None;
            for idx in 0..threads {
                let (from, to) = ring_bounds(rings, threads, idx);
                assert!(from <= to && to < rings, "({rings},{threads},{idx})");
                if let Some(p) = prev_to {
                    assert!(from > p, "overlap at ({rings},{threads},{idx})");
                }
                prev_to = Some(to);
            }
            // Full coverage up to the last ring.
            assert_eq!(prev_to, Some(rings - 1));
        }
    }

    #[test]
    fn capture_only_two_workers_see_every_frame_once() {
        let fabric = FakeFabric::new(4, 32, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());
        let dev2 = registry.open("fake0", false, true).unwrap();

        let pool = PacketPool::new(8, 512);
        let slot = Arc::new(CountingSlot {
            pool: pool.clone(),
            seen: AtomicU64::new(0),
        });

        for ring in 0..4 {
            for i in 0..25u8 {
                fabric.push_rx_frame(ring, &[i; 64]);
            }
        }

        let mut w0 = test_worker(
            "w0", &registry, &pool, dev, None, 2, CopyMode::None, false, slot.clone(),
        );
        let mut w1 = test_worker(
            "w1", &registry, &pool, dev2, None, 2, CopyMode::None, false, slot.clone(),
        );
        assert_eq!(w0.ring_range(), (0, 1));
        assert_eq!(w1.ring_range(), (2, 3));

        for ring in 0..2 {
            w0.drain_ring(ring).unwrap();
        }
        for ring in 2..4 {
            w1.drain_ring(ring).unwrap();
        }
        w0.flush_counters();
        w1.flush_counters();

        assert_eq!(slot.seen.load(Ordering::SeqCst), 100);
        let (s0, s1) = (w0.summary(), w1.summary());
        assert_eq!(s0.pkts + s1.pkts, 100);
        assert_eq!(s0.drops + s1.drops, 0);
        assert_eq!(s0.bytes + s1.bytes, 100 * 64);

        // Every visited slot was handed back to the NIC.
        for ring in 0..4 {
            let (head, cur, _) = fabric.rx_cursors(ring);
            assert_eq!((head, cur), (25, 25));
        }
    }

    #[test]
    fn reject_all_filter_keeps_counters_untouched() {
        let fabric = FakeFabric::new(1, 64, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());

        let pool = PacketPool::new(4, 512);
        let slot = Arc::new(CountingSlot {
            pool: pool.clone(),
            seen: AtomicU64::new(0),
        });

        for _ in 0..50 {
            fabric.push_rx_frame(0, &[0u8; 60]);
        }

        let mut worker = test_worker(
            "w0", &registry, &pool, dev, None, 1, CopyMode::None, false, slot.clone(),
        );
        worker.filter = Some(BpfFilter::compile("ether proto 0xFFFF").unwrap());

        worker.drain_ring(0).unwrap();
        worker.flush_counters();

        assert_eq!(slot.seen.load(Ordering::SeqCst), 0);
        // The filter runs before counting.
        assert_eq!(worker.summary().pkts, 0);
        // Rejected slots are still returned to the NIC.
        let (head, cur, _) = fabric.rx_cursors(0);
        assert_eq!((head, cur), (50, 50));
    }

    #[test]
    fn inline_accept_swaps_into_the_mapped_egress_ring() {
        let ingress = FakeFabric::new(4, 8, 512);
        let egress = FakeFabric::new(2, 8, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let src = ingress.device("ig0");
        let dst = egress.device("eg0");
        registry.insert_for_test(src.clone());
        registry.insert_for_test(dst.clone());

        let pool = PacketPool::new(4, 512);
        let slot = Arc::new(SinkSlot::new(pool.clone()));

        ingress.push_rx_frame(3, &[0x42; 96]);
        let rx_before = ingress.rx_slot(3, 0);
        let tx_before = egress.tx_slot(1, 0);

        let mut worker = test_worker(
            "w0", &registry, &pool, src, Some(dst), 1, CopyMode::Ips, true, slot,
        );
        worker.drain_ring(3).unwrap();
        worker.flush_counters();

        // src ring 3 maps onto egress ring 1.
        let tx_after = egress.tx_slot(1, 0);
        let rx_after = ingress.rx_slot(3, 0);
        assert_eq!(tx_after.buf_idx, rx_before.buf_idx);
        assert_eq!(rx_after.buf_idx, tx_before.buf_idx);
        assert_eq!(tx_after.len, 96);
        assert_ne!(tx_after.flags & crate::capture::fabric::NS_BUF_CHANGED, 0);
        assert_ne!(rx_after.flags & crate::capture::fabric::NS_BUF_CHANGED, 0);
        assert_eq!(egress.tx_cursors(1).0, 1);
        assert_eq!(worker.summary().drops, 0);

        // The swap happened before the RX cursor publish.
        let (head, cur, _) = ingress.rx_cursors(3);
        assert_eq!((head, cur), (1, 1));
    }

    #[test]
    fn inline_drop_verdict_leaves_egress_untouched() {
        let ingress = FakeFabric::new(4, 8, 512);
        let egress = FakeFabric::new(2, 8, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let src = ingress.device("ig0");
        let dst = egress.device("eg0");
        registry.insert_for_test(src.clone());
        registry.insert_for_test(dst.clone());

        let pool = PacketPool::new(4, 512);
        let slot = Arc::new(DropSlot { pool: pool.clone() });

        ingress.push_rx_frame(3, &[0x17; 48]);
        let rx_before = ingress.rx_slot(3, 0);

        let mut worker = test_worker(
            "w0", &registry, &pool, src, Some(dst), 1, CopyMode::Ips, true, slot,
        );
        worker.drain_ring(3).unwrap();
        worker.flush_counters();

        assert_eq!(egress.tx_cursors(1).0, 0);
        assert_eq!(ingress.rx_slot(3, 0).buf_idx, rx_before.buf_idx);
        // A verdict drop is not a TX-space drop.
        assert_eq!(worker.summary().drops, 0);
        // The slot is still released back to the NIC.
        assert_eq!(ingress.rx_cursors(3).0, 1);
    }

    #[test]
    fn inline_tx_full_drops_then_recovers() {
        let ingress = FakeFabric::new(2, 8, 512);
        let egress = FakeFabric::new(2, 8, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let src = ingress.device("ig0");
        let dst = egress.device("eg0");
        registry.insert_for_test(src.clone());
        registry.insert_for_test(dst.clone());

        let pool = PacketPool::new(4, 512);
        let slot = Arc::new(SinkSlot::new(pool.clone()));

        egress.fill_tx(1);
        ingress.push_rx_frame(1, &[0x01; 32]);

        let mut worker = test_worker(
            "w0", &registry, &pool, src, Some(dst), 1, CopyMode::Ips, true, slot,
        );
        worker.drain_ring(1).unwrap();
        worker.flush_counters();

        assert_eq!(worker.summary().drops, 1);
        assert_eq!(egress.tx_cursors(1).0, 0);

        // Once TX sync frees the ring, the next frame goes through.
        egress.release_tx_space(1);
        ingress.push_rx_frame(1, &[0x02; 32]);
        worker.drain_ring(1).unwrap();
        worker.flush_counters();

        assert_eq!(worker.summary().drops, 1);
        assert_eq!(egress.tx_cursors(1).0, 1);
    }

    #[test]
    fn pool_exhaustion_aborts_without_publishing_the_cursor() {
        let fabric = FakeFabric::new(1, 8, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());

        let pool = PacketPool::new(1, 512);
        let slot = Arc::new(HoldSlot {
            held: Mutex::new(Vec::new()),
        });

        fabric.push_rx_frame(0, &[1; 16]);
        fabric.push_rx_frame(0, &[2; 16]);
        fabric.push_rx_frame(0, &[3; 16]);

        let mut worker = test_worker(
            "w0", &registry, &pool, dev, None, 1, CopyMode::None, false, slot.clone(),
        );
        assert!(matches!(
            worker.drain_ring(0),
            Err(DrainError::PoolExhausted)
        ));

        // One frame made it out before the pool ran dry; the cursor stays
        // unpublished so the next cycle re-reads the same slots.
        assert_eq!(slot.held.lock().len(), 1);
        assert_eq!(fabric.rx_cursors(0).0, 0);
        assert_eq!(fabric.rx_cursors(0).1, 0);
        assert_eq!(worker.pkts, 1);
    }

    #[test]
    fn downstream_failure_returns_the_packet_to_the_pool() {
        struct RefuseSlot;
        impl Downstream for RefuseSlot {
            fn process(&self, pkt: Box<Packet>) -> Result<(), Box<Packet>> {
                Err(pkt)
            }
        }

        let fabric = FakeFabric::new(1, 8, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());

        let pool = PacketPool::new(2, 512);
        fabric.push_rx_frame(0, &[7; 16]);

        let mut worker = test_worker(
            "w0", &registry, &pool, dev, None, 1, CopyMode::None, false, Arc::new(RefuseSlot),
        );
        assert!(matches!(
            worker.drain_ring(0),
            Err(DrainError::Downstream)
        ));
        assert_eq!(pool.free_count(), 2);
        assert_eq!(fabric.rx_cursors(0).0, 0);
    }

    #[test]
    fn checksum_auto_mode_sticks_on_the_live_device() {
        let fabric = FakeFabric::new(1, 8, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());

        let pool = PacketPool::new(4, 512);
        let slot = Arc::new(CountingSlot {
            pool: pool.clone(),
            seen: AtomicU64::new(0),
        });

        let mut worker = test_worker(
            "w0", &registry, &pool, dev, None, 1, CopyMode::None, false, slot,
        );
        worker.checksum_mode = ChecksumMode::Auto;
        // Interface-wide history: 1000 packets, 200 invalid (> 10%).
        worker.livedev.pkts.store(1000, Ordering::Relaxed);
        worker
            .livedev
            .invalid_checksums
            .store(200, Ordering::Relaxed);
        // The next packet is this worker's 1000th.
        worker.total_pkts = checksum::CHECKSUM_SAMPLE_COUNT - 1;

        fabric.push_rx_frame(0, &[0; 20]);
        worker.drain_ring(0).unwrap();

        assert!(worker.livedev.ignore_checksum());

        // Later packets take the sticky path.
        fabric.push_rx_frame(0, &[0; 20]);
        worker.drain_ring(0).unwrap();
        assert!(worker.livedev.ignore_checksum());
    }

    #[test]
    fn checksum_auto_mode_keeps_validation_on_clean_traffic() {
        let fabric = FakeFabric::new(1, 8, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());

        let pool = PacketPool::new(4, 512);
        let slot = Arc::new(CountingSlot {
            pool: pool.clone(),
            seen: AtomicU64::new(0),
        });

        let mut worker = test_worker(
            "w0", &registry, &pool, dev, None, 1, CopyMode::None, false, slot,
        );
        worker.checksum_mode = ChecksumMode::Auto;
        worker.livedev.pkts.store(1000, Ordering::Relaxed);
        worker.livedev.invalid_checksums.store(5, Ordering::Relaxed);
        worker.total_pkts = checksum::CHECKSUM_SAMPLE_COUNT - 1;

        fabric.push_rx_frame(0, &[0; 20]);
        worker.drain_ring(0).unwrap();
        assert!(!worker.livedev.ignore_checksum());
    }

    #[test]
    fn shutdown_during_poll_timeout_exits_cleanly() {
        let fabric = FakeFabric::new(1, 8, 512);
        let registry = Arc::new(DeviceRegistry::new());
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());

        let pool = PacketPool::new(2, 512);
        let slot = Arc::new(SinkSlot::new(pool.clone()));

        let mut worker = test_worker(
            "w0", &registry, &pool, dev, None, 1, CopyMode::None, false, slot,
        );
        let shutdown = worker.shutdown.clone();

        let handle = std::thread::spawn(move || worker.run().map(|s| s.name));

        // Let the worker reach its poll wait, then ask it to stop.
        std::thread::sleep(std::time::Duration::from_millis(30));
        shutdown.trigger();

        let name = handle.join().unwrap().unwrap();
        assert_eq!(name, "w0");
    }
}
