//! Zero-copy forwarding for inline (TAP/IPS) deployments.
//!
//! Runs as the release hook of zero-copy packets: once the pipeline is
//! done with a frame, its RX slot's buffer index is exchanged with the
//! current TX slot of the egress ring, moving the payload between
//! interfaces without a copy. The actual transmit happens on the next TX
//! sync issued from the owning worker's poll loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use harrier_common::{Packet, PacketAction, PacketFlags, PacketRelease};

use super::device::NetmapDevice;
use super::fabric::NS_BUF_CHANGED;
use super::opts::CopyMode;

pub struct WireForwarder {
    src: Arc<NetmapDevice>,
    dst: Arc<NetmapDevice>,
    copy_mode: CopyMode,
    /// Shared with the owning worker, which folds it into its per-cycle
    /// counter flush.
    drops: Arc<AtomicU64>,
}

impl WireForwarder {
    pub fn new(
        src: Arc<NetmapDevice>,
        dst: Arc<NetmapDevice>,
        copy_mode: CopyMode,
        drops: Arc<AtomicU64>,
    ) -> Self {
        Self {
            src,
            dst,
            copy_mode,
            drops,
        }
    }

    /// Stage one frame on the egress TX ring, or drop it.
    fn write_packet(&self, pkt: &Packet) {
        if self.copy_mode == CopyMode::Ips && pkt.action == PacketAction::Drop {
            // The RX slot goes back to the NIC on the next cursor publish;
            // the frame is simply never staged for TX.
            return;
        }

        let Some(wire) = pkt.wire else { return };

        // Round-robin onto the egress when it has fewer rings than ingress.
        let dst_desc = self.dst.ring(wire.ring % self.dst.rings_cnt());
        let rx = self.src.ring(wire.ring).rx();

        let guard = dst_desc.tx_lock().lock();
        let tx = dst_desc.tx();

        if tx.space() == 0 {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // SAFETY: the RX slot stays owned by the originating worker until
        // it publishes its cursor, and the TX slot is protected by the
        // lock held above.
        unsafe {
            let rs = &mut *rx.slot(wire.slot);
            let ts = &mut *tx.slot(tx.cur());
            std::mem::swap(&mut rs.buf_idx, &mut ts.buf_idx);
            ts.len = rs.len;
            ts.flags |= NS_BUF_CHANGED;
            rs.flags |= NS_BUF_CHANGED;
        }

        // The swap becomes visible to the NIC only through this advance.
        tx.advance();
        drop(guard);
    }
}

impl PacketRelease for WireForwarder {
    fn release(&self, pkt: &mut Packet) {
        // Synthetic packets carry no ring slot behind them.
        if pkt.flags.contains(PacketFlags::PSEUDO) {
            return;
        }
        self.write_packet(pkt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testutil::FakeFabric;
    use harrier_common::{PacketPool, WireRef};

    fn forwarder(
        src_fabric: &FakeFabric,
        dst_fabric: &FakeFabric,
        copy_mode: CopyMode,
    ) -> (WireForwarder, Arc<AtomicU64>) {
        let drops = Arc::new(AtomicU64::new(0));
        let fwd = WireForwarder::new(
            src_fabric.device("ig0"),
            dst_fabric.device("eg0"),
            copy_mode,
            drops.clone(),
        );
        (fwd, drops)
    }

    #[test]
    fn accept_swaps_buffers_into_egress_ring() {
        let ingress = FakeFabric::new(4, 8, 512);
        let egress = FakeFabric::new(2, 8, 512);
        ingress.push_rx_frame(3, &[0xAB; 60]);

        let rx_before = ingress.rx_slot(3, 0);
        // Ring 3 maps onto egress ring 3 % 2 = 1.
        let tx_before = egress.tx_slot(1, 0);

        let (fwd, drops) = forwarder(&ingress, &egress, CopyMode::Ips);
        let pool = PacketPool::new(1, 64);
        let mut pkt = pool.get().unwrap();
        pkt.wire = Some(WireRef { ring: 3, slot: 0 });
        fwd.write_packet(&pkt);

        let rx_after = ingress.rx_slot(3, 0);
        let tx_after = egress.tx_slot(1, 0);
        assert_eq!(rx_after.buf_idx, tx_before.buf_idx);
        assert_eq!(tx_after.buf_idx, rx_before.buf_idx);
        assert_eq!(tx_after.len, 60);
        assert_ne!(rx_after.flags & NS_BUF_CHANGED, 0);
        assert_ne!(tx_after.flags & NS_BUF_CHANGED, 0);

        let (head, cur, _) = egress.tx_cursors(1);
        assert_eq!((head, cur), (1, 1));
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        // The other egress ring is untouched.
        assert_eq!(egress.tx_cursors(0), (0, 0, 7));
    }

    #[test]
    fn ips_drop_verdict_is_not_forwarded() {
        let ingress = FakeFabric::new(4, 8, 512);
        let egress = FakeFabric::new(2, 8, 512);
        ingress.push_rx_frame(3, &[0xCD; 40]);
        let rx_before = ingress.rx_slot(3, 0);

        let (fwd, drops) = forwarder(&ingress, &egress, CopyMode::Ips);
        let pool = PacketPool::new(1, 64);
        let mut pkt = pool.get().unwrap();
        pkt.wire = Some(WireRef { ring: 3, slot: 0 });
        pkt.action = PacketAction::Drop;
        fwd.write_packet(&pkt);

        // A verdict drop is not a "no TX space" drop.
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        assert_eq!(egress.tx_cursors(1).0, 0);
        assert_eq!(ingress.rx_slot(3, 0).buf_idx, rx_before.buf_idx);
    }

    #[test]
    fn tap_mode_mirrors_even_dropped_frames() {
        let ingress = FakeFabric::new(2, 8, 512);
        let egress = FakeFabric::new(2, 8, 512);
        ingress.push_rx_frame(0, &[0x11; 30]);

        let (fwd, _) = forwarder(&ingress, &egress, CopyMode::Tap);
        let pool = PacketPool::new(1, 64);
        let mut pkt = pool.get().unwrap();
        pkt.wire = Some(WireRef { ring: 0, slot: 0 });
        pkt.action = PacketAction::Drop;
        fwd.write_packet(&pkt);

        assert_eq!(egress.tx_cursors(0).0, 1);
    }

    #[test]
    fn full_tx_ring_counts_a_drop() {
        let ingress = FakeFabric::new(2, 8, 512);
        let egress = FakeFabric::new(2, 8, 512);
        ingress.push_rx_frame(1, &[0x22; 20]);
        egress.fill_tx(1);
        let rx_before = ingress.rx_slot(1, 0);

        let (fwd, drops) = forwarder(&ingress, &egress, CopyMode::Ips);
        let pool = PacketPool::new(1, 64);
        let mut pkt = pool.get().unwrap();
        pkt.wire = Some(WireRef { ring: 1, slot: 0 });
        fwd.write_packet(&pkt);

        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(egress.tx_cursors(1).0, 0);
        assert_eq!(ingress.rx_slot(1, 0).buf_idx, rx_before.buf_idx);
    }

    #[test]
    fn pseudo_packets_are_ignored_on_release() {
        let ingress = FakeFabric::new(1, 8, 512);
        let egress = FakeFabric::new(1, 8, 512);
        ingress.push_rx_frame(0, &[0x33; 20]);

        let (fwd, drops) = forwarder(&ingress, &egress, CopyMode::Ips);
        let pool = PacketPool::new(1, 64);
        let mut pkt = pool.get().unwrap();
        pkt.wire = Some(WireRef { ring: 0, slot: 0 });
        pkt.flags |= PacketFlags::PSEUDO;
        fwd.release(&mut pkt);

        assert_eq!(egress.tx_cursors(0).0, 0);
        assert_eq!(drops.load(Ordering::Relaxed), 0);
    }
}
