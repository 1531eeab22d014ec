//! Downstream slot contract.
//!
//! The receive workers hand each captured packet to a [`Downstream`] slot,
//! the first stage of the processing pipeline. A slot that cannot accept a
//! packet returns it, and the worker aborts the current drain iteration.

use std::sync::Arc;

use crossbeam::channel::Sender;
use harrier_common::{Packet, PacketPool};

pub trait Downstream: Send + Sync {
    /// Process one packet. On failure the packet comes back to the caller,
    /// which returns it to its pool.
    fn process(&self, pkt: Box<Packet>) -> Result<(), Box<Packet>>;
}

/// Feeds packets into a channel toward the next pipeline stage.
#[allow(dead_code)]
pub struct ChannelSlot {
    tx: Sender<Box<Packet>>,
}

impl ChannelSlot {
    #[allow(dead_code)]
    pub fn new(tx: Sender<Box<Packet>>) -> Self {
        Self { tx }
    }
}

impl Downstream for ChannelSlot {
    fn process(&self, pkt: Box<Packet>) -> Result<(), Box<Packet>> {
        self.tx.send(pkt).map_err(|e| e.into_inner())
    }
}

/// Terminal slot: accepts every packet and releases it immediately. Used
/// when harrier runs stand-alone, without a detection pipeline attached;
/// release hooks (inline forwarding) still run.
pub struct SinkSlot {
    pool: Arc<PacketPool>,
}

impl SinkSlot {
    pub fn new(pool: Arc<PacketPool>) -> Self {
        Self { pool }
    }
}

impl Downstream for SinkSlot {
    fn process(&self, pkt: Box<Packet>) -> Result<(), Box<Packet>> {
        self.pool.release(pkt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    #[test]
    fn channel_slot_delivers() {
        let (tx, rx) = channel::unbounded();
        let slot = ChannelSlot::new(tx);
        let pool = PacketPool::new(1, 64);
        let mut pkt = pool.get().unwrap();
        pkt.copy_data(&[1, 2, 3]).unwrap();
        slot.process(pkt).unwrap();
        assert_eq!(rx.recv().unwrap().data(), &[1, 2, 3]);
    }

    #[test]
    fn disconnected_channel_returns_the_packet() {
        let (tx, rx) = channel::unbounded();
        drop(rx);
        let slot = ChannelSlot::new(tx);
        let pool = PacketPool::new(1, 64);
        let pkt = pool.get().unwrap();
        let returned = slot.process(pkt).unwrap_err();
        pool.put(returned);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn sink_slot_recycles_packets() {
        let pool = PacketPool::new(1, 64);
        let slot = SinkSlot::new(pool.clone());
        let pkt = pool.get().unwrap();
        slot.process(pkt).unwrap();
        assert_eq!(pool.free_count(), 1);
    }
}
