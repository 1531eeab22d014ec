//! Shared contracts between the harrier capture engine and downstream
//! pipeline stages.
//!
//! This crate defines the packet object handed from the receive workers to
//! the processing pipeline, the packet pool that bounds allocation at line
//! rate, and the per-interface counter block aggregated across workers.
//!
//! # Key Types
//!
//! - [`Packet`]: one captured frame, carrying either an owned copy of the
//!   payload or a borrowed view into NIC-mapped memory (zero-copy).
//! - [`PacketPool`]: fixed-size pool of packet objects with a blocking
//!   free-wait used for backpressure toward the capture side.
//! - [`LiveDevice`]: interface-wide atomic counters shared by all workers
//!   capturing from the same interface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

bitflags! {
    /// Per-packet flags set by the capture path and consumed downstream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u16 {
        /// Checksum validation has been waived for this packet.
        const SKIP_CHECKSUM = 0x0001;
        /// Synthetic packet injected by the pipeline, never seen on a wire.
        const PSEUDO = 0x0002;
    }
}

/// Verdict attached to a packet by the detection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketAction {
    #[default]
    Accept,
    Drop,
}

/// Where a packet entered the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketSource {
    #[default]
    Unset,
    Wire,
}

/// Link-layer type of the payload, for the downstream decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Datalink {
    #[default]
    Ethernet,
    Raw,
}

/// Capture timestamp, seconds and microseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketTime {
    pub sec: i64,
    pub usec: i64,
}

/// Back-reference from a zero-copy packet to the exact ring slot the frame
/// was read from. The ring index is absolute within the source device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireRef {
    pub ring: usize,
    pub slot: u32,
}

/// Which payload a packet currently exposes: its own buffer (filled by
/// copy) or a borrowed view into externally-owned (NIC-mapped) memory.
/// The owned buffer is kept allocated either way so the pool never loses
/// capacity to zero-copy packets.
enum PayloadView {
    Owned,
    Extern { ptr: *const u8, len: usize },
}

/// Release-time hook invoked when the pipeline is finished with a packet,
/// before the packet object returns to its pool.
pub trait PacketRelease: Send + Sync {
    fn release(&self, pkt: &mut Packet);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Payload does not fit the packet's owned buffer.
    PayloadTooLarge { len: usize, max: usize },
    /// Attempt to attach a null external payload.
    NullPayload,
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds packet buffer of {max}")
            }
            Self::NullPayload => write!(f, "external payload pointer is null"),
        }
    }
}

impl std::error::Error for PacketError {}

/// One captured frame in flight through the pipeline.
pub struct Packet {
    buf: Box<[u8]>,
    buf_len: usize,
    view: PayloadView,
    pub flags: PacketFlags,
    pub action: PacketAction,
    pub source: PacketSource,
    pub datalink: Datalink,
    pub ts: PacketTime,
    /// Ring/slot back-reference, present on zero-copy packets only.
    pub wire: Option<WireRef>,
    /// Interface-wide counter block for the capturing interface.
    pub livedev: Option<Arc<LiveDevice>>,
    release: Option<Arc<dyn PacketRelease>>,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("buf_len", &self.buf_len)
            .field("flags", &self.flags)
            .field("action", &self.action)
            .field("source", &self.source)
            .field("datalink", &self.datalink)
            .field("ts", &self.ts)
            .field("wire", &self.wire)
            .field("has_livedev", &self.livedev.is_some())
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

// SAFETY: the `Extern` payload pointer refers into a NIC-mapped region that
// stays mapped for the lifetime of the capturing device handle, and the
// ring slot it belongs to is only mutated by the single receive worker that
// owns the ring (or under the egress TX lock). The packet is moved between
// threads but never aliased.
unsafe impl Send for Packet {}

impl Packet {
    /// Create a packet with an owned payload buffer of `data_size` bytes.
    fn with_capacity(data_size: usize) -> Self {
        Self {
            buf: vec![0u8; data_size].into_boxed_slice(),
            buf_len: 0,
            view: PayloadView::Owned,
            flags: PacketFlags::default(),
            action: PacketAction::default(),
            source: PacketSource::default(),
            datalink: Datalink::default(),
            ts: PacketTime::default(),
            wire: None,
            livedev: None,
            release: None,
        }
    }

    /// Attach an external payload without copying. The caller guarantees
    /// the memory outlives the packet's transit through the pipeline.
    pub fn set_extern_data(&mut self, ptr: *const u8, len: usize) -> Result<(), PacketError> {
        if ptr.is_null() {
            return Err(PacketError::NullPayload);
        }
        self.view = PayloadView::Extern { ptr, len };
        Ok(())
    }

    /// Copy a payload into the packet's owned buffer.
    pub fn copy_data(&mut self, payload: &[u8]) -> Result<(), PacketError> {
        if payload.len() > self.buf.len() {
            return Err(PacketError::PayloadTooLarge {
                len: payload.len(),
                max: self.buf.len(),
            });
        }
        self.buf[..payload.len()].copy_from_slice(payload);
        self.buf_len = payload.len();
        self.view = PayloadView::Owned;
        Ok(())
    }

    pub fn data(&self) -> &[u8] {
        match self.view {
            PayloadView::Owned => &self.buf[..self.buf_len],
            // SAFETY: upheld by the `set_extern_data` contract; ptr is
            // non-null and valid for `len` bytes while the packet lives.
            PayloadView::Extern { ptr, len } => unsafe { std::slice::from_raw_parts(ptr, len) },
        }
    }

    pub fn len(&self) -> usize {
        match self.view {
            PayloadView::Owned => self.buf_len,
            PayloadView::Extern { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arm the release hook run by [`PacketPool::release`].
    pub fn set_release_hook(&mut self, hook: Arc<dyn PacketRelease>) {
        self.release = Some(hook);
    }

    /// Reset all transient state for pool reuse. The owned buffer is kept.
    fn reset(&mut self) {
        self.view = PayloadView::Owned;
        self.buf_len = 0;
        self.flags = PacketFlags::default();
        self.action = PacketAction::default();
        self.source = PacketSource::default();
        self.datalink = Datalink::default();
        self.ts = PacketTime::default();
        self.wire = None;
        self.livedev = None;
        self.release = None;
    }
}

/// Fixed-size pool of packet objects.
///
/// Workers call [`PacketPool::wait_free`] before polling so a burst at line
/// rate never outruns packet allocation, then [`PacketPool::get`] per frame.
/// The pipeline hands finished packets back through [`PacketPool::release`],
/// which runs the packet's release hook (zero-copy forwarding) before the
/// object is recycled.
pub struct PacketPool {
    free: Mutex<Vec<Box<Packet>>>,
    available: Condvar,
    capacity: usize,
}

impl PacketPool {
    pub fn new(capacity: usize, data_size: usize) -> Arc<Self> {
        let free = (0..capacity)
            .map(|_| Box::new(Packet::with_capacity(data_size)))
            .collect();
        Arc::new(Self {
            free: Mutex::new(free),
            available: Condvar::new(),
            capacity,
        })
    }

    /// Take a packet from the pool. `None` when the pool is exhausted.
    pub fn get(&self) -> Option<Box<Packet>> {
        self.free.lock().pop()
    }

    /// Block until at least one packet object is free.
    pub fn wait_free(&self) {
        let mut free = self.free.lock();
        while free.is_empty() {
            self.available.wait(&mut free);
        }
    }

    /// Return a packet without running its release hook.
    pub fn put(&self, mut pkt: Box<Packet>) {
        pkt.reset();
        let mut free = self.free.lock();
        free.push(pkt);
        self.available.notify_one();
    }

    /// Run the packet's release hook, then return it to the pool.
    pub fn release(&self, mut pkt: Box<Packet>) {
        if let Some(hook) = pkt.release.take() {
            hook.release(&mut pkt);
        }
        self.put(pkt);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

/// Interface-wide counters shared by every worker capturing from the same
/// interface, plus the sticky checksum decision made by the auto policy.
pub struct LiveDevice {
    name: String,
    pub pkts: AtomicU64,
    pub drops: AtomicU64,
    pub invalid_checksums: AtomicU64,
    ignore_checksum: AtomicBool,
}

impl LiveDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pkts: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            invalid_checksums: AtomicU64::new(0),
            ignore_checksum: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ignore_checksum(&self) -> bool {
        self.ignore_checksum.load(Ordering::Relaxed)
    }

    pub fn set_ignore_checksum(&self, v: bool) {
        self.ignore_checksum.store(v, Ordering::Relaxed);
    }
}
