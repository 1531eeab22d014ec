//! Ring-fabric ABI: the memory layout and ioctl surface of the
//! kernel-bypass NIC interface.
//!
//! The control device exposes each hardware queue as a pair of descriptor
//! rings inside one shared memory-mapped region. The structures below are
//! exact mirrors of the fabric's C layout; all offsets within the region
//! are self-relative, so the same math works on a real mapping and on the
//! synthetic regions used in tests.

use std::ffi::CStr;
use std::mem;

pub const NETMAP_DEVICE: &CStr = c"/dev/netmap";

/// ABI version carried in every request.
pub const NETMAP_API: u32 = 11;

pub const IFNAMSIZ: usize = libc::IFNAMSIZ;

/// Register a single hardware queue pair.
pub const NR_REG_ONE_NIC: u32 = 4;
/// Keep TX quiescent on `poll()`; TX is synchronized explicitly.
pub const NETMAP_NO_TX_POLL: u16 = 0x1000;

/// Slot flag: the buffer index was exchanged and the NIC must re-read the
/// descriptor before reusing the slot.
pub const NS_BUF_CHANGED: u16 = 0x0001;

/// Request block for `NIOCGINFO`/`NIOCREGIF`.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
pub struct NmReq {
    pub nr_name: [u8; IFNAMSIZ],
    pub nr_version: u32,
    pub nr_offset: u32,
    pub nr_memsize: u32,
    pub nr_tx_slots: u32,
    pub nr_rx_slots: u32,
    pub nr_tx_rings: u16,
    pub nr_rx_rings: u16,
    pub nr_ringid: u16,
    pub nr_cmd: u16,
    pub nr_arg1: u16,
    pub nr_arg2: u16,
    pub nr_arg3: u32,
    pub nr_flags: u32,
    pub spare2: [u32; 1],
}

impl NmReq {
    /// Zeroed request carrying the interface name and ABI version.
    /// Fails when the name does not fit the OS interface-name limit.
    pub fn for_iface(ifname: &str) -> Option<Self> {
        if ifname.len() >= IFNAMSIZ || ifname.contains('\0') {
            return None;
        }
        // SAFETY: NmReq is a plain #[repr(C)] struct of integers and byte
        // arrays; the all-zero bit pattern is a valid value.
        let mut req: NmReq = unsafe { mem::zeroed() };
        req.nr_name[..ifname.len()].copy_from_slice(ifname.as_bytes());
        req.nr_version = NETMAP_API;
        Some(req)
    }
}

// Linux ioctl request encoding: dir(2) | size(14) | type(8) | nr(8).
const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

/// Query ring counts and region size for an interface.
pub const NIOCGINFO: libc::c_ulong = ioc(3, b'i', 145, mem::size_of::<NmReq>());
/// Bind a descriptor to one ring of an interface.
pub const NIOCREGIF: libc::c_ulong = ioc(3, b'i', 146, mem::size_of::<NmReq>());
/// Flush pending TX slots on the descriptor's ring.
pub const NIOCTXSYNC: libc::c_ulong = ioc(0, b'i', 148, 0);

/// Per-interface header inside the mapped region. The `i64` ring-offset
/// table follows immediately after this struct: `ni_tx_rings + 1` TX
/// entries (hardware rings plus the host ring), then the RX entries.
#[repr(C)]
#[allow(dead_code)]
pub struct NetmapIf {
    pub ni_name: [u8; IFNAMSIZ],
    pub ni_version: u32,
    pub ni_flags: u32,
    pub ni_tx_rings: u32,
    pub ni_rx_rings: u32,
    pub ni_bufs_head: u32,
    pub ni_spare1: [u32; 5],
}

/// Resolve the interface header inside a mapped region.
///
/// # Safety
/// `mem` must point to a live mapping at least `offset + size_of::<NetmapIf>()`
/// bytes long, with a valid fabric interface header at `offset`.
pub unsafe fn if_at(mem: *mut u8, offset: usize) -> *mut NetmapIf {
    unsafe { mem.add(offset) as *mut NetmapIf }
}

/// # Safety
/// `nif` must be a valid interface header whose ring-offset table covers
/// index `i` for the requested direction.
pub unsafe fn tx_ring_at(nif: *mut NetmapIf, i: usize) -> *mut NetmapRing {
    unsafe {
        let table = nif.add(1) as *const i64;
        (nif as *mut u8).offset(*table.add(i) as isize) as *mut NetmapRing
    }
}

/// # Safety
/// Same requirements as [`tx_ring_at`]. RX entries sit after the TX entries
/// and the TX host ring in the offset table.
pub unsafe fn rx_ring_at(nif: *mut NetmapIf, i: usize) -> *mut NetmapRing {
    unsafe {
        let tx = (*nif).ni_tx_rings as usize;
        let table = nif.add(1) as *const i64;
        (nif as *mut u8).offset(*table.add(i + tx + 1) as isize) as *mut NetmapRing
    }
}

/// Cache-line pad between the ring header and its slot array, fixed by the
/// fabric ABI.
#[repr(C, align(128))]
#[allow(dead_code)]
pub struct RingPad(pub [u8; 128]);

/// One descriptor ring. The slot array follows the struct; buffers are
/// addressed relative to the ring pointer via `buf_ofs`.
#[repr(C)]
#[allow(dead_code)]
pub struct NetmapRing {
    pub buf_ofs: i64,
    pub num_slots: u32,
    pub nr_buf_size: u32,
    pub ringid: u16,
    pub dir: u16,
    pub head: u32,
    pub cur: u32,
    pub tail: u32,
    pub flags: u32,
    pub ts: libc::timeval,
    pub sem: RingPad,
}

/// One descriptor entry: a buffer index into the region's buffer pool,
/// the frame length, and per-slot flags.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
pub struct NetmapSlot {
    pub buf_idx: u32,
    pub len: u16,
    pub flags: u16,
    pub ptr: u64,
}

/// Accessor over one mapped ring.
///
/// The RX side of a ring is written only by the single worker that owns the
/// ring; the TX side only under the ring descriptor's TX lock. Kernel-shared
/// fields (`head`, `cur`, `tail`) go through volatile accesses since the NIC
/// updates them outside the program's knowledge.
#[derive(Clone, Copy)]
pub struct RingView {
    ring: *mut NetmapRing,
}

// SAFETY: a RingView is a pointer into a region that stays mapped for the
// lifetime of the owning device handle; mutation is serialized by the
// single-writer RX discipline and the TX lock documented above.
unsafe impl Send for RingView {}
unsafe impl Sync for RingView {}

impl RingView {
    /// # Safety
    /// `ring` must point to a valid, mapped fabric ring that outlives the
    /// view and every slot/buffer pointer derived from it.
    pub unsafe fn new(ring: *mut NetmapRing) -> Self {
        Self { ring }
    }

    pub fn num_slots(&self) -> u32 {
        // SAFETY: num_slots is immutable after registration; the pointer is
        // valid per the constructor contract.
        unsafe { (*self.ring).num_slots }
    }

    pub fn cur(&self) -> u32 {
        // SAFETY: constructor contract; cur is written by this side only,
        // volatile for symmetry with the kernel-shared cursor fields.
        unsafe { std::ptr::read_volatile(&raw const (*self.ring).cur) }
    }

    pub fn tail(&self) -> u32 {
        // SAFETY: constructor contract; tail is advanced by the kernel.
        unsafe { std::ptr::read_volatile(&raw const (*self.ring).tail) }
    }

    /// Readable (RX) or writable (TX) slots between `cur` and `tail`.
    pub fn space(&self) -> u32 {
        let n = self.num_slots();
        let (cur, tail) = (self.cur(), self.tail());
        if tail >= cur { tail - cur } else { tail + n - cur }
    }

    /// Successor of slot index `i`, wrapping at the ring size.
    pub fn next(&self, i: u32) -> u32 {
        if i + 1 == self.num_slots() { 0 } else { i + 1 }
    }

    pub fn slot(&self, i: u32) -> *mut NetmapSlot {
        debug_assert!(i < self.num_slots());
        // SAFETY: the slot array follows the ring header; i is within
        // num_slots per the debug assertion and ring invariants.
        unsafe { (self.ring.add(1) as *mut NetmapSlot).add(i as usize) }
    }

    /// Payload buffer of `buf_idx`, addressed relative to the ring.
    pub fn buf(&self, buf_idx: u32) -> *mut u8 {
        // SAFETY: buf_ofs/nr_buf_size are immutable after registration and
        // place every valid buf_idx inside the mapped region.
        unsafe {
            let r = &*self.ring;
            (self.ring as *mut u8)
                .offset(r.buf_ofs as isize)
                .add(buf_idx as usize * r.nr_buf_size as usize)
        }
    }

    /// Data pointer and length of one slot.
    pub fn slot_data(&self, i: u32) -> (*mut u8, usize) {
        // SAFETY: slot(i) is valid per ring invariants; reading a slot the
        // kernel has published (i between cur and tail) is race-free.
        let (buf_idx, len) = unsafe {
            let s = &*self.slot(i);
            (s.buf_idx, s.len as usize)
        };
        (self.buf(buf_idx), len)
    }

    pub fn timestamp(&self) -> libc::timeval {
        // SAFETY: constructor contract; ts is updated by the kernel on sync.
        unsafe { std::ptr::read_volatile(&raw const (*self.ring).ts) }
    }

    /// Publish a new cursor to both `head` and `cur`, handing every slot
    /// before it back to the NIC.
    pub fn publish_cursor(&self, cursor: u32) {
        // SAFETY: constructor contract; head/cur are written by this side
        // only (RX single-writer, or under the TX lock).
        unsafe {
            std::ptr::write_volatile(&raw mut (*self.ring).head, cursor);
            std::ptr::write_volatile(&raw mut (*self.ring).cur, cursor);
        }
    }

    /// Advance `head` and `cur` past the current slot (TX emit).
    pub fn advance(&self) {
        self.publish_cursor(self.next(self.cur()));
    }
}
