//! Shared device registry and memory-mapped device handles.
//!
//! A device handle is opened once per interface and shared by every worker
//! capturing from (or forwarding to) it. The registry serializes open and
//! release under one mutex so lookup-or-create is atomic; syscalls run
//! under the mutex on purpose to keep concurrent openers of the same
//! interface from racing the registration sequence.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::CaptureError;
use super::fabric::{
    self, IFNAMSIZ, NETMAP_DEVICE, NETMAP_NO_TX_POLL, NR_REG_ONE_NIC, NmReq, RingView,
};

/// One hardware queue pair: an independently pollable descriptor plus the
/// RX/TX rings it registered inside the shared region. The TX side is
/// shared between the owning worker's sync path and release callbacks from
/// other workers, hence the lock; the RX side is single-writer.
pub struct RingDesc {
    fd: OwnedFd,
    rx: RingView,
    tx: RingView,
    tx_lock: Mutex<()>,
}

impl RingDesc {
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn rx(&self) -> RingView {
        self.rx
    }

    /// TX ring view. Callers must hold [`RingDesc::tx_lock`] while touching
    /// the ring's slots or cursors.
    pub fn tx(&self) -> RingView {
        self.tx
    }

    pub fn tx_lock(&self) -> &Mutex<()> {
        &self.tx_lock
    }

    #[cfg(test)]
    pub(crate) fn synthetic(fd: OwnedFd, rx: RingView, tx: RingView) -> Self {
        Self {
            fd,
            rx,
            tx,
            tx_lock: Mutex::new(()),
        }
    }
}

/// An open, memory-mapped NIC device.
///
/// The handle owns the single mapping of the device's shared region; ring
/// descriptors hold non-owning views into it. Reference counting lives in
/// the registry entry and is only touched under the registry mutex.
pub struct NetmapDevice {
    ifname: String,
    mem: *mut u8,
    memsize: usize,
    rings: Vec<RingDesc>,
    refs: AtomicU32,
    claims: AtomicU32,
}

// SAFETY: the raw region pointer is only dereferenced through RingView
// accessors whose locking discipline is documented on RingDesc; everything
// else in the handle is Sync by construction.
unsafe impl Send for NetmapDevice {}
unsafe impl Sync for NetmapDevice {}

impl NetmapDevice {
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn rings_cnt(&self) -> usize {
        self.rings.len()
    }

    pub fn ring(&self, i: usize) -> &RingDesc {
        &self.rings[i]
    }

    /// Claim the next worker index on this device. Monotonic; workers use
    /// the claimed value to partition the ring array among themselves.
    pub fn claim_worker(&self) -> u32 {
        self.claims.fetch_add(1, Ordering::Relaxed)
    }

    #[allow(dead_code)]
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn synthetic(ifname: &str, rings: Vec<RingDesc>) -> Self {
        Self {
            ifname: ifname.to_string(),
            mem: std::ptr::null_mut(),
            memsize: 0,
            rings,
            refs: AtomicU32::new(0),
            claims: AtomicU32::new(0),
        }
    }
}

impl Drop for NetmapDevice {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            // SAFETY: mem/memsize describe the mapping created in
            // open_device and nothing references it past the handle.
            unsafe {
                libc::munmap(self.mem as *mut libc::c_void, self.memsize);
            }
        }
    }
}

/// Process-wide registry of open device handles, keyed by interface name.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<NetmapDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `ifname` in fabric mode, or take another reference on the
    /// already-open handle.
    pub fn open(
        &self,
        ifname: &str,
        promisc: bool,
        verbose: bool,
    ) -> Result<Arc<NetmapDevice>, CaptureError> {
        let mut devices = self.devices.lock();

        if let Some(dev) = devices.get(ifname) {
            dev.refs.fetch_add(1, Ordering::Relaxed);
            return Ok(dev.clone());
        }

        let dev = Arc::new(open_device(ifname, promisc, verbose)?);
        dev.refs.store(1, Ordering::Relaxed);
        devices.insert(ifname.to_string(), dev.clone());
        Ok(dev)
    }

    /// Drop one reference; the last reference unregisters the handle and
    /// tears down its mapping and descriptors.
    pub fn release(&self, dev: &Arc<NetmapDevice>) -> Result<(), CaptureError> {
        let mut devices = self.devices.lock();

        match devices.get(dev.ifname()) {
            Some(entry) if Arc::ptr_eq(entry, dev) => {
                if dev.refs.fetch_sub(1, Ordering::Relaxed) == 1 {
                    devices.remove(dev.ifname());
                    debug!(
                        event.name = "capture.device.closed",
                        iface = %dev.ifname(),
                        "last reference released, device unregistered"
                    );
                }
                Ok(())
            }
            _ => Err(CaptureError::UnknownDevice(dev.ifname().to_string())),
        }
    }

    #[allow(dead_code)]
    pub fn contains(&self, ifname: &str) -> bool {
        self.devices.lock().contains_key(ifname)
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, dev: Arc<NetmapDevice>) {
        dev.refs.store(1, Ordering::Relaxed);
        self.devices.lock().insert(dev.ifname().to_string(), dev);
    }
}

/// Unmaps the region unless dismissed, so every early return in the open
/// sequence tears down a partially-registered device.
struct MapGuard {
    mem: *mut u8,
    size: usize,
}

impl MapGuard {
    fn into_raw(mut self) -> *mut u8 {
        mem::replace(&mut self.mem, std::ptr::null_mut())
    }
}

impl Drop for MapGuard {
    fn drop(&mut self) {
        if !self.mem.is_null() {
            // SAFETY: mem/size describe a live mapping created by this
            // module and not yet handed to a device handle.
            unsafe {
                libc::munmap(self.mem as *mut libc::c_void, self.size);
            }
        }
    }
}

fn open_device(ifname: &str, promisc: bool, verbose: bool) -> Result<NetmapDevice, CaptureError> {
    let base_req = NmReq::for_iface(ifname)
        .ok_or_else(|| CaptureError::Config(format!("invalid interface name '{ifname}'")))?;

    let ctl = open_control(ifname)?;

    check_iface_up(ifname, promisc, verbose)?;

    // Query ring geometry and region size.
    let mut req = base_req;
    // SAFETY: ctl is a valid fabric descriptor and req a properly
    // initialized request block for this ioctl.
    if unsafe { libc::ioctl(ctl.as_raw_fd(), fabric::NIOCGINFO, &mut req) } != 0 {
        let err = io::Error::last_os_error();
        if verbose {
            warn!(
                event.name = "capture.device.query_failed",
                iface = %ifname,
                error = %err,
                "fabric query ioctl failed"
            );
        }
        return Err(CaptureError::Resource {
            op: "NIOCGINFO",
            iface: ifname.to_string(),
            source: err,
        });
    }

    if req.nr_rx_rings != req.nr_tx_rings {
        return Err(CaptureError::Config(format!(
            "interface '{ifname}' has unequal tx/rx rings ({}/{})",
            req.nr_tx_rings, req.nr_rx_rings
        )));
    }

    let rings_cnt = req.nr_rx_rings as usize;
    let memsize = req.nr_memsize as usize;

    let mut map: Option<MapGuard> = None;
    let mut nif: *mut fabric::NetmapIf = std::ptr::null_mut();
    let mut rings = Vec::with_capacity(rings_cnt);

    // Register an independent descriptor per hardware ring. Any failure
    // drops `rings` and `map`, closing every descriptor opened so far and
    // unmapping the region.
    for i in 0..rings_cnt {
        let fd = open_control(ifname)?;

        let mut req = base_req;
        req.nr_flags = NR_REG_ONE_NIC;
        req.nr_ringid = i as u16 | NETMAP_NO_TX_POLL;
        // SAFETY: fd is a valid fabric descriptor and req a properly
        // initialized request block for this ioctl.
        if unsafe { libc::ioctl(fd.as_raw_fd(), fabric::NIOCREGIF, &mut req) } != 0 {
            let err = io::Error::last_os_error();
            warn!(
                event.name = "capture.device.register_failed",
                iface = %ifname,
                ring = i,
                error = %err,
                "ring registration ioctl failed"
            );
            return Err(CaptureError::Resource {
                op: "NIOCREGIF",
                iface: ifname.to_string(),
                source: err,
            });
        }

        if map.is_none() {
            // SAFETY: fd is a freshly registered fabric descriptor; the
            // fabric maps its shared region at offset 0 for memsize bytes.
            let mem = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    memsize,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd.as_raw_fd(),
                    0,
                )
            };
            if mem == libc::MAP_FAILED {
                return Err(CaptureError::resource("mmap", ifname));
            }
            let mem = mem as *mut u8;
            map = Some(MapGuard { mem, size: memsize });
            // SAFETY: the mapping is memsize bytes and the fabric placed a
            // valid interface header at nr_offset.
            nif = unsafe { fabric::if_at(mem, req.nr_offset as usize) };
        }

        // SAFETY: nif is the registered interface header and i is a valid
        // hardware ring index on this device.
        let (rx, tx) = unsafe {
            (
                RingView::new(fabric::rx_ring_at(nif, i)),
                RingView::new(fabric::tx_ring_at(nif, i)),
            )
        };

        rings.push(RingDesc {
            fd,
            rx,
            tx,
            tx_lock: Mutex::new(()),
        });
    }

    drop(ctl);

    let mem = match map {
        Some(guard) => guard.into_raw(),
        None => std::ptr::null_mut(),
    };

    info!(
        event.name = "capture.device.opened",
        iface = %ifname,
        rings = rings_cnt,
        memsize,
        "fabric device opened"
    );

    Ok(NetmapDevice {
        ifname: ifname.to_string(),
        mem,
        memsize,
        rings,
        refs: AtomicU32::new(0),
        claims: AtomicU32::new(0),
    })
}

fn open_control(ifname: &str) -> Result<OwnedFd, CaptureError> {
    // SAFETY: plain open(2) on a constant path; the result is checked and
    // ownership transferred to OwnedFd immediately.
    let fd = unsafe { libc::open(NETMAP_DEVICE.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(CaptureError::resource("open /dev/netmap", ifname));
    }
    // SAFETY: fd is a freshly opened, valid descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Check the interface is administratively up, optionally turning on
/// promiscuous mode while the control socket is open.
fn check_iface_up(ifname: &str, promisc: bool, verbose: bool) -> Result<(), CaptureError> {
    // SAFETY: plain socket(2); the result is checked and wrapped.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(CaptureError::resource("socket", ifname));
    }
    // SAFETY: fd is a freshly opened, valid descriptor.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let flags = match iface_flags(sock.as_raw_fd(), ifname) {
        Ok(flags) => flags,
        Err(e) => {
            if verbose {
                warn!(
                    event.name = "capture.device.flags_failed",
                    iface = %ifname,
                    error = %e,
                    "unable to read interface flags"
                );
            }
            return Err(CaptureError::Resource {
                op: "SIOCGIFFLAGS",
                iface: ifname.to_string(),
                source: e,
            });
        }
    };

    if flags & libc::IFF_UP as libc::c_short == 0 {
        if verbose {
            warn!(
                event.name = "capture.device.iface_down",
                iface = %ifname,
                "interface is administratively down"
            );
        }
        return Err(CaptureError::IfaceDown(ifname.to_string()));
    }

    if promisc {
        let flags = flags | libc::IFF_PROMISC as libc::c_short;
        if let Err(e) = set_iface_flags(sock.as_raw_fd(), ifname, flags) {
            warn!(
                event.name = "capture.device.promisc_failed",
                iface = %ifname,
                error = %e,
                "unable to enable promiscuous mode"
            );
        }
    }

    Ok(())
}

fn ifreq_for(ifname: &str) -> io::Result<libc::ifreq> {
    if ifname.len() >= IFNAMSIZ || ifname.contains('\0') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name '{ifname}' exceeds IFNAMSIZ"),
        ));
    }
    // SAFETY: ifreq is a plain C struct; the all-zero bit pattern is valid.
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(ifname.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

fn iface_flags(fd: RawFd, ifname: &str) -> io::Result<libc::c_short> {
    let mut ifr = ifreq_for(ifname)?;
    // SAFETY: fd is a valid socket and ifr a properly initialized ifreq.
    if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) } == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: SIOCGIFFLAGS populated the flags member of the union.
    Ok(unsafe { ifr.ifr_ifru.ifru_flags })
}

fn set_iface_flags(fd: RawFd, ifname: &str, flags: libc::c_short) -> io::Result<()> {
    let mut ifr = ifreq_for(ifname)?;
    ifr.ifr_ifru.ifru_flags = flags;
    // SAFETY: fd is a valid socket and ifr a properly initialized ifreq
    // with the flags member set.
    if unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &mut ifr) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

const ETHTOOL_GFLAGS: u32 = 0x0000_0025;
const ETHTOOL_GGRO: u32 = 0x0000_002b;
const ETH_FLAG_LRO: u32 = 1 << 15;

#[repr(C)]
#[allow(dead_code)]
struct EthtoolValue {
    cmd: u32,
    data: u32,
}

fn ethtool_value(fd: RawFd, ifname: &str, cmd: u32) -> io::Result<u32> {
    let mut ev = EthtoolValue { cmd, data: 0 };
    let mut ifr = ifreq_for(ifname)?;
    ifr.ifr_ifru.ifru_data = &mut ev as *mut EthtoolValue as *mut libc::c_char;
    // SAFETY: fd is a valid socket; ifr points at a live EthtoolValue for
    // the duration of the call.
    if unsafe { libc::ioctl(fd, libc::SIOCETHTOOL, &mut ifr) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(ev.data)
}

/// Whether hardware receive offload (GRO or LRO) is active on `ifname`.
/// Offloaded super-frames can exceed the ring slot size.
pub fn iface_offloading(ifname: &str) -> io::Result<bool> {
    // SAFETY: plain socket(2); the result is checked and wrapped.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly opened, valid descriptor.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let gro = ethtool_value(sock.as_raw_fd(), ifname, ETHTOOL_GGRO).unwrap_or(0) != 0;
    let lro = ethtool_value(sock.as_raw_fd(), ifname, ETHTOOL_GFLAGS)
        .map(|flags| flags & ETH_FLAG_LRO != 0)
        .unwrap_or(false);

    Ok(gro || lro)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testutil::FakeFabric;

    #[test]
    fn open_existing_returns_same_handle_and_bumps_refcount() {
        let registry = DeviceRegistry::new();
        let fabric = FakeFabric::new(2, 8, 2048);
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());

        let again = registry.open("fake0", false, true).unwrap();
        assert!(Arc::ptr_eq(&dev, &again));
        assert_eq!(dev.ref_count(), 2);

        // Open-then-release leaves the registry unchanged.
        registry.release(&again).unwrap();
        assert_eq!(dev.ref_count(), 1);
        assert!(registry.contains("fake0"));
    }

    #[test]
    fn release_last_reference_unregisters() {
        let registry = DeviceRegistry::new();
        let fabric = FakeFabric::new(1, 8, 2048);
        let dev = fabric.device("fake0");
        registry.insert_for_test(dev.clone());

        registry.release(&dev).unwrap();
        assert!(!registry.contains("fake0"));
        assert_eq!(dev.ref_count(), 0);
    }

    #[test]
    fn release_unknown_device_reports_not_found() {
        let registry = DeviceRegistry::new();
        let known = FakeFabric::new(1, 8, 2048);
        let dev = known.device("fake0");
        registry.insert_for_test(dev.clone());

        let foreign_fabric = FakeFabric::new(1, 8, 2048);
        let foreign = foreign_fabric.device("fake1");
        match registry.release(&foreign) {
            Err(CaptureError::UnknownDevice(name)) => assert_eq!(name, "fake1"),
            other => panic!("expected UnknownDevice, got {other:?}"),
        }

        // Registered state is untouched.
        assert!(registry.contains("fake0"));
        assert_eq!(dev.ref_count(), 1);
    }

    #[test]
    fn release_same_name_different_handle_reports_not_found() {
        let registry = DeviceRegistry::new();
        let fabric_a = FakeFabric::new(1, 8, 2048);
        let fabric_b = FakeFabric::new(1, 8, 2048);
        registry.insert_for_test(fabric_a.device("fake0"));
        let impostor = fabric_b.device("fake0");

        assert!(matches!(
            registry.release(&impostor),
            Err(CaptureError::UnknownDevice(_))
        ));
        assert!(registry.contains("fake0"));
    }

    #[test]
    fn worker_claims_are_unique_and_monotonic() {
        let fabric = FakeFabric::new(4, 8, 2048);
        let dev = fabric.device("fake0");
        assert_eq!(dev.claim_worker(), 0);
        assert_eq!(dev.claim_worker(), 1);
        assert_eq!(dev.claim_worker(), 2);
    }
}
