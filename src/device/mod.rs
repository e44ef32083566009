//! Link-level devices and the manager that owns them.
//!
//! A [`NetDevice`] is one attachment point for the stack: the
//! loopback device, a TAP-backed virtual Ethernet device, or a
//! channel-backed device used by tests and benchmarks. The
//! [`DeviceManager`] owns the device set, enforces the uniqueness
//! invariants across it and funnels every received frame into the
//! stack's bounded receive queue.

use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;

use ipnetwork::Ipv4Network;
use log::{debug, warn};
use pnet::util::MacAddr;
use rand::Rng;

use crate::pkb::PacketBuffer;

mod tap;

pub use self::tap::TapFd;

pub const DEFAULT_MTU: usize = 1500;
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Random unicast MAC with the `00:0c:29` OUI.
pub fn random_mac() -> MacAddr {
    let tail: [u8; 3] = rand::thread_rng().gen();
    MacAddr::new(0x00, 0x0c, 0x29, tail[0], tail[1], tail[2])
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

enum DeviceKind {
    /// Echoes every sent frame back into the receive queue.
    Loopback,
    /// Raw frames through a TAP file descriptor.
    Tap(TapFd),
    /// Hands every sent frame to an `mpsc` receiver. Frames travel
    /// the other way through [`DeviceManager::inject`].
    Channel(Mutex<mpsc::Sender<Vec<u8>>>),
}

pub struct NetDevice {
    name: String,
    mtu: usize,
    hwaddr: Mutex<MacAddr>,
    addr: Mutex<Option<Ipv4Network>>,
    stats: Mutex<DeviceStats>,
    closed: AtomicBool,
    kind: DeviceKind,
    queue: SyncSender<PacketBuffer>,
}

impl NetDevice {
    fn new(
        name: &str,
        mac: MacAddr,
        addr: Option<Ipv4Network>,
        kind: DeviceKind,
        queue: SyncSender<PacketBuffer>,
    ) -> NetDevice {
        NetDevice {
            name: name.to_owned(),
            mtu: DEFAULT_MTU,
            hwaddr: Mutex::new(mac),
            addr: Mutex::new(addr),
            stats: Mutex::new(DeviceStats::default()),
            closed: AtomicBool::new(false),
            kind,
            queue,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn mac(&self) -> MacAddr {
        *self.hwaddr.lock().unwrap()
    }

    pub fn addr(&self) -> Option<Ipv4Network> {
        *self.addr.lock().unwrap()
    }

    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.addr().map(|net| net.ip())
    }

    pub fn stats(&self) -> DeviceStats {
        *self.stats.lock().unwrap()
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.kind, DeviceKind::Loopback)
    }

    /// Transmits one frame. On the loopback device this re-enqueues
    /// the frame on the receive queue.
    pub fn send(self: &Arc<Self>, mut pkb: PacketBuffer) -> io::Result<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device is down"));
        }
        let len = pkb.data.len();
        let result = match &self.kind {
            DeviceKind::Loopback => {
                pkb.indev = Some(self.clone());
                self.enqueue(pkb);
                Ok(len)
            }
            DeviceKind::Tap(tap) => tap.write(&pkb.data),
            DeviceKind::Channel(tx) => tx
                .lock()
                .unwrap()
                .send(pkb.data)
                .map(|_| len)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame sink closed")),
        };
        let mut stats = self.stats.lock().unwrap();
        match &result {
            Ok(n) => {
                stats.tx_packets += 1;
                stats.tx_bytes += *n as u64;
            }
            Err(_) => stats.tx_errors += 1,
        }
        result
    }

    /// Reads one frame from a ready TAP descriptor and enqueues it.
    pub fn recv(self: &Arc<Self>) {
        let DeviceKind::Tap(tap) = &self.kind else {
            return;
        };
        match tap.read(self.mtu + ETHERNET_HEADER_LEN) {
            Ok(data) => {
                {
                    let mut stats = self.stats.lock().unwrap();
                    stats.rx_packets += 1;
                    stats.rx_bytes += data.len() as u64;
                }
                let pkb = PacketBuffer::with_indev(data, self.clone());
                self.enqueue(pkb);
            }
            Err(e) => {
                self.stats.lock().unwrap().rx_errors += 1;
                warn!("{}: recv failed: {}", self.name, e);
            }
        }
    }

    /// Marks the device down; subsequent sends fail. The TAP
    /// descriptor itself is released when the device is dropped.
    pub fn exit(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    fn enqueue(&self, pkb: PacketBuffer) {
        match self.queue.try_send(pkb) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.stats.lock().unwrap().rx_errors += 1;
                warn!("{}: receive queue full, frame dropped", self.name);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn tap_fd(&self) -> Option<std::os::unix::io::RawFd> {
        match &self.kind {
            DeviceKind::Tap(tap) => Some(tap.fd()),
            _ => None,
        }
    }
}

/// Capacity of the stack-wide receive queue shared by all devices.
pub const RECV_QUEUE_CAP: usize = 8192;

/// Owns the loopback device and every registered virtual Ethernet
/// device. Invariants across the set: unique names, unique MACs,
/// non-overlapping veth subnets.
pub struct DeviceManager {
    loopback: Arc<NetDevice>,
    veths: Mutex<Vec<Arc<NetDevice>>>,
    queue: SyncSender<PacketBuffer>,
    running: Arc<AtomicBool>,
}

impl DeviceManager {
    pub fn new(queue: SyncSender<PacketBuffer>) -> DeviceManager {
        let loopback_net = Ipv4Network::new(Ipv4Addr::new(127, 0, 0, 1), 8).unwrap();
        let loopback = Arc::new(NetDevice::new(
            "lo",
            random_mac(),
            Some(loopback_net),
            DeviceKind::Loopback,
            queue.clone(),
        ));
        DeviceManager {
            loopback,
            veths: Mutex::new(Vec::new()),
            queue,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn loopback(&self) -> &Arc<NetDevice> {
        &self.loopback
    }

    pub fn devices(&self) -> Vec<Arc<NetDevice>> {
        self.veths.lock().unwrap().clone()
    }

    /// Opens a TAP device, configures the kernel side of it when
    /// `peer` is given, brings it up, and registers it with a random
    /// MAC and `addr` as the stack-side address.
    pub fn add_tap(
        &self,
        name: &str,
        addr: Ipv4Network,
        peer: Option<Ipv4Network>,
    ) -> io::Result<Arc<NetDevice>> {
        let tap = TapFd::open(name)?;
        if let Some(peer) = peer {
            tap.set_ip(peer.ip())?;
            tap.set_netmask(peer.prefix())?;
        }
        tap.up()?;
        let dev = Arc::new(NetDevice::new(
            name,
            random_mac(),
            Some(addr),
            DeviceKind::Tap(tap),
            self.queue.clone(),
        ));
        self.register(dev)
    }

    /// Registers a channel-backed device: sent frames appear on the
    /// returned receiver, frames are fed in with [`inject`].
    ///
    /// [`inject`]: DeviceManager::inject
    pub fn add_channel(
        &self,
        name: &str,
        mac: MacAddr,
        addr: Ipv4Network,
    ) -> io::Result<(Arc<NetDevice>, Receiver<Vec<u8>>)> {
        let (tx, rx) = mpsc::channel();
        let dev = Arc::new(NetDevice::new(
            name,
            mac,
            Some(addr),
            DeviceKind::Channel(Mutex::new(tx)),
            self.queue.clone(),
        ));
        self.register(dev).map(|dev| (dev, rx))
    }

    fn register(&self, dev: Arc<NetDevice>) -> io::Result<Arc<NetDevice>> {
        let mut veths = self.veths.lock().unwrap();
        if dev.name() == self.loopback.name() || veths.iter().any(|d| d.name() == dev.name()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("device name {} already in use", dev.name()),
            ));
        }
        if dev.mac() == self.loopback.mac() || veths.iter().any(|d| d.mac() == dev.mac()) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("hardware address {} already in use", dev.mac()),
            ));
        }
        if let Some(net) = dev.addr() {
            for other in veths.iter() {
                if let Some(other_net) = other.addr() {
                    if other_net.contains(net.ip()) || net.contains(other_net.ip()) {
                        return Err(io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("subnet of {} overlaps {}", dev.name(), other.name()),
                        ));
                    }
                }
            }
        }
        veths.push(dev.clone());
        debug!("registered device {} ({})", dev.name(), dev.mac());
        Ok(dev)
    }

    /// Rebinds a device's MAC, rejecting one already in use.
    pub fn change_mac(&self, dev: &Arc<NetDevice>, mac: MacAddr) -> io::Result<()> {
        let veths = self.veths.lock().unwrap();
        let in_use = mac == self.loopback.mac()
            || veths
                .iter()
                .any(|d| !Arc::ptr_eq(d, dev) && d.mac() == mac);
        if in_use {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "hardware address already in use",
            ));
        }
        *dev.hwaddr.lock().unwrap() = mac;
        Ok(())
    }

    /// Rebinds a device's stack-side address, rejecting a subnet that
    /// overlaps another device. Route replacement is the caller's
    /// responsibility (the stack owns the route table).
    pub fn change_ip(&self, dev: &Arc<NetDevice>, addr: Ipv4Network) -> io::Result<()> {
        let veths = self.veths.lock().unwrap();
        for other in veths.iter() {
            if Arc::ptr_eq(other, dev) {
                continue;
            }
            if let Some(other_net) = other.addr() {
                if other_net.contains(addr.ip()) || addr.contains(other_net.ip()) {
                    return Err(io::Error::new(io::ErrorKind::AddrInUse, "subnet overlap"));
                }
            }
        }
        *dev.addr.lock().unwrap() = Some(addr);
        Ok(())
    }

    /// Does this stack own `ip`? `0.0.0.0`, anything in the loopback
    /// subnet, and every veth address are local.
    pub fn local_ip_addr(&self, ip: Ipv4Addr) -> bool {
        if ip == Ipv4Addr::UNSPECIFIED {
            return true;
        }
        if let Some(net) = self.loopback.addr() {
            if net.contains(ip) {
                return true;
            }
        }
        self.veths
            .lock()
            .unwrap()
            .iter()
            .any(|dev| dev.ip() == Some(ip))
    }

    /// Feeds a raw frame into the receive queue as if `dev` had read
    /// it off the wire.
    pub fn inject(&self, dev: &Arc<NetDevice>, frame: Vec<u8>) {
        {
            let mut stats = dev.stats.lock().unwrap();
            stats.rx_packets += 1;
            stats.rx_bytes += frame.len() as u64;
        }
        dev.enqueue(PacketBuffer::with_indev(frame, dev.clone()));
    }

    /// Multiplexes every TAP descriptor and drains whichever is
    /// readable. Runs until the manager is dropped.
    pub fn spawn_poll_thread(self: &Arc<Self>) {
        let manager = self.clone();
        let running = self.running.clone();
        thread::spawn(move || {
            while running.load(Ordering::Relaxed) {
                let taps: Vec<Arc<NetDevice>> = manager
                    .veths
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|dev| dev.tap_fd().is_some())
                    .cloned()
                    .collect();
                if taps.is_empty() {
                    thread::sleep(std::time::Duration::from_millis(200));
                    continue;
                }
                let mut fds: Vec<libc::pollfd> = taps
                    .iter()
                    .map(|dev| libc::pollfd {
                        fd: dev.tap_fd().unwrap(),
                        events: libc::POLLIN,
                        revents: 0,
                    })
                    .collect();
                let n = unsafe {
                    libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 200)
                };
                if n <= 0 {
                    continue;
                }
                for (fd, dev) in fds.iter().zip(&taps) {
                    if fd.revents & libc::POLLIN != 0 {
                        dev.recv();
                    }
                }
            }
        });
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
