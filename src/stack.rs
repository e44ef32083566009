//! The composition root: one [`NetworkStack`] owns the device
//! manager, the tables, the pipeline worker and the timers.

use std::io;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use pnet::util::MacAddr;

use crate::arp::{ArpCache, ArpRx};
use crate::device::{DeviceManager, NetDevice, RECV_QUEUE_CAP};
use crate::ethernet::EthernetRx;
use crate::icmp::IcmpRx;
use crate::ipv4::{FragCache, Ipv4Rx, Ipv4Tx};
use crate::routing::RoutingTable;
use crate::tcp::{Tcp, TcpOut, TCP_TIMER_INTERVAL};
use crate::util::RepeatingTimer;

/// A running stack instance.
///
/// Construction wires the full pipeline and starts its threads: the
/// TAP poll loop, the worker draining the receive queue through
/// ethernet → (ARP | IPv4 → (ICMP | TCP)), and the three repeating
/// timers (ARP aging at 1 Hz, fragment aging at 1 Hz, TCP at 5 Hz).
/// Dropping the stack stops the timers and lets the threads wind
/// down.
pub struct NetworkStack {
    devices: Arc<DeviceManager>,
    routes: Arc<RoutingTable>,
    arp: Arc<ArpCache>,
    frags: Arc<FragCache>,
    tcp: Arc<Tcp>,
    _timers: Vec<RepeatingTimer>,
}

impl NetworkStack {
    pub fn new() -> NetworkStack {
        let (queue_tx, queue_rx) = mpsc::sync_channel(RECV_QUEUE_CAP);
        let devices = Arc::new(DeviceManager::new(queue_tx));
        let routes = Arc::new(RoutingTable::new(devices.loopback()));
        let arp = Arc::new(ArpCache::new());
        let frags = Arc::new(FragCache::new());

        let ipv4_tx = Ipv4Tx::new(routes.clone(), arp.clone());
        let tcp = Arc::new(Tcp::new(TcpOut::new(ipv4_tx.clone())));
        let icmp = IcmpRx::new(ipv4_tx.clone());
        let ipv4_rx = Ipv4Rx::new(routes.clone(), frags.clone(), icmp, tcp.clone(), ipv4_tx);
        let ethernet = EthernetRx::new(ArpRx::new(arp.clone()), ipv4_rx);

        thread::spawn(move || {
            while let Ok(pkb) = queue_rx.recv() {
                ethernet.recv(pkb);
            }
        });
        devices.spawn_poll_thread();

        let timers = vec![
            RepeatingTimer::spawn(Duration::from_secs(1), {
                let arp = Arc::downgrade(&arp);
                move || {
                    if let Some(arp) = arp.upgrade() {
                        arp.tick();
                    }
                }
            }),
            RepeatingTimer::spawn(Duration::from_secs(1), {
                let frags = Arc::downgrade(&frags);
                move || {
                    if let Some(frags) = frags.upgrade() {
                        frags.tick();
                    }
                }
            }),
            RepeatingTimer::spawn(TCP_TIMER_INTERVAL, {
                let tcp = Arc::downgrade(&tcp);
                move || {
                    if let Some(tcp) = tcp.upgrade() {
                        tcp.timers.tick(&tcp);
                    }
                }
            }),
        ];

        NetworkStack {
            devices,
            routes,
            arp,
            frags,
            tcp,
            _timers: timers,
        }
    }

    /// Attaches a TAP-backed device and installs its routes. `peer`
    /// configures the kernel side of the TAP interface.
    pub fn add_tap(
        &self,
        name: &str,
        addr: Ipv4Network,
        peer: Option<Ipv4Network>,
    ) -> io::Result<Arc<NetDevice>> {
        let dev = self.devices.add_tap(name, addr, peer)?;
        self.routes.add_device_routes(&dev, self.devices.loopback());
        Ok(dev)
    }

    /// Attaches a channel-backed device (frames out through the
    /// returned receiver, in through [`NetworkStack::inject`]) and
    /// installs its routes.
    pub fn add_channel_device(
        &self,
        name: &str,
        mac: MacAddr,
        addr: Ipv4Network,
    ) -> io::Result<(Arc<NetDevice>, Receiver<Vec<u8>>)> {
        let (dev, rx) = self.devices.add_channel(name, mac, addr)?;
        self.routes.add_device_routes(&dev, self.devices.loopback());
        Ok((dev, rx))
    }

    /// Feeds a raw frame into the pipeline as if `dev` received it.
    pub fn inject(&self, dev: &Arc<NetDevice>, frame: Vec<u8>) {
        self.devices.inject(dev, frame);
    }

    /// Rebinds a device's address and replaces its routes.
    pub fn change_device_ip(&self, dev: &Arc<NetDevice>, addr: Ipv4Network) -> io::Result<()> {
        let old = dev.addr();
        self.devices.change_ip(dev, addr)?;
        if let Some(old) = old {
            self.routes.remove_device_routes(dev, old);
        }
        self.routes.add_device_routes(dev, self.devices.loopback());
        Ok(())
    }

    pub fn change_device_mac(&self, dev: &Arc<NetDevice>, mac: MacAddr) -> io::Result<()> {
        self.devices.change_mac(dev, mac)
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    pub fn arp(&self) -> &Arc<ArpCache> {
        &self.arp
    }

    pub fn frags(&self) -> &Arc<FragCache> {
        &self.frags
    }

    pub fn tcp(&self) -> &Arc<Tcp> {
        &self.tcp
    }
}

impl Default for NetworkStack {
    fn default() -> Self {
        Self::new()
    }
}
