use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use ipnetwork::Ipv4Network;
use log::debug;
use pnet::packet::ipv4::MutableIpv4Packet;

use crate::device::{NetDevice, ETHERNET_HEADER_LEN};
use crate::pkb::PacketBuffer;
use crate::{RxError, RxResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFlags {
    None,
    Localhost,
    Default,
}

#[derive(Clone)]
pub struct RouteEntry {
    pub net: Ipv4Network,
    pub gateway: Option<Ipv4Addr>,
    pub flags: RouteFlags,
    pub metric: u32,
    pub dev: Arc<NetDevice>,
}

impl RouteEntry {
    /// The address the frame actually goes to on the wire: the
    /// gateway for default/metric routes, the destination itself on a
    /// directly connected subnet.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.flags == RouteFlags::Default || self.metric > 0 {
            self.gateway.unwrap_or(dst)
        } else {
            dst
        }
    }
}

/// Ordered route list. Lookup returns the first entry whose network
/// contains the queried address, in insertion order.
pub struct RoutingTable {
    entries: Mutex<Vec<Arc<RouteEntry>>>,
}

impl RoutingTable {
    /// A table seeded with the loopback subnet.
    pub fn new(loopback: &Arc<NetDevice>) -> RoutingTable {
        let table = RoutingTable {
            entries: Mutex::new(Vec::new()),
        };
        if let Some(net) = loopback.addr() {
            table.add_route(RouteEntry {
                net,
                gateway: None,
                flags: RouteFlags::Localhost,
                metric: 0,
                dev: loopback.clone(),
            });
        }
        table
    }

    pub fn add_route(&self, entry: RouteEntry) {
        self.entries.lock().unwrap().push(Arc::new(entry));
    }

    /// Registers the two routes a configured device brings with it:
    /// its own address as a `/32` delivered over loopback, and its
    /// subnet out the device.
    pub fn add_device_routes(&self, dev: &Arc<NetDevice>, loopback: &Arc<NetDevice>) {
        let Some(net) = dev.addr() else { return };
        self.add_route(RouteEntry {
            net: Ipv4Network::new(net.ip(), 32).unwrap(),
            gateway: None,
            flags: RouteFlags::Localhost,
            metric: 0,
            dev: loopback.clone(),
        });
        self.add_route(RouteEntry {
            net,
            gateway: None,
            flags: RouteFlags::None,
            metric: 0,
            dev: dev.clone(),
        });
    }

    /// Drops every route going over `dev` (used when its address
    /// changes).
    pub fn remove_device_routes(&self, dev: &Arc<NetDevice>, addr: Ipv4Network) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| {
            let host_route = entry.net.prefix() == 32 && entry.net.ip() == addr.ip();
            let subnet_route = Arc::ptr_eq(&entry.dev, dev) && entry.net == addr;
            !(host_route || subnet_route)
        });
    }

    pub fn lookup(&self, addr: Ipv4Addr) -> Option<Arc<RouteEntry>> {
        let entries = self.entries.lock().unwrap();
        entries.iter().find(|entry| entry.net.contains(addr)).cloned()
    }

    /// Attaches the route for the destination of a received packet.
    pub fn route_input(&self, pkb: &mut PacketBuffer) -> RxResult {
        let dst = ipv4_dst(pkb)?;
        match self.lookup(dst) {
            Some(entry) => {
                pkb.rtdst = Some(entry);
                Ok(())
            }
            // TODO: RFC 1812 wants an ICMP unreachable here
            None => Err(RxError::NoRoute),
        }
    }

    /// Attaches the route for an outgoing packet and fills in the
    /// source address from the egress device when the caller left it
    /// unspecified.
    pub fn route_output(&self, pkb: &mut PacketBuffer) -> RxResult {
        let dst = ipv4_dst(pkb)?;
        let entry = match self.lookup(dst) {
            Some(entry) => entry,
            None => {
                debug!("no route entry to {}", dst);
                return Err(RxError::NoRoute);
            }
        };
        let mut ip_pkg = MutableIpv4Packet::new(&mut pkb.data[ETHERNET_HEADER_LEN..])
            .ok_or(RxError::InvalidLength)?;
        if ip_pkg.get_source() == Ipv4Addr::UNSPECIFIED {
            if let Some(src) = entry.dev.ip() {
                ip_pkg.set_source(src);
                let csum = pnet::packet::ipv4::checksum(&ip_pkg.to_immutable());
                ip_pkg.set_checksum(csum);
            }
        }
        pkb.rtdst = Some(entry);
        Ok(())
    }
}

fn ipv4_dst(pkb: &PacketBuffer) -> Result<Ipv4Addr, RxError> {
    use pnet::packet::ipv4::Ipv4Packet;
    let ip_pkg = Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..]).ok_or(RxError::InvalidLength)?;
    Ok(ip_pkg.get_destination())
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            "{:<20}{:<20}{:<20}{:<10}{:<10}",
            "Destination", "Gateway", "Genmask", "Metric", "Iface"
        )?;
        for entry in self.entries.lock().unwrap().iter() {
            if entry.flags == RouteFlags::Localhost {
                continue;
            }
            let dst = if entry.flags == RouteFlags::Default {
                "default".to_owned()
            } else {
                entry.net.ip().to_string()
            };
            let gw = entry
                .gateway
                .map(|gw| gw.to_string())
                .unwrap_or_else(|| "*".to_owned());
            writeln!(
                fmt,
                "{:<20}{:<20}{:<20}{:<10}{:<10}",
                dst,
                gw,
                entry.net.mask(),
                entry.metric,
                entry.dev.name()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::device::DeviceManager;

    fn manager() -> Arc<DeviceManager> {
        let (tx, _) = mpsc::sync_channel(16);
        Arc::new(DeviceManager::new(tx))
    }

    fn dummy_dev(manager: &DeviceManager, name: &str, net: &str) -> Arc<NetDevice> {
        let (dev, _) = manager
            .add_channel(name, crate::device::random_mac(), net.parse().unwrap())
            .unwrap();
        dev
    }

    #[test]
    fn empty_table_has_only_loopback() {
        let manager = manager();
        let table = RoutingTable::new(manager.loopback());
        assert!(table.lookup(Ipv4Addr::new(10, 0, 0, 1)).is_none());
        let entry = table.lookup(Ipv4Addr::new(127, 0, 0, 1)).unwrap();
        assert_eq!(entry.flags, RouteFlags::Localhost);
    }

    #[test]
    fn device_routes_prefer_host_entry() {
        let manager = manager();
        let table = RoutingTable::new(manager.loopback());
        let dev = dummy_dev(&manager, "test0", "10.0.0.1/24");
        table.add_device_routes(&dev, manager.loopback());

        // The device's own address resolves to the /32 over loopback.
        let own = table.lookup(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert_eq!(own.flags, RouteFlags::Localhost);
        assert!(own.dev.is_loopback());

        // Neighbors resolve to the subnet entry out the device.
        let neighbor = table.lookup(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        assert_eq!(neighbor.flags, RouteFlags::None);
        assert_eq!(neighbor.dev.name(), "test0");
    }

    #[test]
    fn lookup_is_first_match_in_insertion_order() {
        let manager = manager();
        let table = RoutingTable::new(manager.loopback());
        let dev_a = dummy_dev(&manager, "a0", "10.0.0.1/24");
        let dev_b = dummy_dev(&manager, "b0", "172.16.0.1/24");
        table.add_route(RouteEntry {
            net: "10.0.0.0/24".parse().unwrap(),
            gateway: None,
            flags: RouteFlags::None,
            metric: 0,
            dev: dev_a.clone(),
        });
        // Inserted later, so never chosen despite also matching.
        table.add_route(RouteEntry {
            net: "10.0.0.0/16".parse().unwrap(),
            gateway: None,
            flags: RouteFlags::None,
            metric: 0,
            dev: dev_b,
        });
        let entry = table.lookup(Ipv4Addr::new(10, 0, 0, 7)).unwrap();
        assert!(Arc::ptr_eq(&entry.dev, &dev_a));
    }

    #[test]
    fn default_route_supplies_gateway_next_hop() {
        let manager = manager();
        let table = RoutingTable::new(manager.loopback());
        let dev = dummy_dev(&manager, "wan0", "192.168.1.2/24");
        let gw = Ipv4Addr::new(192, 168, 1, 1);
        table.add_route(RouteEntry {
            net: "0.0.0.0/0".parse().unwrap(),
            gateway: Some(gw),
            flags: RouteFlags::Default,
            metric: 0,
            dev,
        });
        let entry = table.lookup(Ipv4Addr::new(8, 8, 8, 8)).unwrap();
        assert_eq!(entry.next_hop(Ipv4Addr::new(8, 8, 8, 8)), gw);

        let direct = RouteEntry {
            net: "10.0.0.0/24".parse().unwrap(),
            gateway: None,
            flags: RouteFlags::None,
            metric: 0,
            dev: manager.loopback().clone(),
        };
        assert_eq!(
            direct.next_hop(Ipv4Addr::new(10, 0, 0, 9)),
            Ipv4Addr::new(10, 0, 0, 9)
        );
    }
}
