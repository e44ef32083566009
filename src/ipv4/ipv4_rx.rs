use std::sync::Arc;

use log::{debug, warn};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{checksum, Ipv4Packet, MutableIpv4Packet};

use super::{FragCache, Ipv4Tx, DONT_FRAGMENT, IPV4_HEADER_LEN, MORE_FRAGMENTS};
use crate::device::ETHERNET_HEADER_LEN;
use crate::icmp::IcmpRx;
use crate::pkb::{MacType, PacketBuffer};
use crate::routing::{RouteFlags, RoutingTable};
use crate::tcp::Tcp;
use crate::{RxError, RxResult};

/// IPv4 receive: validation, then local delivery (with reassembly)
/// or forwarding.
pub struct Ipv4Rx {
    routes: Arc<RoutingTable>,
    frags: Arc<FragCache>,
    icmp: IcmpRx,
    tcp: Arc<Tcp>,
    tx: Ipv4Tx,
}

impl Ipv4Rx {
    pub fn new(
        routes: Arc<RoutingTable>,
        frags: Arc<FragCache>,
        icmp: IcmpRx,
        tcp: Arc<Tcp>,
        tx: Ipv4Tx,
    ) -> Ipv4Rx {
        Ipv4Rx {
            routes,
            frags,
            icmp,
            tcp,
            tx,
        }
    }

    pub fn recv(&self, mut pkb: PacketBuffer) -> RxResult {
        if pkb.mac_type == MacType::Otherhost {
            return Err(RxError::Otherhost);
        }
        if pkb.data.len() < ETHERNET_HEADER_LEN + IPV4_HEADER_LEN {
            return Err(RxError::InvalidLength);
        }
        {
            let ip_pkg = Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..])
                .ok_or(RxError::InvalidLength)?;
            let hdr_len = usize::from(ip_pkg.get_header_length()) * 4;
            if hdr_len < IPV4_HEADER_LEN {
                return Err(RxError::InvalidLength);
            }
            if ip_pkg.get_checksum() != checksum(&ip_pkg) {
                return Err(RxError::InvalidChecksum);
            }
            let total_len = ip_pkg.get_total_length() as usize;
            if total_len < hdr_len {
                return Err(RxError::InvalidLength);
            }
            // Exactly the advertised length: short frames are
            // truncated, over-long ones are not trusted either.
            if pkb.data.len() != ETHERNET_HEADER_LEN + total_len {
                return Err(RxError::InvalidLength);
            }
        }
        self.routes.route_input(&mut pkb)?;
        let entry = pkb.rtdst.clone().unwrap();
        if entry.flags == RouteFlags::Localhost {
            self.local_deliver(pkb)
        } else {
            self.forward(pkb)
        }
    }

    fn local_deliver(&self, mut pkb: PacketBuffer) -> RxResult {
        let (is_fragment, dont_frag) = {
            let ip_pkg = Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..]).unwrap();
            (
                ip_pkg.get_fragment_offset() != 0 || ip_pkg.get_flags() & MORE_FRAGMENTS != 0,
                ip_pkg.get_flags() & DONT_FRAGMENT != 0,
            )
        };
        if is_fragment {
            if dont_frag {
                return Err(RxError::InvalidContent);
            }
            match self.frags.reassemble(pkb)? {
                Some(reassembled) => pkb = reassembled,
                None => return Ok(()),
            }
            debug!("ipv4: reassembly complete");
        }

        let ip_pkg =
            Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..]).ok_or(RxError::InvalidLength)?;
        if ip_pkg.get_checksum() != checksum(&ip_pkg) {
            return Err(RxError::InvalidChecksum);
        }
        let proto = ip_pkg.get_next_level_protocol();
        drop(ip_pkg);
        match proto {
            IpNextHeaderProtocols::Icmp => self.icmp.recv(pkb),
            IpNextHeaderProtocols::Tcp => self.tcp.recv(pkb),
            IpNextHeaderProtocols::Udp => {
                // Placeholder until a UDP layer exists.
                debug!("ipv4: udp datagram dropped");
                Ok(())
            }
            other => {
                warn!("ipv4: unhandled protocol {}", other);
                Ok(())
            }
        }
    }

    fn forward(&self, mut pkb: PacketBuffer) -> RxResult {
        let entry = pkb.rtdst.clone().unwrap();
        let (src, dst, ttl, total_len, dont_frag) = {
            let ip_pkg = Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..]).unwrap();
            (
                ip_pkg.get_source(),
                ip_pkg.get_destination(),
                ip_pkg.get_ttl(),
                ip_pkg.get_total_length() as usize,
                ip_pkg.get_flags() & DONT_FRAGMENT != 0,
            )
        };
        if ttl <= 1 {
            // TODO: emit an ICMP time-exceeded back to the source
            return Err(RxError::TtlExpired);
        }
        {
            let mut ip_pkg =
                MutableIpv4Packet::new(&mut pkb.data[ETHERNET_HEADER_LEN..]).unwrap();
            ip_pkg.set_ttl(ttl - 1);
            let csum = checksum(&ip_pkg.to_immutable());
            ip_pkg.set_checksum(csum);
        }

        let next_hop = entry.next_hop(dst);
        let same_dev = pkb
            .indev
            .as_ref()
            .map(|indev| Arc::ptr_eq(indev, &entry.dev))
            .unwrap_or(false);
        if same_dev {
            // Going back out the interface it came in on: if the
            // sender could have reached the next hop directly, it
            // should be told to.
            if let Some(src_route) = self.routes.lookup(src) {
                if src_route.metric == 0
                    && src_route.net.contains(src)
                    && src_route.net.contains(next_hop)
                {
                    // TODO: emit an ICMP redirect to the source host
                    debug!("ipv4: forward of {} -> {} wants a redirect", src, dst);
                }
            }
        }

        if total_len > entry.dev.mtu() {
            if dont_frag {
                // TODO: emit an ICMP fragmentation-needed
                debug!("ipv4: forward needs fragmentation but DF is set");
                return Err(RxError::FragmentationNeeded);
            }
            self.tx.send_fragments(&entry.dev.clone(), pkb)
        } else {
            self.tx.send_to_dev(&entry.dev.clone(), pkb)
        }
    }
}
