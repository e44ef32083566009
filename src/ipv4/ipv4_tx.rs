use std::sync::Arc;

use log::{debug, warn};
use pnet::packet::ethernet::MutableEthernetPacket;
use pnet::packet::ipv4::{checksum, Ipv4Packet, MutableIpv4Packet};

use super::{MORE_FRAGMENTS, NO_FLAGS};
use crate::arp::{ArpCache, Resolution};
use crate::device::{NetDevice, ETHERNET_HEADER_LEN};
use crate::pkb::PacketBuffer;
use crate::routing::{RouteFlags, RoutingTable};
use crate::{RxError, RxResult};

/// The IPv4 send path: route resolution, fragmentation when the
/// packet exceeds the egress MTU, and the link step (loopback
/// short-circuit or ARP resolution).
#[derive(Clone)]
pub struct Ipv4Tx {
    routes: Arc<RoutingTable>,
    arp: Arc<ArpCache>,
}

impl Ipv4Tx {
    pub fn new(routes: Arc<RoutingTable>, arp: Arc<ArpCache>) -> Ipv4Tx {
        Ipv4Tx { routes, arp }
    }

    pub fn routes(&self) -> &Arc<RoutingTable> {
        &self.routes
    }

    /// Sends a fully formed IP packet (Ethernet header present but
    /// not yet addressed). Looks the route up unless the caller
    /// already attached one.
    pub fn send(&self, mut pkb: PacketBuffer) -> RxResult {
        if pkb.rtdst.is_none() {
            self.routes.route_output(&mut pkb)?;
        }
        let entry = pkb.rtdst.clone().unwrap();
        let total_len = {
            let ip_pkg = Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..])
                .ok_or(RxError::InvalidLength)?;
            ip_pkg.get_total_length() as usize
        };
        let dev = entry.dev.clone();
        if total_len < dev.mtu() {
            self.send_to_dev(&dev, pkb)
        } else {
            self.send_fragments(&dev, pkb)
        }
    }

    /// Chops the packet into MTU-sized fragments and sends each.
    pub fn send_fragments(&self, dev: &Arc<NetDevice>, pkb: PacketBuffer) -> RxResult {
        debug!("ipv4: fragmenting {} byte frame for {}", pkb.data.len(), dev.name());
        let fragments = split_fragments(&pkb.data, dev.mtu());
        if fragments.is_empty() {
            return Err(RxError::InvalidContent);
        }
        for data in fragments {
            let frag_pkb = PacketBuffer {
                data,
                indev: pkb.indev.clone(),
                protocol: pkb.protocol,
                mac_type: pkb.mac_type,
                rtdst: pkb.rtdst.clone(),
            };
            self.send_to_dev(dev, frag_pkb)?;
        }
        Ok(())
    }

    /// The link step. A loopback route swaps both MACs for the
    /// device's own and transmits; anything else needs the next-hop
    /// MAC from the ARP cache, or parks the frame behind a request.
    pub fn send_to_dev(&self, dev: &Arc<NetDevice>, mut pkb: PacketBuffer) -> RxResult {
        let entry = pkb.rtdst.clone().ok_or(RxError::NoRoute)?;
        if entry.flags == RouteFlags::Localhost {
            let mac = dev.mac();
            stamp_macs(&mut pkb, mac, mac);
            if let Err(e) = dev.send(pkb) {
                warn!("ipv4: loopback send failed: {}", e);
            }
            return Ok(());
        }

        let dst = {
            let ip_pkg = Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..])
                .ok_or(RxError::InvalidLength)?;
            ip_pkg.get_destination()
        };
        let next_hop = entry.next_hop(dst);
        match self.arp.resolve_output(dev, next_hop, pkb) {
            Resolution::Send(mut pkb, mac) => {
                stamp_macs(&mut pkb, mac, dev.mac());
                if let Err(e) = dev.send(pkb) {
                    warn!("ipv4: send on {} failed: {}", dev.name(), e);
                }
                Ok(())
            }
            Resolution::Queued => {
                debug!("ipv4: frame for {} parked on arp resolution", next_hop);
                Ok(())
            }
        }
    }
}

fn stamp_macs(pkb: &mut PacketBuffer, dst: pnet::util::MacAddr, src: pnet::util::MacAddr) {
    if let Some(mut eth_pkg) = MutableEthernetPacket::new(&mut pkb.data) {
        eth_pkg.set_destination(dst);
        eth_pkg.set_source(src);
    }
}

/// Splits one frame into fragments fitting `mtu`. The per-fragment
/// data budget is `(mtu - header_len) & !7` so offsets stay 8-byte
/// aligned; every fragment carries a copy of the original header
/// with its own offset, length and more-fragments flag.
pub(crate) fn split_fragments(frame: &[u8], mtu: usize) -> Vec<Vec<u8>> {
    let Some(ip_pkg) = Ipv4Packet::new(&frame[ETHERNET_HEADER_LEN..]) else {
        return Vec::new();
    };
    let hlen = usize::from(ip_pkg.get_header_length()) * 4;
    let total_len = ip_pkg.get_total_length() as usize;
    let base_offset = usize::from(ip_pkg.get_fragment_offset()) * 8;
    let data_len = total_len - hlen;
    let max_len = (mtu - hlen) & !7;
    if max_len == 0 {
        return Vec::new();
    }

    let mut fragments = Vec::new();
    let mut offset = 0;
    loop {
        let remaining = data_len - offset;
        let chunk = remaining.min(max_len);
        let more_frag = remaining > max_len;
        let mut data =
            Vec::with_capacity(ETHERNET_HEADER_LEN + hlen + chunk);
        data.extend_from_slice(&frame[..ETHERNET_HEADER_LEN + hlen]);
        let start = ETHERNET_HEADER_LEN + hlen + offset;
        data.extend_from_slice(&frame[start..start + chunk]);
        {
            let mut frag_pkg = MutableIpv4Packet::new(&mut data[ETHERNET_HEADER_LEN..]).unwrap();
            frag_pkg.set_total_length((hlen + chunk) as u16);
            frag_pkg.set_fragment_offset(((base_offset + offset) / 8) as u16);
            frag_pkg.set_flags(if more_frag { MORE_FRAGMENTS } else { NO_FLAGS });
            let csum = checksum(&frag_pkg.to_immutable());
            frag_pkg.set_checksum(csum);
        }
        fragments.push(data);
        offset += chunk;
        if !more_frag {
            break;
        }
    }
    fragments
}
