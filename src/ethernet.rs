//! Ethernet framing: parsing and classifying received frames, and
//! building frames for the send paths above.

use log::{trace, warn};
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::MutablePacket;
use pnet::util::MacAddr;

use crate::arp::ArpRx;
use crate::ipv4::Ipv4Rx;
use crate::pkb::{MacType, PacketBuffer};
use crate::RxError;

pub use crate::device::ETHERNET_HEADER_LEN;

/// Builds a frame around `payload`.
pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; ETHERNET_HEADER_LEN + payload.len()];
    {
        let mut eth_pkg = MutableEthernetPacket::new(&mut buffer).unwrap();
        eth_pkg.set_destination(dst);
        eth_pkg.set_source(src);
        eth_pkg.set_ethertype(ethertype);
        eth_pkg.payload_mut().copy_from_slice(payload);
    }
    buffer
}

/// Receiver and demultiplexer for frames coming off the receive
/// queue. Classifies the destination, tags the protocol and hands the
/// frame to ARP or IPv4; every other EtherType is dropped silently.
pub struct EthernetRx {
    arp: ArpRx,
    ipv4: Ipv4Rx,
}

impl EthernetRx {
    pub fn new(arp: ArpRx, ipv4: Ipv4Rx) -> EthernetRx {
        EthernetRx { arp, ipv4 }
    }

    pub fn recv(&self, mut pkb: PacketBuffer) {
        let ethertype = match Self::classify(&mut pkb) {
            Ok(ethertype) => ethertype,
            Err(e) => {
                warn!("ethernet: dropped frame: {}", e);
                return;
            }
        };
        let result = match ethertype {
            EtherTypes::Ipv4 => self.ipv4.recv(pkb),
            EtherTypes::Arp => self.arp.recv(pkb),
            other => {
                trace!("ethernet: ignoring EtherType {}", other);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("{}: dropped packet: {}", ethertype, e);
        }
    }

    /// Parses the 14-byte header, records the link classification of
    /// the destination address relative to the ingress device and the
    /// EtherType carried.
    fn classify(pkb: &mut PacketBuffer) -> Result<EtherType, RxError> {
        let eth_pkg = EthernetPacket::new(&pkb.data).ok_or(RxError::InvalidLength)?;
        let dst = eth_pkg.get_destination();
        pkb.mac_type = if dst.is_broadcast() {
            MacType::Broadcast
        } else if dst.is_multicast() {
            MacType::Multicast
        } else if pkb.indev.as_ref().map(|dev| dev.mac()) == Some(dst) {
            MacType::Localhost
        } else {
            MacType::Otherhost
        };
        let ethertype = eth_pkg.get_ethertype();
        pkb.protocol = Some(ethertype);
        Ok(ethertype)
    }
}
