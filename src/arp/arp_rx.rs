use std::sync::Arc;

use log::debug;
use pnet::packet::arp::{ArpHardwareTypes, ArpOperations, ArpPacket};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::Packet;

use super::{arp_tx, ArpCache};
use crate::pkb::{MacType, PacketBuffer};
use crate::{RxError, RxResult};

/// Receiver and validator of ARP packets. Valid packets update the
/// shared [`ArpCache`]; requests for one of our addresses are
/// answered.
pub struct ArpRx {
    cache: Arc<ArpCache>,
}

impl ArpRx {
    pub fn new(cache: Arc<ArpCache>) -> ArpRx {
        ArpRx { cache }
    }

    pub fn recv(&self, pkb: PacketBuffer) -> RxResult {
        if pkb.mac_type == MacType::Otherhost {
            return Err(RxError::Otherhost);
        }
        let eth_pkg = EthernetPacket::new(&pkb.data).ok_or(RxError::InvalidLength)?;
        let arp_pkg = ArpPacket::new(eth_pkg.payload()).ok_or(RxError::InvalidLength)?;

        // A sender lying about its hardware address does not get into
        // the cache.
        if eth_pkg.get_source() != arp_pkg.get_sender_hw_addr() {
            return Err(RxError::InvalidContent);
        }
        if arp_pkg.get_hardware_type() != ArpHardwareTypes::Ethernet
            || arp_pkg.get_protocol_type() != EtherTypes::Ipv4
            || arp_pkg.get_hw_addr_len() != 6
            || arp_pkg.get_proto_addr_len() != 4
        {
            return Err(RxError::InvalidContent);
        }
        let operation = arp_pkg.get_operation();
        if operation != ArpOperations::Request && operation != ArpOperations::Reply {
            return Err(RxError::InvalidContent);
        }

        let target_mac = arp_pkg.get_target_hw_addr();
        // Requests legitimately target ff:ff:ff:ff:ff:ff; any other
        // group address is bogus.
        if target_mac.is_multicast() && !target_mac.is_broadcast() {
            debug!("arp: target MAC {} is multicast", target_mac);
            return Ok(());
        }

        let indev = pkb.indev.as_ref().ok_or(RxError::InvalidContent)?;
        if indev.ip() != Some(arp_pkg.get_target_proto_addr()) {
            debug!(
                "arp: target {} is not {}",
                arp_pkg.get_target_proto_addr(),
                indev.name()
            );
            return Ok(());
        }

        let sender_ip = arp_pkg.get_sender_proto_addr();
        let sender_mac = arp_pkg.get_sender_hw_addr();
        debug!("arp: {} is at {}", sender_ip, sender_mac);
        self.cache.learn(
            indev,
            arp_pkg.get_protocol_type(),
            sender_ip,
            sender_mac,
            operation == ArpOperations::Request,
        );

        if operation == ArpOperations::Request {
            arp_tx::send_reply(indev, sender_mac, sender_ip);
        }
        Ok(())
    }
}
