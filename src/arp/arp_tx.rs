use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, warn};
use pnet::packet::arp::{ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket};
use pnet::packet::ethernet::EtherTypes;
use pnet::util::MacAddr;

use crate::device::NetDevice;
use crate::ethernet::build_frame;
use crate::pkb::PacketBuffer;

fn build_arp(
    operation: ArpOperation,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut buffer = vec![0u8; ArpPacket::minimum_packet_size()];
    {
        let mut arp_pkg = MutableArpPacket::new(&mut buffer).unwrap();
        arp_pkg.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp_pkg.set_protocol_type(EtherTypes::Ipv4);
        arp_pkg.set_hw_addr_len(6);
        arp_pkg.set_proto_addr_len(4);
        arp_pkg.set_operation(operation);
        arp_pkg.set_sender_hw_addr(sender_mac);
        arp_pkg.set_sender_proto_addr(sender_ip);
        arp_pkg.set_target_hw_addr(target_mac);
        arp_pkg.set_target_proto_addr(target_ip);
    }
    buffer
}

/// Broadcasts a who-has request for `target_ip` out of `dev`.
pub fn send_request(dev: &Arc<NetDevice>, target_ip: Ipv4Addr) {
    let Some(sender_ip) = dev.ip() else {
        warn!("arp: {} has no address, cannot request", dev.name());
        return;
    };
    debug!("arp: requesting {} on {}", target_ip, dev.name());
    let arp = build_arp(
        ArpOperations::Request,
        dev.mac(),
        sender_ip,
        MacAddr::broadcast(),
        target_ip,
    );
    let frame = build_frame(MacAddr::broadcast(), dev.mac(), EtherTypes::Arp, &arp);
    if let Err(e) = dev.send(PacketBuffer::new(frame)) {
        warn!("arp: request on {} failed: {}", dev.name(), e);
    }
}

/// Answers a request: we are `dev.ip()` at `dev.mac()`.
pub fn send_reply(dev: &Arc<NetDevice>, target_mac: MacAddr, target_ip: Ipv4Addr) {
    let Some(sender_ip) = dev.ip() else {
        warn!("arp: {} has no address, cannot reply", dev.name());
        return;
    };
    debug!("arp: replying to {} on {}", target_ip, dev.name());
    let arp = build_arp(
        ArpOperations::Reply,
        dev.mac(),
        sender_ip,
        target_mac,
        target_ip,
    );
    let frame = build_frame(target_mac, dev.mac(), EtherTypes::Arp, &arp);
    if let Err(e) = dev.send(PacketBuffer::new(frame)) {
        warn!("arp: reply on {} failed: {}", dev.name(), e);
    }
}
