use std::sync::Arc;

use pnet::packet::ethernet::EtherType;

use crate::device::NetDevice;
use crate::routing::RouteEntry;

/// Classification of the destination MAC of a received frame,
/// relative to the device it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacType {
    None,
    Localhost,
    Otherhost,
    Multicast,
    Broadcast,
}

/// One frame moving through the stack: the raw bytes plus the
/// metadata the pipeline accumulates. Created by a device on ingress
/// or by a protocol layer on egress, dropped once delivered or
/// transmitted.
///
/// `data` always holds a full Ethernet frame; layers edit headers in
/// place through pnet's mutable packet views.
pub struct PacketBuffer {
    pub data: Vec<u8>,
    pub indev: Option<Arc<NetDevice>>,
    pub protocol: Option<EtherType>,
    pub mac_type: MacType,
    pub rtdst: Option<Arc<RouteEntry>>,
}

impl PacketBuffer {
    pub fn new(data: Vec<u8>) -> PacketBuffer {
        PacketBuffer {
            data,
            indev: None,
            protocol: None,
            mac_type: MacType::None,
            rtdst: None,
        }
    }

    pub fn with_indev(data: Vec<u8>, indev: Arc<NetDevice>) -> PacketBuffer {
        PacketBuffer {
            data,
            indev: Some(indev),
            protocol: None,
            mac_type: MacType::None,
            rtdst: None,
        }
    }
}
