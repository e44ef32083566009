//! Helpers for driving a stack without TAP devices: a stack whose
//! only device is channel-backed, so tests inject raw frames and
//! read back whatever the stack transmits.

use std::net::Ipv4Addr;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use pnet::util::MacAddr;

use crate::device::NetDevice;
use crate::stack::NetworkStack;

/// A stack with one channel-backed device `test0`.
pub struct DummyStack {
    pub stack: NetworkStack,
    pub dev: Arc<NetDevice>,
    /// Every frame the stack sends on `test0`.
    pub frames: Receiver<Vec<u8>>,
}

impl DummyStack {
    /// Shorthand for pushing a received frame into the pipeline.
    pub fn inject(&self, frame: Vec<u8>) {
        self.stack.inject(&self.dev, frame);
    }
}

/// Builds a stack with a single device at `mac` / `net`.
pub fn dummy_stack(mac: MacAddr, net: Ipv4Network) -> DummyStack {
    let stack = NetworkStack::new();
    let (dev, frames) = stack
        .add_channel_device("test0", mac, net)
        .expect("adding the test device cannot fail");
    DummyStack { stack, dev, frames }
}

/// The default fixture: `10.0.0.1/24` at `00:0c:29:aa:bb:01`.
pub fn default_dummy_stack() -> DummyStack {
    dummy_stack(
        MacAddr::new(0x00, 0x0c, 0x29, 0xaa, 0xbb, 0x01),
        Ipv4Network::new(Ipv4Addr::new(10, 0, 0, 1), 24).unwrap(),
    )
}
