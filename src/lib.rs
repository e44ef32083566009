// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # tapstack
//!
//! A userspace TCP/IP stack attached to virtual Ethernet interfaces
//! backed by host TAP devices, with the wire formats handled through
//! [`pnet`](https://github.com/libpnet/libpnet) packet types.
//!
//! The stack implements the link, network and transport layers up to
//! a socket-style API: an application opens [`Socket`]s against a
//! [`NetworkStack`], binds, listens, accepts, connects, reads and
//! writes, and the stack frames Ethernet, resolves neighbors via
//! ARP, routes and fragments IPv4, answers ICMP echo, and drives TCP
//! connections through the full state machine.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tapstack::{NetworkStack, Socket};
//!
//! let stack = NetworkStack::new();
//! stack
//!     .add_tap(
//!         "tap0",
//!         "10.0.0.1/24".parse().unwrap(),
//!         Some("10.0.0.2/24".parse().unwrap()),
//!     )
//!     .unwrap();
//!
//! let server = Socket::new(&stack);
//! server.bind(("10.0.0.1".parse().unwrap(), 80)).unwrap();
//! server.listen(1).unwrap();
//! let (peer, addr) = server.accept().unwrap();
//! println!("connection from {}:{}", addr.0, addr.1);
//! let data = peer.read(0).unwrap();
//! peer.write(&data).unwrap();
//! ```
//!
//! ## Architecture
//!
//! Received frames flow `TAP → device manager → receive queue →
//! ethernet worker → (ARP | IPv4 → (ICMP | TCP)) → socket receive
//! buffer`; sends flow `socket → TCP output → IPv4 output → route
//! lookup → (fragmentation) → ARP resolution → device`. The ARP
//! cache never blocks a sender: unresolved frames queue behind a
//! broadcast request and flush when the reply lands.
//!
//! What is deliberately not here: IPv6, TCP options beyond length
//! parsing, congestion control and retransmission, urgent data,
//! UDP (dropped with a log line), and ICMP beyond echo.

pub mod arp;
pub mod device;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod pkb;
pub mod routing;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod testing;
mod util;

pub use crate::socket::{Socket, SocketError};
pub use crate::stack::NetworkStack;
pub use crate::util::Wait;

use std::error::Error;
use std::fmt;

/// Why the pipeline dropped a packet. These never reach the
/// application; they exist so drops are loggable and so tests can
/// assert on the exact reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxError {
    /// A checksum did not verify.
    InvalidChecksum,
    /// A buffer shorter (or longer) than its headers claim.
    InvalidLength,
    /// Header contents that cannot be acted on, duplicates and
    /// overlaps included.
    InvalidContent,
    /// A frame addressed to some other host.
    Otherhost,
    /// No route entry matches the destination.
    NoRoute,
    /// A forwarded packet ran out of TTL.
    TtlExpired,
    /// Forwarding needed to fragment but DF was set.
    FragmentationNeeded,
}

impl fmt::Display for RxError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use RxError::*;
        let msg = match self {
            InvalidChecksum => "invalid checksum",
            InvalidLength => "invalid length",
            InvalidContent => "invalid content",
            Otherhost => "frame for another host",
            NoRoute => "no route to destination",
            TtlExpired => "ttl expired in transit",
            FragmentationNeeded => "fragmentation needed but DF set",
        };
        fmt.write_str(msg)
    }
}

impl Error for RxError {}

/// Return type of the `recv` paths throughout the pipeline.
pub type RxResult = Result<(), RxError>;
