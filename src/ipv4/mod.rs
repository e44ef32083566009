//! IPv4: input validation, local delivery, forwarding, output with
//! fragmentation, and the reassembly cache.

mod frag;
mod ipv4_rx;
mod ipv4_tx;

pub use self::frag::FragCache;
pub use self::ipv4_rx::Ipv4Rx;
pub use self::ipv4_tx::Ipv4Tx;

pub const IPV4_HEADER_LEN: usize = 20;

pub const MORE_FRAGMENTS: u8 = 0b001;
pub const DONT_FRAGMENT: u8 = 0b010;
pub const NO_FLAGS: u8 = 0b000;
