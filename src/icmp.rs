//! ICMPv4 receive handling. Echo requests are answered in place;
//! echo replies and destination-unreachable messages are logged and
//! dropped. Generating unreachable/redirect/time-exceeded messages
//! is still missing on the send side.

use log::{debug, warn};
use pnet::packet::icmp::echo_request::EchoRequestPacket;
use pnet::packet::icmp::{checksum, IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};

use crate::device::ETHERNET_HEADER_LEN;
use crate::ipv4::Ipv4Tx;
use crate::pkb::{MacType, PacketBuffer};
use crate::{RxError, RxResult};

pub const ICMP_HEADER_LEN: usize = 8;

pub struct IcmpRx {
    tx: Ipv4Tx,
}

impl IcmpRx {
    pub fn new(tx: Ipv4Tx) -> IcmpRx {
        IcmpRx { tx }
    }

    pub fn recv(&self, mut pkb: PacketBuffer) -> RxResult {
        let (hlen, total_len) = {
            let ip_pkg = Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..])
                .ok_or(RxError::InvalidLength)?;
            (
                usize::from(ip_pkg.get_header_length()) * 4,
                ip_pkg.get_total_length() as usize,
            )
        };
        if total_len < hlen + ICMP_HEADER_LEN {
            return Err(RxError::InvalidLength);
        }
        let region_start = ETHERNET_HEADER_LEN + hlen;
        let region_end = ETHERNET_HEADER_LEN + total_len;
        let (icmp_type, icmp_code) = {
            let icmp_pkg = IcmpPacket::new(&pkb.data[region_start..region_end])
                .ok_or(RxError::InvalidLength)?;
            if icmp_pkg.get_checksum() != checksum(&icmp_pkg) {
                return Err(RxError::InvalidChecksum);
            }
            (icmp_pkg.get_icmp_type(), icmp_pkg.get_icmp_code())
        };

        match icmp_type {
            IcmpTypes::EchoRequest => {
                if icmp_code.0 != 0 {
                    warn!("icmp: echo request with code {}", icmp_code.0);
                    return Err(RxError::InvalidContent);
                }
                if let Some(echo_pkg) = EchoRequestPacket::new(&pkb.data[region_start..region_end])
                {
                    debug!(
                        "icmp: echo request id={:#06x} seq={}",
                        echo_pkg.get_identifier(),
                        echo_pkg.get_sequence_number()
                    );
                }
                self.send_echo_reply(pkb, region_start, region_end)
            }
            IcmpTypes::EchoReply => {
                debug!("icmp: echo reply received");
                Ok(())
            }
            IcmpTypes::DestinationUnreachable => {
                debug!("icmp: destination unreachable, code {}", icmp_code.0);
                Ok(())
            }
            other => {
                warn!("icmp: unhandled type {:?}", other);
                Ok(())
            }
        }
    }

    /// Rewrites the request into a reply in place: type flipped,
    /// checksum redone, IP source and destination swapped, and the
    /// receive metadata cleared so the output path routes it afresh.
    fn send_echo_reply(
        &self,
        mut pkb: PacketBuffer,
        region_start: usize,
        region_end: usize,
    ) -> RxResult {
        {
            let mut icmp_pkg = MutableIcmpPacket::new(&mut pkb.data[region_start..region_end])
                .ok_or(RxError::InvalidLength)?;
            icmp_pkg.set_icmp_type(IcmpTypes::EchoReply);
            icmp_pkg.set_checksum(0);
            let csum = checksum(&icmp_pkg.to_immutable());
            icmp_pkg.set_checksum(csum);
        }
        {
            let mut ip_pkg = MutableIpv4Packet::new(&mut pkb.data[ETHERNET_HEADER_LEN..])
                .ok_or(RxError::InvalidLength)?;
            let src = ip_pkg.get_source();
            let dst = ip_pkg.get_destination();
            ip_pkg.set_source(dst);
            ip_pkg.set_destination(src);
            let csum = pnet::packet::ipv4::checksum(&ip_pkg.to_immutable());
            ip_pkg.set_checksum(csum);
        }
        pkb.rtdst = None;
        pkb.indev = None;
        pkb.mac_type = MacType::None;
        self.tx.send(pkb)
    }
}

#[cfg(test)]
mod tests {
    use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
    use pnet::packet::icmp::{checksum, IcmpPacket, IcmpTypes};

    #[test]
    fn echo_checksum_verifies_to_stored_value() {
        let mut buffer = vec![0u8; 8 + 56];
        {
            let mut echo_pkg = MutableEchoRequestPacket::new(&mut buffer).unwrap();
            echo_pkg.set_icmp_type(IcmpTypes::EchoRequest);
            echo_pkg.set_identifier(0x1234);
            echo_pkg.set_sequence_number(1);
            echo_pkg.set_payload(&[0xab; 56]);
        }
        let csum = {
            let icmp_pkg = IcmpPacket::new(&buffer).unwrap();
            checksum(&icmp_pkg)
        };
        buffer[2..4].copy_from_slice(&csum.to_be_bytes());
        let icmp_pkg = IcmpPacket::new(&buffer).unwrap();
        assert_eq!(icmp_pkg.get_checksum(), checksum(&icmp_pkg));
    }
}
