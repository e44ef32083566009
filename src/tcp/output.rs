//! Construction of outgoing segments: SYN, SYN+ACK, ACK, FIN, RST
//! and data, wrapped into IPv4 and handed to the IP send path.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use log::debug;
use pnet::packet::ethernet::EtherTypes;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{checksum, MutableIpv4Packet};
use pnet::util::MacAddr;

use super::segment::{TcpHdr, TcpSegment, ACK, FIN, PSH, RST, SYN, TCP_DEFAULT_TTL};
use super::sock::{Tcb, F_ACK_LATER, F_ACK_NOW};
use crate::ethernet::build_frame;
use crate::ipv4::{Ipv4Tx, DONT_FRAGMENT, IPV4_HEADER_LEN};
use crate::pkb::PacketBuffer;

pub struct TcpOut {
    ipv4: Ipv4Tx,
    next_id: AtomicU16,
}

impl TcpOut {
    pub fn new(ipv4: Ipv4Tx) -> TcpOut {
        TcpOut {
            ipv4,
            next_id: AtomicU16::new(0),
        }
    }

    pub fn ipv4(&self) -> &Ipv4Tx {
        &self.ipv4
    }

    pub fn send_syn(&self, tcb: &mut Tcb) {
        let mut hdr = TcpHdr::new(tcb.addr.src_port, tcb.addr.dst_port);
        hdr.flags = SYN;
        hdr.seqn = tcb.iss;
        hdr.window = tcb.rcv_wnd as u16;
        self.send_out(Some(tcb), hdr, None);
    }

    pub fn send_synack(&self, tcb: &mut Tcb, segment: &TcpSegment) {
        let mut hdr = TcpHdr::new(tcb.addr.src_port, tcb.addr.dst_port);
        hdr.flags = SYN | ACK;
        hdr.seqn = tcb.iss;
        hdr.ackn = tcb.rcv_nxt;
        hdr.window = tcb.rcv_wnd as u16;
        self.send_out(Some(tcb), hdr, Some(segment));
    }

    /// Acknowledges everything received so far and clears the
    /// pending-ACK flags.
    pub fn send_ack(&self, tcb: &mut Tcb, segment: Option<&TcpSegment>) {
        let mut hdr = TcpHdr::new(tcb.addr.src_port, tcb.addr.dst_port);
        hdr.flags = ACK;
        hdr.seqn = tcb.snd_nxt;
        hdr.ackn = tcb.rcv_nxt;
        hdr.window = tcb.rcv_wnd as u16;
        tcb.flags &= !(F_ACK_NOW | F_ACK_LATER);
        self.send_out(Some(tcb), hdr, segment);
    }

    pub fn send_fin(&self, tcb: &mut Tcb) {
        let mut hdr = TcpHdr::new(tcb.addr.src_port, tcb.addr.dst_port);
        hdr.flags = FIN | ACK;
        hdr.seqn = tcb.snd_nxt;
        hdr.ackn = tcb.rcv_nxt;
        hdr.window = tcb.rcv_wnd as u16;
        self.send_out(Some(tcb), hdr, None);
    }

    /// One data segment, PSH+ACK. The caller accounts for the
    /// sequence space itself.
    pub fn send_data(&self, tcb: &mut Tcb, seqn: u32, data: Vec<u8>) {
        let mut hdr = TcpHdr::new(tcb.addr.src_port, tcb.addr.dst_port);
        hdr.flags = PSH | ACK;
        hdr.seqn = seqn;
        hdr.ackn = tcb.rcv_nxt;
        hdr.window = tcb.rcv_wnd as u16;
        hdr.data = data;
        self.send_out(Some(tcb), hdr, None);
    }

    /// Answers a segment that reached no usable connection. Never
    /// resets a reset.
    pub fn send_reset(&self, segment: &TcpSegment) {
        if segment.hdr.rst() {
            return;
        }
        let mut hdr = TcpHdr::new(segment.hdr.dst_port, segment.hdr.src_port);
        hdr.flags = RST;
        if segment.hdr.ack() {
            hdr.seqn = segment.ackn;
        } else {
            hdr.flags |= ACK;
            hdr.ackn = segment.seqn.wrapping_add(segment.len as u32);
        }
        self.send_out(None, hdr, Some(segment));
    }

    /// Wraps the TCP header into IPv4 (DF set, TTL 64) and an
    /// unaddressed Ethernet frame, attaches the cached route (or
    /// resolves and caches one) and sends.
    fn send_out(&self, tcb: Option<&mut Tcb>, hdr: TcpHdr, segment: Option<&TcpSegment>) {
        // Replying to a segment reverses its addresses.
        let (src_ip, dst_ip) = match (segment, &tcb) {
            (Some(segment), _) => (segment.dst_ip, segment.src_ip),
            (None, Some(tcb)) => (tcb.addr.src_ip, tcb.addr.dst_ip),
            (None, None) => return,
        };
        debug!(
            "tcp: send {}:{} -> {}:{} seqn {} ackn {} win {} [{}]",
            src_ip,
            hdr.src_port,
            dst_ip,
            hdr.dst_port,
            hdr.seqn,
            hdr.ackn,
            hdr.window,
            hdr.flag_names()
        );
        let tcp_bytes = hdr.to_bytes(src_ip, dst_ip);
        let frame = build_tcp_frame(src_ip, dst_ip, self.next_id(), &tcp_bytes);
        let mut pkb = PacketBuffer::new(frame);

        match tcb {
            Some(tcb) => {
                if let Some(entry) = &tcb.rtdst {
                    pkb.rtdst = Some(entry.clone());
                } else if self.ipv4.routes().route_output(&mut pkb).is_ok() {
                    tcb.rtdst = pkb.rtdst.clone();
                } else {
                    return;
                }
            }
            None => {
                if self.ipv4.routes().route_output(&mut pkb).is_err() {
                    return;
                }
            }
        }
        if let Err(e) = self.ipv4.send(pkb) {
            debug!("tcp: send failed: {}", e);
        }
    }

    fn next_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A full frame around one serialized TCP region.
fn build_tcp_frame(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, id: u16, tcp_bytes: &[u8]) -> Vec<u8> {
    let total_len = IPV4_HEADER_LEN + tcp_bytes.len();
    let mut ip_bytes = vec![0u8; total_len];
    {
        let mut ip_pkg = MutableIpv4Packet::new(&mut ip_bytes).unwrap();
        ip_pkg.set_version(4);
        ip_pkg.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip_pkg.set_total_length(total_len as u16);
        ip_pkg.set_identification(id);
        ip_pkg.set_flags(DONT_FRAGMENT);
        ip_pkg.set_ttl(TCP_DEFAULT_TTL);
        ip_pkg.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip_pkg.set_source(src_ip);
        ip_pkg.set_destination(dst_ip);
        ip_pkg.set_payload(tcp_bytes);
        let csum = checksum(&ip_pkg.to_immutable());
        ip_pkg.set_checksum(csum);
    }
    build_frame(MacAddr::zero(), MacAddr::zero(), EtherTypes::Ipv4, &ip_bytes)
}
