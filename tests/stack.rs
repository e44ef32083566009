//! End-to-end tests against a stack with a channel-backed device:
//! frames are injected as if read off the TAP, and everything the
//! stack transmits is read back and dissected.

use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pnet::packet::arp::{
    ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket,
};
use pnet::packet::ethernet::{EtherType, EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes, MutableIcmpPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{checksum, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::{MutablePacket, Packet};
use pnet::util::MacAddr;

use tapstack::arp::ArpState;
use tapstack::tcp::{segment, TcpHdr};
use tapstack::testing::{default_dummy_stack, DummyStack};
use tapstack::Socket;

const ETH_HDR: usize = 14;
const IP_HDR: usize = 20;

fn stack_mac() -> MacAddr {
    MacAddr::new(0x00, 0x0c, 0x29, 0xaa, 0xbb, 0x01)
}

fn peer_mac() -> MacAddr {
    MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01)
}

fn stack_ip() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

fn peer_ip() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

fn recv_frame(frames: &Receiver<Vec<u8>>) -> Vec<u8> {
    frames
        .recv_timeout(Duration::from_secs(2))
        .expect("expected the stack to transmit a frame")
}

fn assert_no_frame(frames: &Receiver<Vec<u8>>) {
    match frames.recv_timeout(Duration::from_millis(300)) {
        Err(RecvTimeoutError::Timeout) => {}
        Ok(frame) => panic!("unexpected frame of {} bytes", frame.len()),
        Err(e) => panic!("frame channel died: {}", e),
    }
}

/// Runs a blocking socket call on a helper thread so a regression
/// hangs the assertion instead of the whole test binary.
fn with_timeout<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(5))
        .expect("blocking socket call did not return")
}

fn build_eth(dst: MacAddr, src: MacAddr, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HDR + payload.len()];
    let mut eth_pkg = MutableEthernetPacket::new(&mut frame).unwrap();
    eth_pkg.set_destination(dst);
    eth_pkg.set_source(src);
    eth_pkg.set_ethertype(ethertype);
    eth_pkg.payload_mut().copy_from_slice(payload);
    frame
}

fn build_arp(
    operation: ArpOperation,
    sender: (MacAddr, Ipv4Addr),
    target: (MacAddr, Ipv4Addr),
) -> Vec<u8> {
    let mut buffer = vec![0u8; ArpPacket::minimum_packet_size()];
    {
        let mut arp_pkg = MutableArpPacket::new(&mut buffer).unwrap();
        arp_pkg.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp_pkg.set_protocol_type(EtherTypes::Ipv4);
        arp_pkg.set_hw_addr_len(6);
        arp_pkg.set_proto_addr_len(4);
        arp_pkg.set_operation(operation);
        arp_pkg.set_sender_hw_addr(sender.0);
        arp_pkg.set_sender_proto_addr(sender.1);
        arp_pkg.set_target_hw_addr(target.0);
        arp_pkg.set_target_proto_addr(target.1);
    }
    buffer
}

#[allow(clippy::too_many_arguments)]
fn build_ipv4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    proto: IpNextHeaderProtocol,
    id: u16,
    flags: u8,
    frag_off_units: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IP_HDR + payload.len();
    let mut buffer = vec![0u8; total_len];
    {
        let mut ip_pkg = MutableIpv4Packet::new(&mut buffer).unwrap();
        ip_pkg.set_version(4);
        ip_pkg.set_header_length(5);
        ip_pkg.set_total_length(total_len as u16);
        ip_pkg.set_identification(id);
        ip_pkg.set_flags(flags);
        ip_pkg.set_fragment_offset(frag_off_units);
        ip_pkg.set_ttl(64);
        ip_pkg.set_next_level_protocol(proto);
        ip_pkg.set_source(src);
        ip_pkg.set_destination(dst);
        ip_pkg.set_payload(payload);
        let csum = checksum(&ip_pkg.to_immutable());
        ip_pkg.set_checksum(csum);
    }
    buffer
}

/// A full frame carrying one TCP segment from the peer to the stack.
fn build_tcp_frame(hdr: &TcpHdr) -> Vec<u8> {
    let tcp_bytes = hdr.to_bytes(peer_ip(), stack_ip());
    let ip = build_ipv4(
        peer_ip(),
        stack_ip(),
        IpNextHeaderProtocols::Tcp,
        1,
        0b010,
        0,
        &tcp_bytes,
    );
    build_eth(stack_mac(), peer_mac(), EtherTypes::Ipv4, &ip)
}

fn peer_tcp_hdr(flags: u8, seqn: u32, ackn: u32) -> TcpHdr {
    let mut hdr = TcpHdr::new(50000, 80);
    hdr.flags = flags;
    hdr.seqn = seqn;
    hdr.ackn = ackn;
    hdr.window = 65535;
    hdr
}

/// Digs the TCP region out of a transmitted frame.
fn parse_tcp(frame: &[u8]) -> TcpHdr {
    let eth_pkg = EthernetPacket::new(frame).unwrap();
    assert_eq!(eth_pkg.get_ethertype(), EtherTypes::Ipv4);
    let ip_pkg = Ipv4Packet::new(eth_pkg.payload()).unwrap();
    assert_eq!(ip_pkg.get_next_level_protocol(), IpNextHeaderProtocols::Tcp);
    let total_len = ip_pkg.get_total_length() as usize;
    let region = &eth_pkg.payload()[IP_HDR..total_len];
    let hdr = TcpHdr::parse(region).unwrap();
    assert_eq!(
        hdr.checksum,
        segment::pseudo_checksum(region, ip_pkg.get_source(), ip_pkg.get_destination()),
        "transmitted TCP checksum must verify"
    );
    hdr
}

/// Teaches the stack the peer's MAC by having the peer ask for ours,
/// and swallows the reply.
fn prime_arp(net: &DummyStack) {
    let arp = build_arp(
        ArpOperations::Request,
        (peer_mac(), peer_ip()),
        (MacAddr::broadcast(), stack_ip()),
    );
    net.inject(build_eth(
        MacAddr::broadcast(),
        peer_mac(),
        EtherTypes::Arp,
        &arp,
    ));
    let reply = recv_frame(&net.frames);
    let eth_pkg = EthernetPacket::new(&reply).unwrap();
    assert_eq!(eth_pkg.get_ethertype(), EtherTypes::Arp);
}

/// Drives the passive handshake from the peer side and returns the
/// accepted connection.
fn establish(net: &DummyStack, server: &Arc<Socket>) -> Socket {
    net.inject(build_tcp_frame(&peer_tcp_hdr(segment::SYN, 1000, 0)));
    let synack = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(synack.flags, segment::SYN | segment::ACK);
    assert_eq!(synack.seqn, 0);
    assert_eq!(synack.ackn, 1001);

    net.inject(build_tcp_frame(&peer_tcp_hdr(segment::ACK, 1001, 1)));
    let server = server.clone();
    let (conn, peer) = with_timeout(move || server.accept().unwrap());
    assert_eq!(peer, (peer_ip(), 50000));
    conn
}

#[test]
fn arp_request_is_answered_and_cached() {
    let net = default_dummy_stack();
    let arp = build_arp(
        ArpOperations::Request,
        (peer_mac(), peer_ip()),
        (MacAddr::broadcast(), stack_ip()),
    );
    net.inject(build_eth(
        MacAddr::broadcast(),
        peer_mac(),
        EtherTypes::Arp,
        &arp,
    ));

    let frame = recv_frame(&net.frames);
    let eth_pkg = EthernetPacket::new(&frame).unwrap();
    assert_eq!(eth_pkg.get_ethertype(), EtherTypes::Arp);
    assert_eq!(eth_pkg.get_destination(), peer_mac());
    assert_eq!(eth_pkg.get_source(), stack_mac());
    let arp_pkg = ArpPacket::new(eth_pkg.payload()).unwrap();
    assert_eq!(arp_pkg.get_operation(), ArpOperations::Reply);
    assert_eq!(arp_pkg.get_sender_hw_addr(), stack_mac());
    assert_eq!(arp_pkg.get_sender_proto_addr(), stack_ip());
    assert_eq!(arp_pkg.get_target_hw_addr(), peer_mac());
    assert_eq!(arp_pkg.get_target_proto_addr(), peer_ip());

    assert_eq!(
        net.stack.arp().state_of(EtherTypes::Ipv4, peer_ip()),
        Some(ArpState::Resolved)
    );
}

#[test]
fn icmp_echo_request_is_answered() {
    let net = default_dummy_stack();
    prime_arp(&net);

    let payload = [0x5a; 56];
    let mut icmp = vec![0u8; 8 + payload.len()];
    {
        let mut icmp_pkg = MutableIcmpPacket::new(&mut icmp).unwrap();
        icmp_pkg.set_icmp_type(IcmpTypes::EchoRequest);
    }
    icmp[4..6].copy_from_slice(&0x1234u16.to_be_bytes());
    icmp[6..8].copy_from_slice(&1u16.to_be_bytes());
    icmp[8..].copy_from_slice(&payload);
    let csum = {
        let icmp_pkg = IcmpPacket::new(&icmp).unwrap();
        pnet::packet::icmp::checksum(&icmp_pkg)
    };
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    let ip = build_ipv4(
        peer_ip(),
        stack_ip(),
        IpNextHeaderProtocols::Icmp,
        7,
        0,
        0,
        &icmp,
    );
    net.inject(build_eth(stack_mac(), peer_mac(), EtherTypes::Ipv4, &ip));

    let frame = recv_frame(&net.frames);
    let eth_pkg = EthernetPacket::new(&frame).unwrap();
    assert_eq!(eth_pkg.get_destination(), peer_mac());
    let ip_pkg = Ipv4Packet::new(eth_pkg.payload()).unwrap();
    assert_eq!(ip_pkg.get_source(), stack_ip());
    assert_eq!(ip_pkg.get_destination(), peer_ip());
    let region = &eth_pkg.payload()[IP_HDR..ip_pkg.get_total_length() as usize];
    let icmp_pkg = IcmpPacket::new(region).unwrap();
    assert_eq!(icmp_pkg.get_icmp_type(), IcmpTypes::EchoReply);
    assert_eq!(
        icmp_pkg.get_checksum(),
        pnet::packet::icmp::checksum(&icmp_pkg)
    );
    assert_eq!(&region[4..6], &0x1234u16.to_be_bytes());
    assert_eq!(&region[6..8], &1u16.to_be_bytes());
    assert_eq!(&region[8..], &payload);
}

#[test]
fn tcp_passive_open_and_echo() {
    let net = default_dummy_stack();
    prime_arp(&net);

    let server = Arc::new(Socket::new(&net.stack));
    server.bind((stack_ip(), 80)).unwrap();
    server.listen(1).unwrap();

    let conn = establish(&net, &server);

    // Five bytes of text from the peer...
    let mut hdr = peer_tcp_hdr(segment::PSH | segment::ACK, 1001, 1);
    hdr.data = b"hello".to_vec();
    net.inject(build_tcp_frame(&hdr));

    // ...acknowledged...
    let ack = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(ack.flags, segment::ACK);
    assert_eq!(ack.ackn, 1006);

    // ...readable...
    let data = with_timeout({
        let conn = Arc::new(conn);
        let handle = conn.clone();
        move || {
            let data = handle.read(0).unwrap();
            (data, handle)
        }
    });
    assert_eq!(data.0, b"hello");
    let conn = data.1;

    // ...and echoed back as one PSH+ACK segment.
    assert_eq!(conn.write(b"hello").unwrap(), 5);
    let echoed = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(echoed.flags, segment::PSH | segment::ACK);
    assert_eq!(echoed.seqn, 1);
    assert_eq!(echoed.ackn, 1006);
    assert_eq!(echoed.data, b"hello");
}

/// The 2000-byte echo payload used by the reassembly test, split at
/// 1480 bytes the way a 1500-byte MTU splits it.
fn echo_fragments(id: u16) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    let mut region = vec![0u8; 2000];
    {
        let mut icmp_pkg = MutableIcmpPacket::new(&mut region).unwrap();
        icmp_pkg.set_icmp_type(IcmpTypes::EchoRequest);
    }
    region[4..6].copy_from_slice(&0x4242u16.to_be_bytes());
    region[6..8].copy_from_slice(&7u16.to_be_bytes());
    for (i, byte) in region[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    let csum = {
        let icmp_pkg = IcmpPacket::new(&region).unwrap();
        pnet::packet::icmp::checksum(&icmp_pkg)
    };
    region[2..4].copy_from_slice(&csum.to_be_bytes());

    let first = build_eth(
        stack_mac(),
        peer_mac(),
        EtherTypes::Ipv4,
        &build_ipv4(
            peer_ip(),
            stack_ip(),
            IpNextHeaderProtocols::Icmp,
            id,
            0b001,
            0,
            &region[..1480],
        ),
    );
    let second = build_eth(
        stack_mac(),
        peer_mac(),
        EtherTypes::Ipv4,
        &build_ipv4(
            peer_ip(),
            stack_ip(),
            IpNextHeaderProtocols::Icmp,
            id,
            0,
            185,
            &region[1480..],
        ),
    );
    (region, first, second)
}

/// Reads the fragmented echo reply and stitches its ICMP region back
/// together.
fn read_fragmented_reply(net: &DummyStack) -> Vec<u8> {
    let mut region = Vec::new();
    for expected_offset in [0u16, 185] {
        let frame = recv_frame(&net.frames);
        let eth_pkg = EthernetPacket::new(&frame).unwrap();
        let ip_pkg = Ipv4Packet::new(eth_pkg.payload()).unwrap();
        assert_eq!(ip_pkg.get_destination(), peer_ip());
        assert_eq!(ip_pkg.get_fragment_offset(), expected_offset);
        let more = ip_pkg.get_flags() & 0b001 != 0;
        assert_eq!(more, expected_offset == 0, "first fragment carries MF");
        let total_len = ip_pkg.get_total_length() as usize;
        region.extend_from_slice(&eth_pkg.payload()[IP_HDR..total_len]);
    }
    region
}

#[test]
fn fragmented_echo_is_reassembled_and_answered() {
    let net = default_dummy_stack();
    prime_arp(&net);

    // In order.
    let (region, first, second) = echo_fragments(0x4242);
    net.inject(first);
    assert_no_frame(&net.frames);
    net.inject(second);
    let reply = read_fragmented_reply(&net);
    assert_eq!(reply.len(), region.len());
    assert_eq!(reply[0], 0); // echo reply type
    assert_eq!(&reply[4..], &region[4..]);

    // Reordered.
    let (region, first, second) = echo_fragments(0x4243);
    net.inject(second);
    assert_no_frame(&net.frames);
    net.inject(first);
    let reply = read_fragmented_reply(&net);
    assert_eq!(&reply[4..], &region[4..]);

    // Duplicated first fragment: dropped, one reply only.
    let (region, first, second) = echo_fragments(0x4244);
    net.inject(first.clone());
    net.inject(first);
    net.inject(second);
    let reply = read_fragmented_reply(&net);
    assert_eq!(&reply[4..], &region[4..]);
    assert_no_frame(&net.frames);
}

#[test]
fn unresolved_neighbor_parks_segment_behind_one_arp_request() {
    let net = default_dummy_stack();

    let server = Arc::new(Socket::new(&net.stack));
    server.bind((stack_ip(), 80)).unwrap();
    server.listen(1).unwrap();

    // SYN arrives with the neighbor unknown: the SYN+ACK cannot go
    // out yet, a single ARP request goes instead.
    net.inject(build_tcp_frame(&peer_tcp_hdr(segment::SYN, 1000, 0)));
    let frame = recv_frame(&net.frames);
    let eth_pkg = EthernetPacket::new(&frame).unwrap();
    assert_eq!(eth_pkg.get_ethertype(), EtherTypes::Arp);
    assert_eq!(eth_pkg.get_destination(), MacAddr::broadcast());
    let arp_pkg = ArpPacket::new(eth_pkg.payload()).unwrap();
    assert_eq!(arp_pkg.get_operation(), ArpOperations::Request);
    assert_eq!(arp_pkg.get_target_proto_addr(), peer_ip());
    assert_no_frame(&net.frames);

    // The reply releases the parked SYN+ACK, addressed to the
    // learned MAC.
    let arp = build_arp(
        ArpOperations::Reply,
        (peer_mac(), peer_ip()),
        (stack_mac(), stack_ip()),
    );
    net.inject(build_eth(stack_mac(), peer_mac(), EtherTypes::Arp, &arp));

    let frame = recv_frame(&net.frames);
    let eth_pkg = EthernetPacket::new(&frame).unwrap();
    assert_eq!(eth_pkg.get_ethertype(), EtherTypes::Ipv4);
    assert_eq!(eth_pkg.get_destination(), peer_mac());
    let synack = parse_tcp(&frame);
    assert_eq!(synack.flags, segment::SYN | segment::ACK);
    assert_eq!(synack.ackn, 1001);
}

#[test]
fn fin_wait_2_times_out_and_unhashes() {
    let net = default_dummy_stack();
    prime_arp(&net);

    let server = Arc::new(Socket::new(&net.stack));
    server.bind((stack_ip(), 80)).unwrap();
    server.listen(1).unwrap();
    let conn = establish(&net, &server);

    conn.close().unwrap();
    let fin = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(fin.flags, segment::FIN | segment::ACK);
    assert_eq!(fin.seqn, 1);

    // The peer acknowledges the FIN but never sends its own.
    net.inject(build_tcp_frame(&peer_tcp_hdr(segment::ACK, 1001, 2)));
    thread::sleep(Duration::from_millis(200));
    assert!(net
        .stack
        .tcp()
        .manager
        .lookup_established(stack_ip(), 80, peer_ip(), 50000)
        .is_some());

    // FIN_WAIT_2 expires after 2 * MSL and the socket disappears.
    thread::sleep(Duration::from_millis(3500));
    assert!(net
        .stack
        .tcp()
        .manager
        .lookup_established(stack_ip(), 80, peer_ip(), 50000)
        .is_none());
}

#[test]
fn payload_splits_at_the_segment_boundary() {
    let net = default_dummy_stack();
    prime_arp(&net);

    let server = Arc::new(Socket::new(&net.stack));
    server.bind((stack_ip(), 80)).unwrap();
    server.listen(1).unwrap();
    let conn = establish(&net, &server);

    // MTU 1500 - 20 (IP) - 20 (TCP): exactly 1460 bytes fit one
    // segment.
    let exact = vec![1u8; 1460];
    assert_eq!(conn.write(&exact).unwrap(), 1460);
    let seg = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(seg.data.len(), 1460);
    assert_no_frame(&net.frames);

    // One byte more spills into a second segment.
    let spill = vec![2u8; 1461];
    assert_eq!(conn.write(&spill).unwrap(), 1461);
    let first = parse_tcp(&recv_frame(&net.frames));
    let second = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(first.data.len(), 1460);
    assert_eq!(second.data.len(), 1);
    assert_eq!(second.seqn, first.seqn.wrapping_add(1460));
    assert_no_frame(&net.frames);
}

#[test]
fn tcp_active_open_sends_syn_and_completes() {
    let net = default_dummy_stack();
    prime_arp(&net);

    let client = Arc::new(Socket::new(&net.stack));
    client.bind((stack_ip(), 0)).unwrap();
    let local_port = client.local_addr().unwrap().1;

    let handle = client.clone();
    let connect = thread::spawn(move || handle.connect((peer_ip(), 80)));

    let syn = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(syn.flags, segment::SYN);
    assert_eq!(syn.seqn, 0);
    assert_eq!(syn.src_port, local_port);
    assert_eq!(syn.dst_port, 80);

    let mut hdr = TcpHdr::new(80, local_port);
    hdr.flags = segment::SYN | segment::ACK;
    hdr.seqn = 5000;
    hdr.ackn = 1;
    hdr.window = 65535;
    net.inject(build_tcp_frame(&hdr));

    let ack = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(ack.flags, segment::ACK);
    assert_eq!(ack.ackn, 5001);

    connect.join().unwrap().unwrap();
    assert_eq!(client.peer_addr().unwrap(), (peer_ip(), 80));
}

#[test]
fn loopback_connect_and_echo() {
    // Connecting to our own address runs both ends of the handshake
    // through the loopback device.
    let net = default_dummy_stack();

    let server = Arc::new(Socket::new(&net.stack));
    server.bind((stack_ip(), 80)).unwrap();
    server.listen(1).unwrap();

    let client = Arc::new(Socket::new(&net.stack));
    client.bind((stack_ip(), 0)).unwrap();

    let handle = client.clone();
    let connect = thread::spawn(move || handle.connect((stack_ip(), 80)));
    let (conn, peer) = with_timeout({
        let server = server.clone();
        move || server.accept().unwrap()
    });
    connect.join().unwrap().unwrap();
    assert_eq!(peer.0, stack_ip());
    assert_eq!(peer.1, client.local_addr().unwrap().1);

    assert_eq!(client.write(b"ping").unwrap(), 4);
    let conn = Arc::new(conn);
    let got = with_timeout({
        let conn = conn.clone();
        move || conn.read(0).unwrap()
    });
    assert_eq!(got, b"ping");

    assert_eq!(conn.write(b"pong").unwrap(), 4);
    let got = with_timeout({
        let client = client.clone();
        move || client.read(0).unwrap()
    });
    assert_eq!(got, b"pong");
}

#[test]
fn closed_receive_window_freezes_delivery_until_read() {
    let net = default_dummy_stack();
    prime_arp(&net);

    let server = Arc::new(Socket::new(&net.stack));
    server.bind((stack_ip(), 80)).unwrap();
    server.listen(1).unwrap();
    let conn = Arc::new(establish(&net, &server));

    // Fill the 4096-byte receive window from the peer.
    let mut seqn = 1001u32;
    for _ in 0..4 {
        let mut hdr = peer_tcp_hdr(segment::PSH | segment::ACK, seqn, 1);
        hdr.data = vec![3u8; 1024];
        net.inject(build_tcp_frame(&hdr));
        let ack = parse_tcp(&recv_frame(&net.frames));
        seqn += 1024;
        assert_eq!(ack.ackn, seqn);
    }

    // Window is zero: one more byte fails the sequence check and
    // only provokes a window update.
    let mut hdr = peer_tcp_hdr(segment::PSH | segment::ACK, seqn, 1);
    hdr.data = vec![4u8; 1];
    net.inject(build_tcp_frame(&hdr));
    let ack = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(ack.ackn, seqn);
    assert_eq!(ack.window, 0);

    // Reading drains the buffer and reopens the window.
    let data = with_timeout({
        let handle = conn.clone();
        move || handle.read(0).unwrap()
    });
    assert_eq!(data.len(), 4096);

    let mut hdr = peer_tcp_hdr(segment::PSH | segment::ACK, seqn, 1);
    hdr.data = vec![5u8; 1];
    net.inject(build_tcp_frame(&hdr));
    let ack = parse_tcp(&recv_frame(&net.frames));
    assert_eq!(ack.ackn, seqn + 1);
}
