//! The TCP wire format and the parsed segment the state machine
//! works with.

use std::net::Ipv4Addr;

use pnet::packet::ip::IpNextHeaderProtocols;

pub const TCP_HEADER_LEN: usize = 20;
pub const TCP_DEFAULT_TTL: u8 = 64;

// Control bits, MSB to LSB in the flag byte.
pub const CWR: u8 = 0b1000_0000;
pub const ECE: u8 = 0b0100_0000;
pub const URG: u8 = 0b0010_0000;
pub const ACK: u8 = 0b0001_0000;
pub const PSH: u8 = 0b0000_1000;
pub const RST: u8 = 0b0000_0100;
pub const SYN: u8 = 0b0000_0010;
pub const FIN: u8 = 0b0000_0001;

/// RFC 793 header. `data_offset` is kept in bytes (the wire encodes
/// it in 32-bit words); `data` is the segment text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHdr {
    pub src_port: u16,
    pub dst_port: u16,
    pub seqn: u32,
    pub ackn: u32,
    pub data_offset: usize,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgptr: u16,
    pub options: Vec<u8>,
    pub data: Vec<u8>,
}

impl TcpHdr {
    pub fn new(src_port: u16, dst_port: u16) -> TcpHdr {
        TcpHdr {
            src_port,
            dst_port,
            seqn: 0,
            ackn: 0,
            data_offset: TCP_HEADER_LEN,
            flags: 0,
            window: 0,
            checksum: 0,
            urgptr: 0,
            options: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn ack(&self) -> bool {
        self.flags & ACK != 0
    }

    pub fn psh(&self) -> bool {
        self.flags & PSH != 0
    }

    pub fn rst(&self) -> bool {
        self.flags & RST != 0
    }

    pub fn syn(&self) -> bool {
        self.flags & SYN != 0
    }

    pub fn fin(&self) -> bool {
        self.flags & FIN != 0
    }

    /// Parses one TCP region (header + text). Options beyond their
    /// length are carried opaquely.
    pub fn parse(region: &[u8]) -> Option<TcpHdr> {
        if region.len() < TCP_HEADER_LEN {
            return None;
        }
        let data_offset = usize::from(region[12] >> 4) * 4;
        if data_offset < TCP_HEADER_LEN || data_offset > region.len() {
            return None;
        }
        Some(TcpHdr {
            src_port: u16::from_be_bytes([region[0], region[1]]),
            dst_port: u16::from_be_bytes([region[2], region[3]]),
            seqn: u32::from_be_bytes([region[4], region[5], region[6], region[7]]),
            ackn: u32::from_be_bytes([region[8], region[9], region[10], region[11]]),
            data_offset,
            flags: region[13],
            window: u16::from_be_bytes([region[14], region[15]]),
            checksum: u16::from_be_bytes([region[16], region[17]]),
            urgptr: u16::from_be_bytes([region[18], region[19]]),
            options: region[TCP_HEADER_LEN..data_offset].to_vec(),
            data: region[data_offset..].to_vec(),
        })
    }

    /// Serializes with the pseudo-header checksum filled in.
    pub fn to_bytes(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(self.data_offset + self.data.len());
        buffer.extend_from_slice(&self.src_port.to_be_bytes());
        buffer.extend_from_slice(&self.dst_port.to_be_bytes());
        buffer.extend_from_slice(&self.seqn.to_be_bytes());
        buffer.extend_from_slice(&self.ackn.to_be_bytes());
        buffer.push(((self.data_offset / 4) as u8) << 4);
        buffer.push(self.flags);
        buffer.extend_from_slice(&self.window.to_be_bytes());
        buffer.extend_from_slice(&[0, 0]);
        buffer.extend_from_slice(&self.urgptr.to_be_bytes());
        buffer.extend_from_slice(&self.options);
        buffer.extend_from_slice(&self.data);
        let checksum = pseudo_checksum(&buffer, src, dst);
        buffer[16..18].copy_from_slice(&checksum.to_be_bytes());
        buffer
    }

    /// Flag letters for log lines, highest bit first.
    pub fn flag_names(&self) -> String {
        let names = [
            (CWR, "CWR"),
            (ECE, "ECE"),
            (URG, "URG"),
            (ACK, "ACK"),
            (PSH, "PSH"),
            (RST, "RST"),
            (SYN, "SYN"),
            (FIN, "FIN"),
        ];
        names
            .iter()
            .filter(|(bit, _)| self.flags & bit != 0)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Checksum of a TCP region under the `src, dst, 0, 6, len`
/// pseudo-header. The stored checksum word (offset 8 in 16-bit
/// words) is skipped, so this both fills and verifies.
pub fn pseudo_checksum(region: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
    pnet::util::ipv4_checksum(region, 8, &[], &src, &dst, IpNextHeaderProtocols::Tcp)
}

/// A parsed segment with the derived lengths the state machine keeps
/// reaching for. `seqn`, `dlen` and `text` are adjusted in place by
/// the trimming steps.
pub struct TcpSegment {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub seqn: u32,
    pub ackn: u32,
    /// Text length.
    pub dlen: usize,
    /// Logical length: text plus one for SYN and FIN each.
    pub len: usize,
    /// Sequence number of the last occupied slot (`seqn` itself for
    /// an empty segment).
    pub lastseqn: u32,
    /// The peer's advertised receive window.
    pub wnd: u32,
    pub up: u16,
    pub text: Vec<u8>,
    pub hdr: TcpHdr,
}

impl TcpSegment {
    pub fn new(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, hdr: TcpHdr) -> TcpSegment {
        let dlen = hdr.data.len();
        let len = dlen + usize::from(hdr.syn()) + usize::from(hdr.fin());
        let seqn = hdr.seqn;
        let lastseqn = if len != 0 {
            seqn.wrapping_add(len as u32).wrapping_sub(1)
        } else {
            seqn
        };
        TcpSegment {
            src_ip,
            dst_ip,
            seqn,
            ackn: hdr.ackn,
            dlen,
            len,
            lastseqn,
            wnd: u32::from(hdr.window),
            up: hdr.urgptr,
            text: hdr.data.clone(),
            hdr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hdr() -> TcpHdr {
        let mut hdr = TcpHdr::new(80, 49152);
        hdr.seqn = 0xdead_beef;
        hdr.ackn = 0x0102_0304;
        hdr.flags = PSH | ACK;
        hdr.window = 4096;
        hdr.urgptr = 0;
        hdr.data = b"hello".to_vec();
        hdr
    }

    #[test]
    fn parse_of_serialize_is_identity() {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let hdr = sample_hdr();
        let bytes = hdr.to_bytes(src, dst);
        let parsed = TcpHdr::parse(&bytes).unwrap();
        assert_eq!(parsed.checksum, pseudo_checksum(&bytes, src, dst));
        let parsed = TcpHdr { checksum: 0, ..parsed };
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn serialized_checksum_verifies() {
        let src = Ipv4Addr::new(192, 168, 1, 10);
        let dst = Ipv4Addr::new(192, 168, 1, 20);
        let bytes = sample_hdr().to_bytes(src, dst);
        let stored = u16::from_be_bytes([bytes[16], bytes[17]]);
        assert_eq!(stored, pseudo_checksum(&bytes, src, dst));
    }

    #[test]
    fn flag_byte_is_cwr_down_to_fin() {
        let mut hdr = TcpHdr::new(1, 2);
        hdr.flags = SYN | ACK;
        let bytes = hdr.to_bytes(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
        assert_eq!(bytes[13], 0b0001_0010);
        hdr.flags = CWR | FIN;
        let bytes = hdr.to_bytes(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED);
        assert_eq!(bytes[13], 0b1000_0001);
    }

    #[test]
    fn segment_lengths_count_syn_and_fin() {
        let src = Ipv4Addr::new(10, 0, 0, 2);
        let dst = Ipv4Addr::new(10, 0, 0, 1);
        let mut hdr = TcpHdr::new(1000, 80);
        hdr.seqn = 100;
        hdr.flags = SYN;
        let seg = TcpSegment::new(src, dst, hdr);
        assert_eq!(seg.dlen, 0);
        assert_eq!(seg.len, 1);
        assert_eq!(seg.lastseqn, 100);

        let mut hdr = TcpHdr::new(1000, 80);
        hdr.seqn = 100;
        hdr.flags = PSH | ACK;
        hdr.data = vec![0; 5];
        let seg = TcpSegment::new(src, dst, hdr);
        assert_eq!(seg.len, 5);
        assert_eq!(seg.lastseqn, 104);

        let mut hdr = TcpHdr::new(1000, 80);
        hdr.seqn = 200;
        hdr.flags = ACK;
        let seg = TcpSegment::new(src, dst, hdr);
        assert_eq!(seg.len, 0);
        assert_eq!(seg.lastseqn, 200);
    }
}
