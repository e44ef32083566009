use std::net::Ipv4Addr;
use std::sync::Mutex;

use log::debug;
use pnet::packet::ip::IpNextHeaderProtocol;
use pnet::packet::ipv4::{checksum, Ipv4Packet, MutableIpv4Packet};

use super::{MORE_FRAGMENTS, NO_FLAGS};
use crate::device::ETHERNET_HEADER_LEN;
use crate::pkb::PacketBuffer;
use crate::{RxError, RxResult};

pub const MAX_FRAG_TTL: i32 = 30;

const COMPLETE: u8 = 0x01;
const FIRST_IN: u8 = 0x02;
const LAST_IN: u8 = 0x04;

struct Fragment {
    offset: usize,
    dlen: usize,
    pkb: PacketBuffer,
}

/// Reassembly context for one fragmented packet, keyed by
/// `(id, protocol, src, dst)`.
struct IpFrag {
    id: u16,
    proto: IpNextHeaderProtocol,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: i32,
    hlen: usize,
    /// Total data size, known once the last fragment arrived.
    size: usize,
    /// Data received so far.
    rsize: usize,
    flags: u8,
    fragments: Vec<Fragment>,
}

impl IpFrag {
    fn is_complete(&self) -> bool {
        self.flags & COMPLETE != 0
    }
}

/// All in-progress reassemblies. The 1 Hz timer ages incomplete
/// contexts out after [`MAX_FRAG_TTL`] seconds.
pub struct FragCache {
    frags: Mutex<Vec<IpFrag>>,
}

impl FragCache {
    pub fn new() -> FragCache {
        FragCache {
            frags: Mutex::new(Vec::new()),
        }
    }

    /// Files `pkb` under its reassembly context. Returns the rebuilt
    /// packet once the context covers `[0, size)` contiguously.
    pub fn reassemble(&self, pkb: PacketBuffer) -> Result<Option<PacketBuffer>, RxError> {
        let (id, proto, src, dst) = {
            let ip_pkg =
                Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..]).ok_or(RxError::InvalidLength)?;
            (
                ip_pkg.get_identification(),
                ip_pkg.get_next_level_protocol(),
                ip_pkg.get_source(),
                ip_pkg.get_destination(),
            )
        };
        let mut frags = self.frags.lock().unwrap();
        let index = match frags
            .iter()
            .position(|f| f.id == id && f.proto == proto && f.src == src && f.dst == dst)
        {
            Some(index) => index,
            None => {
                frags.push(IpFrag {
                    id,
                    proto,
                    src,
                    dst,
                    ttl: MAX_FRAG_TTL,
                    hlen: 0,
                    size: 0,
                    rsize: 0,
                    flags: 0,
                    fragments: Vec::new(),
                });
                frags.len() - 1
            }
        };
        insert_fragment(&mut frags[index], pkb)?;
        if frags[index].is_complete() {
            let frag = frags.swap_remove(index);
            Ok(Some(rebuild(frag)?))
        } else {
            Ok(None)
        }
    }

    /// 1 Hz aging. Completed contexts are removed on delivery, so
    /// only incomplete ones tick down; expiry drops them silently.
    // TODO: emit an ICMP time-exceeded when a context expires
    pub fn tick(&self) {
        let mut frags = self.frags.lock().unwrap();
        frags.retain_mut(|frag| {
            if frag.is_complete() {
                return true;
            }
            frag.ttl -= 1;
            if frag.ttl <= 0 {
                debug!("ipv4: reassembly of id {:#06x} timed out", frag.id);
                return false;
            }
            true
        });
    }
}

impl Default for FragCache {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_fragment(frag: &mut IpFrag, pkb: PacketBuffer) -> RxResult {
    if frag.is_complete() {
        debug!("ipv4: fragment for completed packet, retransmission dropped");
        return Err(RxError::InvalidContent);
    }
    let (more_frag, offset, hlen, dlen) = {
        let ip_pkg =
            Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..]).ok_or(RxError::InvalidLength)?;
        let hlen = usize::from(ip_pkg.get_header_length()) * 4;
        let total_len = ip_pkg.get_total_length() as usize;
        (
            ip_pkg.get_flags() & MORE_FRAGMENTS != 0,
            usize::from(ip_pkg.get_fragment_offset()) * 8,
            hlen,
            total_len - hlen,
        )
    };

    // Every fragment of one packet must agree on the header length.
    if frag.hlen != 0 && frag.hlen != hlen {
        return Err(RxError::InvalidContent);
    }
    frag.hlen = hlen;

    // Position scan from the end; the list stays ordered by offset.
    let mut insert_at = 0;
    let mut prev: Option<&Fragment> = None;
    for (i, existing) in frag.fragments.iter().enumerate().rev() {
        if existing.offset == offset {
            debug!("ipv4: duplicate fragment at offset {}, dropped", offset);
            return Err(RxError::InvalidContent);
        }
        if existing.offset < offset {
            insert_at = i + 1;
            prev = Some(existing);
            break;
        }
    }
    if let Some(prev) = prev {
        if prev.offset + prev.dlen > offset {
            debug!("ipv4: overlapping fragment at offset {}, dropped", offset);
            return Err(RxError::InvalidContent);
        }
    }

    if !more_frag {
        if frag.flags & LAST_IN != 0 {
            debug!("ipv4: duplicate last fragment, dropped");
            return Err(RxError::InvalidContent);
        }
        frag.flags |= LAST_IN;
        frag.size = offset + dlen;
    }
    if offset == 0 {
        frag.flags |= FIRST_IN;
    }

    frag.fragments.insert(insert_at, Fragment { offset, dlen, pkb });
    frag.rsize += dlen;
    if frag.flags & FIRST_IN != 0 && frag.flags & LAST_IN != 0 && frag.rsize == frag.size {
        frag.flags |= COMPLETE;
    }
    Ok(())
}

/// First fragment's Ethernet and IP header, all data payloads in
/// order, length patched, fragment fields cleared, id zeroed.
fn rebuild(frag: IpFrag) -> Result<PacketBuffer, RxError> {
    let total_len = frag.hlen + frag.size;
    if total_len > u16::MAX as usize {
        return Err(RxError::InvalidLength);
    }
    let mut fragments = frag.fragments.into_iter();
    let first = fragments.next().ok_or(RxError::InvalidContent)?;
    let mut pkb = first.pkb;
    for fragment in fragments {
        pkb.data
            .extend_from_slice(&fragment.pkb.data[ETHERNET_HEADER_LEN + frag.hlen..]);
    }
    {
        let mut ip_pkg = MutableIpv4Packet::new(&mut pkb.data[ETHERNET_HEADER_LEN..])
            .ok_or(RxError::InvalidLength)?;
        ip_pkg.set_total_length(total_len as u16);
        ip_pkg.set_flags(NO_FLAGS);
        ip_pkg.set_fragment_offset(0);
        ip_pkg.set_identification(0);
        let csum = checksum(&ip_pkg.to_immutable());
        ip_pkg.set_checksum(csum);
    }
    Ok(pkb)
}
