//! The ARP neighbor cache: asynchronous resolution with per-entry
//! pending packet queues, request retries and aging.
//!
//! The send path never blocks on resolution. A miss creates a
//! `Waiting` entry, queues the outgoing frame behind it and
//! broadcasts a request; the 1 Hz timer retries the request up to
//! [`MAX_RETRY`] times; an incoming reply (or request) flushes the
//! queue with the learned MAC stamped in.

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use pnet::packet::ethernet::{EtherType, EtherTypes, MutableEthernetPacket};
use pnet::util::MacAddr;

use crate::device::NetDevice;
use crate::pkb::PacketBuffer;

mod arp_rx;
mod arp_tx;

pub use self::arp_rx::ArpRx;
pub use self::arp_tx::{send_reply, send_request};

pub const MAX_RETRY: i32 = 5;
pub const MAX_TTL: i32 = 600;
pub const MAX_PENDING_PACKETS: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpState {
    Waiting,
    Resolved,
    Static,
}

pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: Option<MacAddr>,
    pub dev: Arc<NetDevice>,
    pub retry_count: i32,
    pub ttl: i32,
    pub state: ArpState,
    pub proto: EtherType,
    pending: VecDeque<PacketBuffer>,
}

impl ArpEntry {
    fn waiting(ip: Ipv4Addr, dev: Arc<NetDevice>) -> ArpEntry {
        ArpEntry {
            ip,
            mac: None,
            dev,
            retry_count: MAX_RETRY,
            ttl: MAX_TTL,
            state: ArpState::Waiting,
            proto: EtherTypes::Ipv4,
            pending: VecDeque::new(),
        }
    }

    fn resolved(ip: Ipv4Addr, mac: MacAddr, dev: Arc<NetDevice>, proto: EtherType) -> ArpEntry {
        ArpEntry {
            ip,
            mac: Some(mac),
            dev,
            retry_count: 0,
            ttl: MAX_TTL,
            state: ArpState::Resolved,
            proto,
            pending: VecDeque::new(),
        }
    }
}

/// What [`ArpCache::resolve_output`] decided about an outgoing frame.
pub enum Resolution {
    /// The neighbor is known; stamp this MAC and transmit.
    Send(PacketBuffer, MacAddr),
    /// The frame was queued behind a pending (or fresh) request.
    Queued,
}

pub struct ArpCache {
    entries: Mutex<Vec<ArpEntry>>,
}

impl ArpCache {
    pub fn new() -> ArpCache {
        ArpCache {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Linear scan over `(protocol, ip)`; only entries that carry a
    /// usable MAC answer.
    pub fn lookup_resolved(&self, proto: EtherType, ip: Ipv4Addr) -> Option<MacAddr> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|entry| {
                entry.proto == proto
                    && entry.ip == ip
                    && matches!(entry.state, ArpState::Resolved | ArpState::Static)
            })
            .and_then(|entry| entry.mac)
    }

    pub fn state_of(&self, proto: EtherType, ip: Ipv4Addr) -> Option<ArpState> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .find(|entry| entry.proto == proto && entry.ip == ip)
            .map(|entry| entry.state)
    }

    /// Pins a neighbor that the timer never ages out.
    pub fn insert_static(&self, ip: Ipv4Addr, mac: MacAddr, dev: Arc<NetDevice>) {
        let mut entry = ArpEntry::resolved(ip, mac, dev, EtherTypes::Ipv4);
        entry.state = ArpState::Static;
        self.entries.lock().unwrap().push(entry);
    }

    /// The send-path entry point: decide whether `pkb` can go out to
    /// `next_hop` on `dev` right now or has to wait for resolution.
    pub fn resolve_output(
        &self,
        dev: &Arc<NetDevice>,
        next_hop: Ipv4Addr,
        pkb: PacketBuffer,
    ) -> Resolution {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.proto == EtherTypes::Ipv4 && entry.ip == next_hop);
        match entry {
            None => {
                let mut entry = ArpEntry::waiting(next_hop, dev.clone());
                entry.pending.push_back(pkb);
                arp_tx::send_request(dev, next_hop);
                entries.push(entry);
                Resolution::Queued
            }
            Some(entry) if entry.state == ArpState::Waiting => {
                if entry.pending.len() < MAX_PENDING_PACKETS {
                    entry.pending.push_back(pkb);
                } else {
                    warn!("arp: pending queue for {} full, frame dropped", next_hop);
                }
                Resolution::Queued
            }
            Some(entry) => match entry.mac {
                Some(mac) => Resolution::Send(pkb, mac),
                None => Resolution::Queued,
            },
        }
    }

    /// A neighbor proved itself at `mac`. Updates or (for requests)
    /// inserts the entry, flushes pending frames with the source and
    /// destination MACs rewritten, resolves and re-arms the TTL.
    pub fn learn(&self, indev: &Arc<NetDevice>, proto: EtherType, ip: Ipv4Addr, mac: MacAddr, is_request: bool) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|entry| entry.proto == proto && entry.ip == ip);
        let entry = match entry {
            Some(entry) => entry,
            None if is_request => {
                debug!("arp: learned {} at {}", ip, mac);
                entries.push(ArpEntry::resolved(ip, mac, indev.clone(), proto));
                return;
            }
            None => return,
        };
        entry.mac = Some(mac);
        if entry.state == ArpState::Waiting {
            while let Some(mut pkb) = entry.pending.pop_front() {
                if let Some(mut eth_pkg) = MutableEthernetPacket::new(&mut pkb.data) {
                    eth_pkg.set_destination(mac);
                    eth_pkg.set_source(indev.mac());
                }
                if let Err(e) = entry.dev.send(pkb) {
                    warn!("arp: flushing pending frame to {} failed: {}", ip, e);
                }
            }
        }
        entry.state = ArpState::Resolved;
        entry.ttl = MAX_TTL;
    }

    /// The 1 Hz tick: ages resolved entries out after [`MAX_TTL`],
    /// re-broadcasts requests for waiting entries and drops them once
    /// the retries are spent.
    pub fn tick(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain_mut(|entry| match entry.state {
            ArpState::Waiting => {
                if entry.retry_count <= 0 {
                    debug!("arp: resolution of {} gave up", entry.ip);
                    return false;
                }
                entry.retry_count -= 1;
                entry.ttl = MAX_TTL;
                arp_tx::send_request(&entry.dev, entry.ip);
                true
            }
            ArpState::Resolved => {
                entry.ttl -= 1;
                entry.ttl > 0
            }
            ArpState::Static => true,
        });
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArpCache {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            fmt,
            "{:<12}{:<12}{:<20}{:<16}",
            "State", "Timeout(s)", "HWaddress", "Address"
        )?;
        for entry in self.entries.lock().unwrap().iter() {
            writeln!(
                fmt,
                "{:<12}{:<12}{:<20}{:<16}",
                format!("{:?}", entry.state),
                entry.ttl,
                entry
                    .mac
                    .map(|mac| mac.to_string())
                    .unwrap_or_else(|| "(incomplete)".to_owned()),
                entry.ip
            )?;
        }
        Ok(())
    }
}
