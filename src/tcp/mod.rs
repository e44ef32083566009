//! The TCP engine: wire codec, per-connection state, the RFC
//! 793-shaped state machine, segment output, reassembly and timers.

use std::sync::Arc;

use log::debug;
use pnet::packet::ipv4::Ipv4Packet;

use crate::device::ETHERNET_HEADER_LEN;
use crate::pkb::PacketBuffer;
use crate::socket::SocketError;
use crate::{RxError, RxResult};

pub mod segment;
mod sock;
mod state;
mod text;
mod timer;

mod output;

pub use self::output::TcpOut;
pub use self::segment::{TcpHdr, TcpSegment, TCP_HEADER_LEN};
pub use self::sock::{
    SockAddr, TcpSock, TcpSockManager, TcpState, TCP_DEFAULT_WINDOW, TCP_MAX_BACKLOG,
};
pub use self::timer::{TcpTimers, TimerKind, TCP_CONNECT_TIMEOUT, TCP_TIMER_INTERVAL};

use self::sock::TcpState as St;

/// The engine: socket tables, segment output and the timer wheel.
/// One per stack.
pub struct Tcp {
    pub manager: TcpSockManager,
    pub out: TcpOut,
    pub timers: TcpTimers,
}

impl Tcp {
    pub fn new(out: TcpOut) -> Tcp {
        Tcp {
            manager: TcpSockManager::new(),
            out,
            timers: TcpTimers::new(),
        }
    }

    /// Initial send sequence. Fixed so connection traces are
    /// reproducible; swap in a clocked generator for real use.
    pub(crate) fn iss(&self) -> u32 {
        0
    }

    /// Receive entry point: parse, verify the pseudo-header
    /// checksum, find the socket, run the state machine. A segment
    /// for no socket is answered with RST unless it was one.
    pub fn recv(self: &Arc<Self>, pkb: PacketBuffer) -> RxResult {
        let (src_ip, dst_ip, region) = {
            let ip_pkg = Ipv4Packet::new(&pkb.data[ETHERNET_HEADER_LEN..])
                .ok_or(RxError::InvalidLength)?;
            let hlen = usize::from(ip_pkg.get_header_length()) * 4;
            let total_len = ip_pkg.get_total_length() as usize;
            let region_start = ETHERNET_HEADER_LEN + hlen;
            let region_end = ETHERNET_HEADER_LEN + total_len;
            if region_end > pkb.data.len() || region_end - region_start < TCP_HEADER_LEN {
                return Err(RxError::InvalidLength);
            }
            (
                ip_pkg.get_source(),
                ip_pkg.get_destination(),
                pkb.data[region_start..region_end].to_vec(),
            )
        };
        let hdr = TcpHdr::parse(&region).ok_or(RxError::InvalidLength)?;
        if hdr.checksum != segment::pseudo_checksum(&region, src_ip, dst_ip) {
            return Err(RxError::InvalidChecksum);
        }
        debug!(
            "tcp: recv {}:{} -> {}:{} seqn {} ackn {} win {} [{}]",
            src_ip,
            hdr.src_port,
            dst_ip,
            hdr.dst_port,
            hdr.seqn,
            hdr.ackn,
            hdr.window,
            hdr.flag_names()
        );

        let sock = self
            .manager
            .lookup(dst_ip, hdr.dst_port, src_ip, hdr.src_port);
        let mut seg = TcpSegment::new(src_ip, dst_ip, hdr);
        match sock {
            Some(sock) => {
                self.process(&sock, &mut seg);
                Ok(())
            }
            None => {
                debug!("tcp: no socket for segment");
                if !seg.hdr.rst() {
                    self.out.send_reset(&seg);
                }
                Ok(())
            }
        }
    }

    /// Active open. Blocks until the handshake finishes or fails.
    pub fn connect(
        self: &Arc<Self>,
        sock: &Arc<TcpSock>,
        dst_ip: std::net::Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), SocketError> {
        {
            let mut tcb = sock.tcb();
            if tcb.addr.src_port == 0 {
                return Err(SocketError::NotBound);
            }
            if tcb.addr.dst_port != 0 {
                return Err(SocketError::AlreadyConnected);
            }
            tcb.addr.dst_ip = dst_ip;
            tcb.addr.dst_port = dst_port;
            tcb.state = St::SynSent;
            tcb.iss = self.iss();
            tcb.snd_una = tcb.iss;
            tcb.snd_nxt = tcb.iss.wrapping_add(1);
        }
        if !self.manager.hash(sock) {
            let mut tcb = sock.tcb();
            tcb.state = St::Closed;
            tcb.addr.dst_ip = std::net::Ipv4Addr::UNSPECIFIED;
            tcb.addr.dst_port = 0;
            return Err(SocketError::AlreadyConnected);
        }
        self.timers
            .set(sock.clone(), TimerKind::Establish, TCP_CONNECT_TIMEOUT);
        {
            let mut tcb = sock.tcb();
            self.out.send_syn(&mut tcb);
        }
        if !sock.wait_connect.sleep_on() {
            self.timers.unset(sock, TimerKind::Establish);
            self.teardown(sock);
            return Err(SocketError::ConnectionReset);
        }
        self.timers.unset(sock, TimerKind::Establish);
        if sock.state() != St::Established {
            self.teardown(sock);
            return Err(SocketError::ConnectionReset);
        }
        Ok(())
    }

    /// Passive open. Blocks until a completed connection is queued.
    pub fn accept(self: &Arc<Self>, sock: &Arc<TcpSock>) -> Result<Arc<TcpSock>, SocketError> {
        loop {
            if !sock.wait_accept.sleep_on() {
                return Err(SocketError::Closed);
            }
            let mut tcb = sock.tcb();
            if let Some(child) = tcb.accept_list.pop() {
                child.tcb().parent = None;
                return Ok(child);
            }
        }
    }

    pub fn listen(&self, sock: &Arc<TcpSock>, backlog: usize) -> Result<(), SocketError> {
        let was_closed = {
            let mut tcb = sock.tcb();
            if tcb.addr.src_port == 0 {
                return Err(SocketError::NotBound);
            }
            if backlog > TCP_MAX_BACKLOG {
                return Err(SocketError::InvalidInput);
            }
            if tcb.state != St::Closed && tcb.state != St::Listen {
                return Err(SocketError::InvalidInput);
            }
            let was_closed = tcb.state == St::Closed;
            tcb.backlog = backlog;
            tcb.state = St::Listen;
            was_closed
        };
        if was_closed {
            self.manager.hash(sock);
        }
        Ok(())
    }

    /// Active close with the transitions of RFC 793, then release of
    /// every wait a blocked caller might be parked on.
    pub fn close(self: &Arc<Self>, sock: &Arc<TcpSock>) {
        {
            let mut tcb = sock.tcb();
            match tcb.state {
                St::Closed => {}
                St::Listen => {
                    tcb.state = St::Closed;
                    drop(tcb);
                    self.manager.unhash(sock);
                    self.manager.unbind(sock);
                    sock.wait_accept.exit();
                    sock.wait_connect.exit();
                    sock.recv_wait.exit();
                    return;
                }
                St::SynRecv | St::SynSent => {}
                St::Established => {
                    tcb.state = St::FinWait1;
                    self.out.send_fin(&mut tcb);
                    tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
                }
                St::CloseWait => {
                    self.out.send_fin(&mut tcb);
                    tcb.state = St::LastAck;
                    tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
                }
                _ => {}
            }
        }
        sock.wait_accept.exit();
        sock.wait_connect.exit();
        sock.recv_wait.exit();
    }

    /// The blocking read behind the socket facade. `size` 0 drains
    /// whatever is buffered; an empty result is end-of-stream.
    pub fn recv_buf(&self, sock: &Arc<TcpSock>, size: usize) -> Result<Vec<u8>, SocketError> {
        loop {
            let state = sock.state();
            match state {
                St::Listen
                | St::SynRecv
                | St::SynSent
                | St::LastAck
                | St::Closing
                | St::TimeWait
                | St::Closed => return Err(SocketError::NotConnected),
                _ => {}
            }
            let data = sock.rcv_buf.read(size);
            if !data.is_empty() {
                let mut tcb = sock.tcb();
                tcb.rcv_wnd += data.len() as u32;
                return Ok(data);
            }
            if state == St::CloseWait {
                // Peer closed and the buffer is drained.
                return Ok(Vec::new());
            }
            if !sock.recv_wait.sleep_on() {
                if sock.state() == St::CloseWait {
                    let data = sock.rcv_buf.read(size);
                    let mut tcb = sock.tcb();
                    tcb.rcv_wnd += data.len() as u32;
                    return Ok(data);
                }
                return Err(SocketError::ConnectionReset);
            }
        }
    }

    fn teardown(self: &Arc<Self>, sock: &Arc<TcpSock>) {
        self.manager.unhash(sock);
        self.manager.unbind(sock);
        self.timers.unset_all(sock);
        sock.tcb().state = St::Closed;
    }
}
