//! The per-segment transition function of the TCP state machine.

use std::sync::Arc;

use log::{debug, warn};

use super::segment::TcpSegment;
use super::sock::{SockAddr, Tcb, TcpSock, TcpState, F_ACK_LATER, F_ACK_NOW, F_PUSH};
use super::timer::{
    TimerKind, TCP_FIN_WAIT2_TIMEOUT, TCP_KEEPALIVE_TIMEOUT, TCP_TIMEWAIT_TIMEOUT,
};
use super::Tcp;

impl Tcp {
    /// Runs one received segment against the socket it was looked up
    /// for.
    pub(crate) fn process(self: &Arc<Self>, sock: &Arc<TcpSock>, segment: &mut TcpSegment) {
        let mut tcb = sock.tcb();
        match tcb.state {
            TcpState::Closed => {
                drop(tcb);
                if !segment.hdr.rst() {
                    self.out.send_reset(segment);
                }
            }
            TcpState::Listen => self.on_listen(sock, &mut tcb, segment),
            TcpState::SynSent => self.on_syn_sent(sock, &mut tcb, segment),
            _ => self.on_connected(sock, &mut tcb, segment),
        }
    }

    /// LISTEN: ignore RST, reset a stray ACK, open a child for SYN.
    fn on_listen(self: &Arc<Self>, sock: &Arc<TcpSock>, tcb: &mut Tcb, segment: &mut TcpSegment) {
        if segment.hdr.rst() {
            return;
        }
        if segment.hdr.ack() {
            self.out.send_reset(segment);
            return;
        }
        if !segment.hdr.syn() {
            return;
        }

        let child = TcpSock::new();
        {
            let mut child_tcb = child.tcb();
            child_tcb.state = TcpState::SynRecv;
            child_tcb.addr = SockAddr {
                src_ip: segment.dst_ip,
                src_port: segment.hdr.dst_port,
                dst_ip: segment.src_ip,
                dst_port: segment.hdr.src_port,
            };
            child_tcb.parent = Some(Arc::downgrade(sock));
            child_tcb.irs = segment.seqn;
            child_tcb.iss = self.iss();
            child_tcb.rcv_nxt = segment.seqn.wrapping_add(1);
        }
        if !self.manager.hash(&child) {
            debug!("tcp: colliding half-open connection, SYN dropped");
            return;
        }
        tcb.listen_list.push(child.clone());

        let mut child_tcb = child.tcb();
        self.out.send_synack(&mut child_tcb, segment);
        child_tcb.snd_una = child_tcb.iss;
        child_tcb.snd_nxt = child_tcb.iss.wrapping_add(1);
    }

    /// SYN_SENT: the second step of an active open, or a
    /// simultaneous open.
    fn on_syn_sent(&self, sock: &Arc<TcpSock>, tcb: &mut Tcb, segment: &mut TcpSegment) {
        if segment.hdr.ack()
            && !(tcb.snd_una < segment.ackn && segment.ackn <= tcb.snd_nxt)
        {
            self.out.send_reset(segment);
            return;
        }
        if segment.hdr.rst() {
            if segment.hdr.ack() {
                tcb.state = TcpState::Closed;
                sock.wait_connect.exit();
            }
            return;
        }
        if !segment.hdr.syn() {
            return;
        }
        tcb.irs = segment.seqn;
        tcb.rcv_nxt = segment.seqn.wrapping_add(1);
        if segment.hdr.ack() {
            tcb.snd_una = segment.ackn;
        }
        if tcb.snd_una > tcb.iss {
            // Our SYN is acknowledged: the handshake is done.
            tcb.state = TcpState::Established;
            self.update_window(tcb, segment);
            self.out.send_ack(tcb, Some(segment));
            self.timers
                .set(sock.clone(), TimerKind::KeepAlive, TCP_KEEPALIVE_TIMEOUT);
            sock.wait_connect.wake_up();
            debug!("tcp: active open complete");
        } else {
            // Plain SYN: both ends opened at once.
            tcb.state = TcpState::SynRecv;
            self.out.send_synack(tcb, segment);
        }
    }

    /// Everything past the opening handshakes.
    fn on_connected(
        self: &Arc<Self>,
        sock: &Arc<TcpSock>,
        tcb: &mut Tcb,
        segment: &mut TcpSegment,
    ) {
        if !self.seq_check(tcb, segment) {
            if segment.hdr.rst() {
                return;
            }
            // Out of window: tell the peer where the window is.
            tcb.flags |= F_ACK_NOW;
            self.flush_ack(tcb, segment);
            return;
        }

        if segment.hdr.rst() {
            self.on_reset(sock, tcb);
            return;
        }

        // Only RST and SYN travel without ACK.
        if !segment.hdr.ack() {
            return;
        }

        if tcb.state == TcpState::SynRecv {
            // Third step of a passive open.
            if tcb.snd_una < segment.ackn && segment.ackn <= tcb.snd_nxt {
                match tcb.parent.as_ref().and_then(|parent| parent.upgrade()) {
                    Some(parent) => {
                        let mut parent_tcb = parent.tcb();
                        if parent_tcb.state != TcpState::Listen {
                            debug!("tcp: listener is gone, handshake dropped");
                            return;
                        }
                        if parent_tcb.accept_list.len() >= parent_tcb.backlog {
                            debug!("tcp: accept backlog full, handshake dropped");
                            return;
                        }
                        parent_tcb.listen_list.retain(|s| !Arc::ptr_eq(s, sock));
                        parent_tcb.accept_list.insert(0, sock.clone());
                        tcb.snd_una = segment.ackn;
                        self.update_window(tcb, segment);
                        tcb.state = TcpState::Established;
                        drop(parent_tcb);
                        parent.wait_accept.wake_up();
                        debug!("tcp: passive open complete");
                    }
                    None => {
                        // Simultaneous open has no listener to queue on.
                        tcb.snd_una = segment.ackn;
                        self.update_window(tcb, segment);
                        tcb.state = TcpState::Established;
                        sock.wait_connect.wake_up();
                    }
                }
                self.timers
                    .set(sock.clone(), TimerKind::KeepAlive, TCP_KEEPALIVE_TIMEOUT);
            } else {
                self.out.send_reset(segment);
                return;
            }
        }

        match tcb.state {
            TcpState::Established
            | TcpState::CloseWait
            | TcpState::LastAck
            | TcpState::FinWait1
            | TcpState::Closing => {
                if tcb.snd_una < segment.ackn && segment.ackn <= tcb.snd_nxt {
                    tcb.snd_una = segment.ackn;
                    match tcb.state {
                        TcpState::FinWait1 => {
                            // Our FIN is acknowledged; wait out the
                            // peer's, but not forever.
                            tcb.state = TcpState::FinWait2;
                            self.timers.set(
                                sock.clone(),
                                TimerKind::FinWait2,
                                TCP_FIN_WAIT2_TIMEOUT,
                            );
                        }
                        TcpState::Closing => {
                            tcb.state = TcpState::TimeWait;
                            self.timers.set(
                                sock.clone(),
                                TimerKind::TimeWait,
                                TCP_TIMEWAIT_TIMEOUT,
                            );
                            return;
                        }
                        TcpState::LastAck => {
                            tcb.state = TcpState::Closed;
                            self.manager.unhash(sock);
                            self.manager.unbind(sock);
                            self.timers.unset_all(sock);
                            return;
                        }
                        _ => {}
                    }
                } else if segment.ackn > tcb.snd_nxt {
                    warn!(
                        "tcp: ack {} beyond snd_nxt {}, dropped",
                        segment.ackn, tcb.snd_nxt
                    );
                    return;
                }
                // An old or duplicate ACK changes no state.
                self.update_window(tcb, segment);
            }
            _ => {}
        }

        if matches!(
            tcb.state,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        ) && segment.hdr.psh()
            && segment.dlen > 0
        {
            self.recv_text(sock, tcb, segment);
        }

        if segment.hdr.fin() {
            match tcb.state {
                TcpState::SynRecv | TcpState::Established => {
                    tcb.state = TcpState::CloseWait;
                    tcb.flags |= F_PUSH;
                    // End of stream: release blocked readers, who
                    // will find CLOSE_WAIT and drain what is left.
                    sock.recv_wait.exit();
                }
                TcpState::FinWait1 => {
                    tcb.state = TcpState::Closing;
                }
                TcpState::FinWait2 => {
                    tcb.state = TcpState::TimeWait;
                    self.timers.unset(sock, TimerKind::FinWait2);
                    self.timers
                        .set(sock.clone(), TimerKind::TimeWait, TCP_TIMEWAIT_TIMEOUT);
                    sock.recv_wait.exit();
                }
                // A duplicate FIN.
                TcpState::CloseWait | TcpState::Closing | TcpState::LastAck => return,
                _ => {}
            }
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
            tcb.flags |= F_ACK_NOW;
        }

        self.flush_ack(tcb, segment);
    }

    /// The incoming segment must land inside the receive window.
    fn seq_check(&self, tcb: &Tcb, segment: &TcpSegment) -> bool {
        let rcv_end = tcb.rcv_nxt.wrapping_add(tcb.rcv_wnd);
        if segment.seqn < rcv_end && segment.lastseqn >= tcb.rcv_nxt {
            return true;
        }
        warn!(
            "tcp: seq check failed: seqn={} lastseqn={} rcv_nxt={} rcv_wnd={}",
            segment.seqn, segment.lastseqn, tcb.rcv_nxt, tcb.rcv_wnd
        );
        false
    }

    /// Peer reset: everything comes down.
    fn on_reset(&self, sock: &Arc<TcpSock>, tcb: &mut Tcb) {
        debug!("tcp: connection reset by peer");
        if tcb.state == TcpState::SynRecv {
            match tcb.parent.as_ref().and_then(|parent| parent.upgrade()) {
                Some(parent) => {
                    parent.tcb().listen_list.retain(|s| !Arc::ptr_eq(s, sock));
                    self.manager.unhash(sock);
                }
                None => {
                    sock.wait_connect.wake_up();
                }
            }
            return;
        }
        tcb.state = TcpState::Closed;
        self.manager.unhash(sock);
        self.manager.unbind(sock);
        self.timers.unset_all(sock);
        sock.recv_wait.exit();
        sock.wait_connect.exit();
        sock.wait_accept.exit();
    }

    fn update_window(&self, tcb: &mut Tcb, segment: &TcpSegment) {
        tcb.snd_wnd = segment.wnd;
        tcb.snd_wl1 = segment.seqn;
        tcb.snd_wl2 = segment.ackn;
    }

    fn flush_ack(&self, tcb: &mut Tcb, segment: &TcpSegment) {
        if tcb.flags & (F_ACK_NOW | F_ACK_LATER) != 0 {
            self.out.send_ack(tcb, Some(segment));
        }
    }
}
