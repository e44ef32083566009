//! Segment text handling: in-order delivery into the receive byte
//! buffer, the out-of-order queue, and the windowed send path.

use std::sync::Arc;

use log::debug;

use super::segment::{TcpSegment, TCP_HEADER_LEN};
use super::sock::{Tcb, TcpSock, TcpState, F_ACK_LATER, F_PUSH, ReassSegment};
use super::timer::{TimerKind, TCP_PERSIST_TIMEOUT};
use super::Tcp;
use crate::device::DEFAULT_MTU;
use crate::ipv4::IPV4_HEADER_LEN;
use crate::socket::SocketError;

/// Drops the part of `segment` that precedes `rcv_nxt`. `false`
/// means the segment ends at or before `rcv_nxt` and carries nothing
/// new.
fn trim_head(rcv_nxt: u32, segment: &mut TcpSegment) -> bool {
    if segment.seqn >= rcv_nxt {
        return true;
    }
    let stale = (rcv_nxt - segment.seqn) as usize;
    if stale >= segment.dlen {
        return false;
    }
    segment.text.drain(..stale);
    segment.dlen -= stale;
    segment.seqn = rcv_nxt;
    true
}

fn write_buf(sock: &TcpSock, tcb: &mut Tcb, data: &[u8]) {
    sock.rcv_buf.write(data);
    tcb.rcv_wnd = tcb.rcv_wnd.saturating_sub(data.len() as u32);
    tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(data.len() as u32);
}

impl Tcp {
    /// Text arrival in ESTABLISHED/FIN_WAIT_1/FIN_WAIT_2. The caller
    /// holds the socket lock.
    pub(crate) fn recv_text(&self, sock: &Arc<TcpSock>, tcb: &mut Tcb, segment: &mut TcpSegment) {
        if tcb.rcv_wnd == 0 {
            debug!("tcp: text while receive window is closed, dropped");
            return;
        }
        if !trim_head(tcb.rcv_nxt, segment) {
            debug!("tcp: wholly stale text, dropped");
            return;
        }
        if segment.seqn == tcb.rcv_nxt && tcb.rcv_reass.is_empty() {
            let text = std::mem::take(&mut segment.text);
            write_buf(sock, tcb, &text);
            if segment.hdr.psh() {
                tcb.flags |= F_PUSH | F_ACK_LATER;
            }
        } else {
            self.reass_text(sock, tcb, segment);
        }
        if tcb.flags & F_PUSH != 0 {
            sock.recv_wait.wake_up();
        }
    }

    /// Out-of-order path: ordered insert, overlap trimmed against
    /// both neighbors, then the head of the queue drained while it
    /// lines up with `rcv_nxt`.
    fn reass_text(&self, sock: &Arc<TcpSock>, tcb: &mut Tcb, segment: &mut TcpSegment) {
        let pos = tcb
            .rcv_reass
            .iter()
            .position(|s| s.seqn > segment.seqn)
            .unwrap_or(tcb.rcv_reass.len());

        if pos > 0 {
            let pred = &tcb.rcv_reass[pos - 1];
            let pred_end = pred.seqn.wrapping_add(pred.text.len() as u32);
            if pred_end > segment.seqn {
                let overlap = (pred_end - segment.seqn) as usize;
                if overlap >= segment.dlen {
                    return;
                }
                segment.text.drain(..overlap);
                segment.dlen -= overlap;
                segment.seqn = pred_end;
            }
        }
        if pos < tcb.rcv_reass.len() {
            let succ_seqn = tcb.rcv_reass[pos].seqn;
            let end = segment.seqn.wrapping_add(segment.dlen as u32);
            if end > succ_seqn {
                let keep = (succ_seqn - segment.seqn) as usize;
                segment.text.truncate(keep);
                segment.dlen = keep;
            }
        }
        if segment.dlen == 0 {
            return;
        }
        let text = std::mem::take(&mut segment.text);
        tcb.rcv_reass.insert(
            pos,
            ReassSegment {
                seqn: segment.seqn,
                text,
            },
        );

        let mut delivered = false;
        while !tcb.rcv_reass.is_empty() && tcb.rcv_reass[0].seqn == tcb.rcv_nxt {
            let seg = tcb.rcv_reass.remove(0);
            write_buf(sock, tcb, &seg.text);
            delivered = true;
        }
        if delivered {
            tcb.flags |= F_PUSH | F_ACK_LATER;
        }
    }

    /// The send path behind `write`: the payload is clamped to the
    /// peer's window and cut into MTU-sized PSH+ACK segments. When
    /// the window cannot take everything the persist timer is armed
    /// and the tail is dropped (there is no retransmission queue).
    pub(crate) fn send_buf(&self, sock: &Arc<TcpSock>, data: &[u8]) -> Result<usize, SocketError> {
        let mut tcb = sock.tcb();
        match tcb.state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynRecv => {
                return Err(SocketError::NotConnected)
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::LastAck
            | TcpState::Closing
            | TcpState::TimeWait => return Err(SocketError::Closed),
            TcpState::Established | TcpState::CloseWait => {}
        }

        if tcb.rtdst.is_none() {
            tcb.rtdst = self.out.ipv4().routes().lookup(tcb.addr.dst_ip);
        }
        let mtu = tcb
            .rtdst
            .as_ref()
            .map(|entry| entry.dev.mtu())
            .unwrap_or(DEFAULT_MTU);
        let segment_max = mtu - IPV4_HEADER_LEN - TCP_HEADER_LEN;

        let window_len = data.len().min(tcb.snd_wnd as usize);
        let mut sent = 0;
        while sent < window_len {
            let chunk = (window_len - sent).min(segment_max);
            let seqn = tcb.snd_nxt;
            tcb.snd_nxt = tcb.snd_nxt.wrapping_add(chunk as u32);
            tcb.snd_wnd -= chunk as u32;
            self.out
                .send_data(&mut tcb, seqn, data[sent..sent + chunk].to_vec());
            sent += chunk;
        }
        if window_len < data.len() {
            debug!(
                "tcp: window exhausted, {} of {} bytes sent",
                sent,
                data.len()
            );
            drop(tcb);
            self.timers
                .set(sock.clone(), TimerKind::Persist, TCP_PERSIST_TIMEOUT);
        }
        Ok(sent)
    }
}
