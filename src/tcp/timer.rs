//! The TCP timer wheel: one driver ticking every 200 ms over
//! `(socket, kind)` entries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use super::sock::{TcpSock, TcpState};
use super::Tcp;

pub const TCP_TIMER_INTERVAL: Duration = Duration::from_millis(200);

const TCP_MSL_SECS: u64 = 1;
pub const TCP_TIMEWAIT_TIMEOUT: Duration = Duration::from_secs(2 * TCP_MSL_SECS);
pub const TCP_FIN_WAIT2_TIMEOUT: Duration = Duration::from_secs(2 * TCP_MSL_SECS);
pub const TCP_PERSIST_TIMEOUT: Duration = Duration::from_secs(2);
pub const TCP_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// An establish timer whose doubled period passes this gives up.
const TCP_CONNECT_GIVEUP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Establish,
    Retransmission,
    DelayedAck,
    Persist,
    KeepAlive,
    FinWait2,
    TimeWait,
}

struct TimerEntry {
    sock: Arc<TcpSock>,
    kind: TimerKind,
    remaining: Duration,
    period: Duration,
}

pub struct TcpTimers {
    entries: Mutex<Vec<TimerEntry>>,
}

impl TcpTimers {
    pub fn new() -> TcpTimers {
        TcpTimers {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Arms `(sock, kind)`, replacing an already-armed entry of the
    /// same kind.
    pub fn set(&self, sock: Arc<TcpSock>, kind: TimerKind, timeout: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| !(entry.kind == kind && Arc::ptr_eq(&entry.sock, &sock)));
        entries.push(TimerEntry {
            sock,
            kind,
            remaining: timeout,
            period: timeout,
        });
    }

    pub fn unset(&self, sock: &Arc<TcpSock>, kind: TimerKind) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| !(entry.kind == kind && Arc::ptr_eq(&entry.sock, sock)));
    }

    pub fn unset_all(&self, sock: &Arc<TcpSock>) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| !Arc::ptr_eq(&entry.sock, sock));
    }

    /// One 200 ms tick. Expired entries run their action; periodic
    /// ones re-arm themselves, terminal ones disappear.
    pub(crate) fn tick(&self, tcp: &Tcp) {
        let mut due = std::mem::take(&mut *self.entries.lock().unwrap());
        let mut survivors = Vec::with_capacity(due.len());
        let mut torn_down: Vec<Arc<TcpSock>> = Vec::new();

        for mut entry in due.drain(..) {
            entry.remaining = entry.remaining.saturating_sub(TCP_TIMER_INTERVAL);
            if !entry.remaining.is_zero() {
                survivors.push(entry);
                continue;
            }
            match entry.kind {
                TimerKind::Establish => {
                    let mut tcb = entry.sock.tcb();
                    if tcb.state != TcpState::SynSent {
                        continue;
                    }
                    entry.period *= 2;
                    if entry.period > TCP_CONNECT_GIVEUP {
                        debug!("tcp: connection establish timed out");
                        drop(tcb);
                        entry.sock.wait_connect.exit();
                        continue;
                    }
                    debug!("tcp: re-sending SYN, next timeout {:?}", entry.period);
                    tcp.out.send_syn(&mut tcb);
                    drop(tcb);
                    entry.remaining = entry.period;
                    survivors.push(entry);
                }
                TimerKind::TimeWait | TimerKind::FinWait2 => {
                    debug!("tcp: {:?} expired, closing", entry.kind);
                    {
                        let mut tcb = entry.sock.tcb();
                        tcb.state = TcpState::Closed;
                    }
                    tcp.manager.unhash(&entry.sock);
                    tcp.manager.unbind(&entry.sock);
                    entry.sock.recv_wait.exit();
                    entry.sock.wait_connect.exit();
                    entry.sock.wait_accept.exit();
                    torn_down.push(entry.sock.clone());
                }
                TimerKind::Persist => {
                    let mut tcb = entry.sock.tcb();
                    if tcb.snd_wnd == 0 {
                        debug!("tcp: persist probe");
                        tcp.out.send_ack(&mut tcb, None);
                        drop(tcb);
                        entry.remaining = entry.period;
                        survivors.push(entry);
                    }
                }
                TimerKind::KeepAlive => {
                    let mut tcb = entry.sock.tcb();
                    if tcb.state == TcpState::Established {
                        tcp.out.send_ack(&mut tcb, None);
                        drop(tcb);
                        entry.remaining = entry.period;
                        survivors.push(entry);
                    }
                }
                // Reserved kinds; nothing behind them yet.
                TimerKind::DelayedAck | TimerKind::Retransmission => {}
            }
        }

        survivors.retain(|entry| {
            !torn_down
                .iter()
                .any(|sock| Arc::ptr_eq(sock, &entry.sock))
        });
        self.entries.lock().unwrap().extend(survivors);
    }
}

impl Default for TcpTimers {
    fn default() -> Self {
        Self::new()
    }
}
