//! Per-connection state and the three socket tables.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::debug;

use crate::routing::RouteEntry;
use crate::socket::SocketError;
use crate::util::Wait;

pub const TCP_MAX_BACKLOG: usize = 128;
pub const TCP_DEFAULT_WINDOW: u32 = 4096;

pub const LOCAL_PORT_RANGE_START: u16 = 1024;
pub const LOCAL_PORT_RANGE_END: u16 = 65534;

// Per-socket flag bits, cleared when the pending ACK goes out.
pub const F_PUSH: u8 = 0x01;
pub const F_ACK_NOW: u8 = 0x02;
pub const F_ACK_LATER: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynRecv,
    SynSent,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl Default for SockAddr {
    fn default() -> SockAddr {
        SockAddr {
            src_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            dst_port: 0,
        }
    }
}

/// The receive-side byte stream handed to `read`.
pub struct ByteBuffer {
    data: Mutex<VecDeque<u8>>,
}

impl ByteBuffer {
    fn new() -> ByteBuffer {
        ByteBuffer {
            data: Mutex::new(VecDeque::new()),
        }
    }

    pub fn write(&self, bytes: &[u8]) {
        self.data.lock().unwrap().extend(bytes);
    }

    /// Pops up to `size` bytes; `size` 0 drains everything buffered.
    pub fn read(&self, size: usize) -> Vec<u8> {
        let mut data = self.data.lock().unwrap();
        let take = if size == 0 { data.len() } else { size.min(data.len()) };
        data.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One entry of the out-of-order queue, ordered by `seqn` and
/// non-overlapping.
pub struct ReassSegment {
    pub seqn: u32,
    pub text: Vec<u8>,
}

/// The transmission control block proper. Everything in here is
/// guarded by the socket's mutex; the pipeline and the owning API
/// call are the only writers.
pub struct Tcb {
    pub addr: SockAddr,
    pub state: TcpState,
    pub flags: u8,

    pub backlog: usize,
    /// Children mid-handshake (SYN_RECV).
    pub listen_list: Vec<Arc<TcpSock>>,
    /// Children ready for `accept`.
    pub accept_list: Vec<Arc<TcpSock>>,
    /// Back-reference from a passive child to its listener.
    pub parent: Option<Weak<TcpSock>>,

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_up: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    pub iss: u32,

    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub rcv_up: u32,
    pub irs: u32,

    pub rcv_reass: Vec<ReassSegment>,
    pub rtdst: Option<Arc<RouteEntry>>,
}

impl Default for Tcb {
    fn default() -> Tcb {
        Tcb {
            addr: SockAddr::default(),
            state: TcpState::Closed,
            flags: 0,
            backlog: 0,
            listen_list: Vec::new(),
            accept_list: Vec::new(),
            parent: None,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_up: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            iss: 0,
            rcv_nxt: 0,
            rcv_wnd: TCP_DEFAULT_WINDOW,
            rcv_up: 0,
            irs: 0,
            rcv_reass: Vec::new(),
            rtdst: None,
        }
    }
}

pub struct TcpSock {
    pub rcv_buf: ByteBuffer,
    pub recv_wait: Wait,
    pub wait_accept: Wait,
    pub wait_connect: Wait,
    tcb: Mutex<Tcb>,
}

impl TcpSock {
    pub fn new() -> Arc<TcpSock> {
        Arc::new(TcpSock {
            rcv_buf: ByteBuffer::new(),
            recv_wait: Wait::new(),
            wait_accept: Wait::new(),
            wait_connect: Wait::new(),
            tcb: Mutex::new(Tcb::default()),
        })
    }

    pub fn tcb(&self) -> MutexGuard<'_, Tcb> {
        self.tcb.lock().unwrap()
    }

    pub fn state(&self) -> TcpState {
        self.tcb().state
    }

    pub fn addr(&self) -> SockAddr {
        self.tcb().addr
    }
}

type ListenKey = (Ipv4Addr, u16);
type ConnKey = (Ipv4Addr, u16, Ipv4Addr, u16);

/// The three socket tables. A socket sits in at most one of
/// {listening, established} at a time, and in bound exactly while it
/// holds a local port.
pub struct TcpSockManager {
    listening: Mutex<HashMap<ListenKey, Arc<TcpSock>>>,
    established: Mutex<HashMap<ConnKey, Arc<TcpSock>>>,
    bound: Mutex<HashMap<ListenKey, Arc<TcpSock>>>,
}

impl TcpSockManager {
    pub fn new() -> TcpSockManager {
        TcpSockManager {
            listening: Mutex::new(HashMap::new()),
            established: Mutex::new(HashMap::new()),
            bound: Mutex::new(HashMap::new()),
        }
    }

    /// Receive-side lookup: the exact connection first, then a
    /// listener on the local tuple.
    pub fn lookup(
        &self,
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    ) -> Option<Arc<TcpSock>> {
        self.lookup_established(local_ip, local_port, remote_ip, remote_port)
            .or_else(|| self.lookup_listening(local_ip, local_port))
    }

    pub fn lookup_established(
        &self,
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    ) -> Option<Arc<TcpSock>> {
        self.established
            .lock()
            .unwrap()
            .get(&(local_ip, local_port, remote_ip, remote_port))
            .cloned()
    }

    pub fn lookup_listening(&self, local_ip: Ipv4Addr, local_port: u16) -> Option<Arc<TcpSock>> {
        self.listening
            .lock()
            .unwrap()
            .get(&(local_ip, local_port))
            .cloned()
    }

    /// Files the socket under the table its state calls for. `false`
    /// when the slot is already taken by another socket.
    pub fn hash(&self, sock: &Arc<TcpSock>) -> bool {
        let (state, addr) = {
            let tcb = sock.tcb();
            (tcb.state, tcb.addr)
        };
        match state {
            TcpState::Closed => false,
            TcpState::Listen => {
                let mut listening = self.listening.lock().unwrap();
                let key = (addr.src_ip, addr.src_port);
                if let Some(existing) = listening.get(&key) {
                    return Arc::ptr_eq(existing, sock);
                }
                listening.insert(key, sock.clone());
                true
            }
            _ => {
                let mut established = self.established.lock().unwrap();
                let key = (addr.src_ip, addr.src_port, addr.dst_ip, addr.dst_port);
                if let Some(existing) = established.get(&key) {
                    return Arc::ptr_eq(existing, sock);
                }
                established.insert(key, sock.clone());
                true
            }
        }
    }

    /// Removes the socket from listening and established alike.
    pub fn unhash(&self, sock: &Arc<TcpSock>) {
        self.listening
            .lock()
            .unwrap()
            .retain(|_, s| !Arc::ptr_eq(s, sock));
        self.established
            .lock()
            .unwrap()
            .retain(|_, s| !Arc::ptr_eq(s, sock));
    }

    pub fn port_in_use(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.bound.lock().unwrap().contains_key(&(ip, port))
    }

    /// Claims a local `(ip, port)`, auto-allocating a port from
    /// `[1024, 65535)` when `port` is 0.
    pub fn bind(&self, sock: &Arc<TcpSock>, ip: Ipv4Addr, port: u16) -> Result<u16, SocketError> {
        let mut bound = self.bound.lock().unwrap();
        let port = if port == 0 {
            (LOCAL_PORT_RANGE_START..=LOCAL_PORT_RANGE_END)
                .find(|p| !bound.contains_key(&(ip, *p)))
                .ok_or(SocketError::AddrInUse)?
        } else {
            if bound.contains_key(&(ip, port)) {
                return Err(SocketError::AddrInUse);
            }
            port
        };
        bound.insert((ip, port), sock.clone());
        drop(bound);
        let mut tcb = sock.tcb();
        tcb.addr.src_ip = ip;
        tcb.addr.src_port = port;
        debug!("tcp: bound {}:{}", ip, port);
        Ok(port)
    }

    pub fn unbind(&self, sock: &Arc<TcpSock>) {
        self.bound.lock().unwrap().retain(|_, s| !Arc::ptr_eq(s, sock));
    }
}

impl Default for TcpSockManager {
    fn default() -> Self {
        Self::new()
    }
}
