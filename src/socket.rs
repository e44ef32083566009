//! The socket-style API an application drives the stack with.

use std::error::Error;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::device::DeviceManager;
use crate::stack::NetworkStack;
use crate::tcp::{Tcp, TcpSock, TcpState};

/// Everything a socket call can fail with, one variant per
/// distinguishable kind so callers (and tests) can match on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketError {
    /// The socket was closed (or never opened).
    Closed,
    /// The operation needs a bound local address first.
    NotBound,
    /// The connection is not established.
    NotConnected,
    /// A second `connect` on a connected socket.
    AlreadyConnected,
    /// The local `(ip, port)` tuple is taken.
    AddrInUse,
    /// The requested address does not belong to this stack.
    AddrNotAvailable,
    /// An argument outside its domain, e.g. an oversized backlog.
    InvalidInput,
    /// The peer reset the connection, or it was torn down while a
    /// call was blocked on it.
    ConnectionReset,
}

impl fmt::Display for SocketError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use SocketError::*;
        let msg = match self {
            Closed => "socket is closed",
            NotBound => "socket is not bound",
            NotConnected => "socket is not connected",
            AlreadyConnected => "socket is already connected",
            AddrInUse => "address already in use",
            AddrNotAvailable => "address not available on this stack",
            InvalidInput => "invalid argument",
            ConnectionReset => "connection reset by peer",
        };
        fmt.write_str(msg)
    }
}

impl Error for SocketError {}

impl From<SocketError> for io::Error {
    fn from(e: SocketError) -> io::Error {
        use SocketError::*;
        let kind = match e {
            Closed => io::ErrorKind::NotConnected,
            NotBound => io::ErrorKind::InvalidInput,
            NotConnected => io::ErrorKind::NotConnected,
            AlreadyConnected => io::ErrorKind::AlreadyExists,
            AddrInUse => io::ErrorKind::AddrInUse,
            AddrNotAvailable => io::ErrorKind::AddrNotAvailable,
            InvalidInput => io::ErrorKind::InvalidInput,
            ConnectionReset => io::ErrorKind::ConnectionReset,
        };
        io::Error::new(kind, e.to_string())
    }
}

/// A stream socket against one stack.
///
/// ```no_run
/// # use tapstack::{NetworkStack, Socket};
/// # let stack = NetworkStack::new();
/// let server = Socket::new(&stack);
/// server.bind(("10.0.0.1".parse().unwrap(), 80)).unwrap();
/// server.listen(1).unwrap();
/// let (peer, addr) = server.accept().unwrap();
/// let data = peer.read(0).unwrap();
/// peer.write(&data).unwrap();
/// ```
pub struct Socket {
    devices: Arc<DeviceManager>,
    tcp: Arc<Tcp>,
    sock: Mutex<Option<Arc<TcpSock>>>,
}

impl Socket {
    pub fn new(stack: &NetworkStack) -> Socket {
        Socket {
            devices: stack.devices().clone(),
            tcp: stack.tcp().clone(),
            sock: Mutex::new(Some(TcpSock::new())),
        }
    }

    fn wrap(devices: Arc<DeviceManager>, tcp: Arc<Tcp>, sock: Arc<TcpSock>) -> Socket {
        Socket {
            devices,
            tcp,
            sock: Mutex::new(Some(sock)),
        }
    }

    fn sock(&self) -> Result<Arc<TcpSock>, SocketError> {
        self.sock.lock().unwrap().clone().ok_or(SocketError::Closed)
    }

    /// Claims a local address. The address must belong to the stack;
    /// port 0 picks a free ephemeral port.
    pub fn bind(&self, addr: (Ipv4Addr, u16)) -> Result<(), SocketError> {
        let (ip, port) = addr;
        let sock = self.sock()?;
        if sock.addr().src_port != 0 {
            return Err(SocketError::InvalidInput);
        }
        if !self.devices.local_ip_addr(ip) {
            return Err(SocketError::AddrNotAvailable);
        }
        self.tcp.manager.bind(&sock, ip, port).map(|_| ())
    }

    pub fn listen(&self, backlog: usize) -> Result<(), SocketError> {
        let sock = self.sock()?;
        self.tcp.listen(&sock, backlog)
    }

    /// Blocks until a fully established connection is available and
    /// returns it with the peer address.
    pub fn accept(&self) -> Result<(Socket, (Ipv4Addr, u16)), SocketError> {
        let sock = self.sock()?;
        let child = self.tcp.accept(&sock)?;
        let peer = child.addr();
        Ok((
            Socket::wrap(self.devices.clone(), self.tcp.clone(), child),
            (peer.dst_ip, peer.dst_port),
        ))
    }

    /// Active open towards `addr`. Blocks for the handshake.
    pub fn connect(&self, addr: (Ipv4Addr, u16)) -> Result<(), SocketError> {
        let sock = self.sock()?;
        self.tcp.connect(&sock, addr.0, addr.1)
    }

    /// Blocking read. `read(0)` returns all currently buffered
    /// bytes; an empty result is end-of-stream.
    pub fn read(&self, size: usize) -> Result<Vec<u8>, SocketError> {
        let sock = self.sock()?;
        self.tcp.recv_buf(&sock, size)
    }

    /// Queues `data` towards the peer. Returns how many bytes the
    /// send window let through.
    pub fn write(&self, data: &[u8]) -> Result<usize, SocketError> {
        let sock = self.sock()?;
        self.tcp.send_buf(&sock, data)
    }

    pub fn close(&self) -> Result<(), SocketError> {
        let sock = self.sock.lock().unwrap().take().ok_or(SocketError::Closed)?;
        self.tcp.close(&sock);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<(Ipv4Addr, u16), SocketError> {
        let addr = self.sock()?.addr();
        Ok((addr.src_ip, addr.src_port))
    }

    pub fn peer_addr(&self) -> Result<(Ipv4Addr, u16), SocketError> {
        let addr = self.sock()?.addr();
        if addr.dst_port == 0 {
            return Err(SocketError::NotConnected);
        }
        Ok((addr.dst_ip, addr.dst_port))
    }

    pub fn state(&self) -> Option<TcpState> {
        self.sock.lock().unwrap().as_ref().map(|sock| sock.state())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(sock) = self.sock.lock().unwrap().take() {
            self.tcp.close(&sock);
        }
    }
}
