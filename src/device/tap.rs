use std::ffi::CString;
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::{c_char, c_short, c_ulong, c_void, ifreq};

// Request numbers, declared here rather than pulled from libc so the
// set in use is visible in one place.
const TUNSETIFF: c_ulong = 0x4004_54ca;
const SIOCGIFFLAGS: c_ulong = 0x8913;
const SIOCSIFFLAGS: c_ulong = 0x8914;
const SIOCSIFADDR: c_ulong = 0x8916;
const SIOCSIFNETMASK: c_ulong = 0x891c;

const IFF_UP: c_short = 0x0001;
const IFF_TAP: c_short = 0x0002;
const IFF_NO_PI: c_short = 0x1000;

/// A TAP file descriptor under `/dev/net/<name>`.
///
/// Opening creates the character node (`c 10 200`) when it is
/// missing, attaches with `IFF_TAP | IFF_NO_PI`, and leaves the
/// kernel-side interface configurable through the usual SIOC ioctls.
/// Reads and writes are whole raw Ethernet frames.
pub struct TapFd {
    name: String,
    path: String,
    fd: RawFd,
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn ifreq_for(name: &str) -> io::Result<ifreq> {
    let mut req: ifreq = unsafe { mem::zeroed() };
    let cname = CString::new(name).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL")
    })?;
    let bytes = cname.as_bytes_with_nul();
    if bytes.len() > req.ifr_name.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }
    for (dst, src) in req.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as c_char;
    }
    Ok(req)
}

/// Runs `op` against a throwaway `AF_INET` control socket, the way
/// ifconfig drives the SIOC requests.
fn with_ctl_socket<F>(op: F) -> io::Result<()>
where
    F: FnOnce(RawFd) -> io::Result<()>,
{
    let fd = cvt(unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) })?;
    let result = op(fd);
    unsafe { libc::close(fd) };
    result
}

impl TapFd {
    pub fn open(name: &str) -> io::Result<TapFd> {
        let path = format!("/dev/net/{}", name);
        if !Path::new(&path).exists() {
            let cpath = CString::new(path.clone()).unwrap();
            cvt(unsafe {
                libc::mknod(
                    cpath.as_ptr(),
                    libc::S_IFCHR | 0o666,
                    libc::makedev(10, 200),
                )
            })?;
        }
        let cpath = CString::new(path.clone()).unwrap();
        let fd = cvt(unsafe { libc::open(cpath.as_ptr(), libc::O_RDWR) })?;

        let mut req = ifreq_for(name)?;
        req.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI;
        if let Err(e) = cvt(unsafe { libc::ioctl(fd, TUNSETIFF, &mut req as *mut ifreq) }) {
            unsafe { libc::close(fd) };
            return Err(e);
        }
        Ok(TapFd {
            name: name.to_owned(),
            path,
            fd,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Assigns the kernel-facing address of the interface.
    pub fn set_ip(&self, ip: Ipv4Addr) -> io::Result<()> {
        let mut req = ifreq_for(&self.name)?;
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from(ip).to_be(),
            },
            sin_zero: [0; 8],
        };
        unsafe {
            *(&mut req.ifr_ifru as *mut _ as *mut libc::sockaddr_in) = addr;
        }
        with_ctl_socket(|ctl| {
            cvt(unsafe { libc::ioctl(ctl, SIOCSIFADDR, &req as *const ifreq) }).map(|_| ())
        })
    }

    pub fn set_netmask(&self, prefix: u8) -> io::Result<()> {
        let mask: u32 = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        };
        let mut req = ifreq_for(&self.name)?;
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: mask.to_be(),
            },
            sin_zero: [0; 8],
        };
        unsafe {
            *(&mut req.ifr_ifru as *mut _ as *mut libc::sockaddr_in) = addr;
        }
        with_ctl_socket(|ctl| {
            cvt(unsafe { libc::ioctl(ctl, SIOCSIFNETMASK, &req as *const ifreq) }).map(|_| ())
        })
    }

    pub fn up(&self) -> io::Result<()> {
        with_ctl_socket(|ctl| {
            let mut req = ifreq_for(&self.name)?;
            cvt(unsafe { libc::ioctl(ctl, SIOCGIFFLAGS, &mut req as *mut ifreq) })?;
            unsafe {
                req.ifr_ifru.ifru_flags |= IFF_UP;
            }
            cvt(unsafe { libc::ioctl(ctl, SIOCSIFFLAGS, &req as *const ifreq) }).map(|_| ())
        })
    }

    /// Reads one frame. The device layer always asks for `mtu + 14`
    /// bytes, the largest frame the link can deliver.
    pub fn read(&self, max_len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    pub fn write(&self, frame: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, frame.as_ptr() as *const c_void, frame.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if (n as usize) < frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to TAP device",
            ));
        }
        Ok(n as usize)
    }
}

impl Drop for TapFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
        let _ = std::fs::remove_file(&self.path);
    }
}
