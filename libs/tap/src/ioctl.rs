//! Interface configuration via `ioctl`.
//!
//! The address/MTU/flags requests operate on an `AF_INET` datagram socket,
//! addressed by interface name; only `TUNSETIFF` goes to the device
//! descriptor itself.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use libc::{c_int, c_short, c_uchar, sockaddr, sockaddr_in};

pub const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Executes the `ioctl` syscall on the given file descriptor with the
/// provided request.
///
/// # Safety
///
/// The file descriptor must be open and the payload layout must match what
/// the request code expects.
pub unsafe fn exec<P>(fd: RawFd, code: libc::c_ulong, req: &mut Request<P>) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// A control request to a network device, addressed by the device's name.
///
/// The payload MUST be `#[repr(C)]` and its layout depends on the particular
/// request you are sending.
#[repr(C)]
pub struct Request<P> {
    name: [c_uchar; libc::IF_NAMESIZE],
    pub payload: P,
}

impl<P> Request<P> {
    pub fn new(name: &str, payload: P) -> io::Result<Self> {
        let name_as_bytes = name.as_bytes();
        if name_as_bytes.len() >= libc::IF_NAMESIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name `{name}` is too long"),
            ));
        }

        let mut name = [0 as c_uchar; libc::IF_NAMESIZE];
        name[..name_as_bytes.len()].copy_from_slice(name_as_bytes);

        Ok(Self { name, payload })
    }
}

#[repr(C)]
pub struct FlagsPayload {
    pub flags: c_short,
}

#[repr(C)]
pub struct MtuPayload {
    pub mtu: c_int,
}

#[repr(C)]
pub struct AddrPayload {
    pub addr: sockaddr_in,
}

#[repr(C)]
pub struct HwAddrPayload {
    pub addr: sockaddr,
}

pub fn sockaddr_in_from(ip: Ipv4Addr) -> sockaddr_in {
    // Safety: all-zeroes is a valid sockaddr_in.
    let mut addr: sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as _;
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(ip.octets()),
    };

    addr
}

/// The dotted-quad netmask for a prefix length, e.g. 24 -> 255.255.255.0.
pub fn netmask_from_prefix(prefix: u8) -> Ipv4Addr {
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };

    Ipv4Addr::from(bits)
}
