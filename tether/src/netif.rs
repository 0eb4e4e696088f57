//! IPv4 interface configuration through socket ioctls.
//!
//! Running `ip(8)` would leave the tether racing its own reaper for the
//! helper's exit status, so links, addresses and routes are set directly.

use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};

const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;
const SIOCSIFADDR: libc::c_ulong = 0x8916;
const SIOCSIFNETMASK: libc::c_ulong = 0x891C;
const SIOCSIFMTU: libc::c_ulong = 0x8922;
const SIOCADDRT: libc::c_ulong = 0x890B;

const RTF_UP: libc::c_ushort = 0x0001;
const RTF_GATEWAY: libc::c_ushort = 0x0002;

#[repr(C)]
struct IfreqFlags {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

#[repr(C)]
struct IfreqAddr {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_addr: libc::sockaddr_in,
    _pad: [u8; 8],
}

#[repr(C)]
struct IfreqMtu {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_mtu: libc::c_int,
    _pad: [u8; 20],
}

/// `struct rtentry` from <linux/route.h>.
#[repr(C)]
struct Rtentry {
    rt_pad1: libc::c_ulong,
    rt_dst: libc::sockaddr_in,
    rt_gateway: libc::sockaddr_in,
    rt_genmask: libc::sockaddr_in,
    rt_flags: libc::c_ushort,
    rt_pad2: libc::c_short,
    rt_pad3: libc::c_ulong,
    rt_pad4: *mut libc::c_void,
    rt_metric: libc::c_short,
    rt_dev: *mut libc::c_char,
    rt_mtu: libc::c_ulong,
    rt_window: libc::c_ulong,
    rt_irtt: libc::c_ushort,
}

fn control_socket() -> io::Result<OwnedFd> {
    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};
    Ok(socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?)
}

fn ifname(name: &str) -> io::Result<[libc::c_char; libc::IFNAMSIZ]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ || bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bad interface name: {:?}", name),
        ));
    }
    let mut out = [0 as libc::c_char; libc::IFNAMSIZ];
    for (dst, src) in out.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(out)
}

fn sockaddr(addr: Ipv4Addr) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain old data
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr = libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    };
    sa
}

/// Netmask for a prefix length, e.g. 24 → 255.255.255.0.
pub fn netmask(prefix: u8) -> Ipv4Addr {
    match prefix {
        0 => Ipv4Addr::UNSPECIFIED,
        p if p >= 32 => Ipv4Addr::BROADCAST,
        p => Ipv4Addr::from(u32::MAX << (32 - p)),
    }
}

unsafe fn ioctl<T>(fd: &OwnedFd, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
    if unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn link_up(name: &str) -> io::Result<()> {
    let sock = control_socket()?;
    let mut req = IfreqFlags {
        ifr_name: ifname(name)?,
        ifr_flags: 0,
        _pad: [0; 22],
    };
    unsafe {
        ioctl(&sock, SIOCGIFFLAGS, &mut req)?;
        req.ifr_flags |= libc::IFF_UP as libc::c_short;
        ioctl(&sock, SIOCSIFFLAGS, &mut req)
    }
}

pub fn set_mtu(name: &str, mtu: u32) -> io::Result<()> {
    let sock = control_socket()?;
    let mut req = IfreqMtu {
        ifr_name: ifname(name)?,
        ifr_mtu: mtu as libc::c_int,
        _pad: [0; 20],
    };
    unsafe { ioctl(&sock, SIOCSIFMTU, &mut req) }
}

pub fn set_address(name: &str, addr: Ipv4Addr, prefix: u8) -> io::Result<()> {
    let sock = control_socket()?;
    let mut req = IfreqAddr {
        ifr_name: ifname(name)?,
        ifr_addr: sockaddr(addr),
        _pad: [0; 8],
    };
    unsafe { ioctl(&sock, SIOCSIFADDR, &mut req)? };

    req.ifr_addr = sockaddr(netmask(prefix));
    unsafe { ioctl(&sock, SIOCSIFNETMASK, &mut req) }
}

pub fn add_default_route(name: &str, gateway: Ipv4Addr) -> io::Result<()> {
    let sock = control_socket()?;
    let mut dev = ifname(name)?;
    // SAFETY: rtentry is plain old data; the pointers are null or point at `dev`
    let mut route: Rtentry = unsafe { std::mem::zeroed() };
    route.rt_dst = sockaddr(Ipv4Addr::UNSPECIFIED);
    route.rt_genmask = sockaddr(Ipv4Addr::UNSPECIFIED);
    route.rt_gateway = sockaddr(gateway);
    route.rt_flags = RTF_UP | RTF_GATEWAY;
    route.rt_dev = dev.as_mut_ptr();

    match unsafe { ioctl(&sock, SIOCADDRT, &mut route) } {
        Err(e) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netmask() {
        assert_eq!(netmask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask(16), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(netmask(0), Ipv4Addr::UNSPECIFIED);
        assert_eq!(netmask(32), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_ifname() {
        let name = ifname("eth0").unwrap();
        assert_eq!(name[0], b'e' as libc::c_char);
        assert_eq!(name[4], 0);

        assert!(ifname("").is_err());
        assert!(ifname("a-very-long-interface-name").is_err());
    }

    #[test]
    fn test_struct_layouts() {
        assert_eq!(std::mem::size_of::<IfreqFlags>(), 40);
        assert_eq!(std::mem::size_of::<IfreqAddr>(), 40);
        assert_eq!(std::mem::size_of::<IfreqMtu>(), 40);
    }
}
