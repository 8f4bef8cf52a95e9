//! Low-level UDP socket construction for sACN endpoints.
//!
//! Receivers share port 5568 (REUSEADDR + REUSEPORT) and need the kernel to
//! report each datagram's destination address so arrival mode (unicast,
//! multicast, broadcast) can be classified. socket2 covers the socket
//! options; the destination report requires raw `recvmsg` with control
//! messages, which is platform-specific (`IP_PKTINFO` on Linux,
//! `IP_RECVDSTADDR` on the BSDs).

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::SACN_PORT;

/// Create the shared receiver socket bound to `0.0.0.0:5568`.
///
/// Address and port reuse let several receivers coexist on one host, which
/// multicast delivery supports natively.
pub(crate) fn create_receiver_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    socket.set_reuse_port(true)?;

    enable_destination_reports(&socket)?;

    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SACN_PORT));
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Create the sender socket bound to `local_ip` on an ephemeral port.
///
/// Binding to a concrete address pins the egress interface, which the OS
/// needs for routing multicast transmissions; the interface is also set
/// explicitly when one is given.
pub(crate) fn create_sender_socket(local_ip: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    let addr = SocketAddr::V4(SocketAddrV4::new(local_ip, 0));
    socket.bind(&addr.into())?;

    if !local_ip.is_unspecified() {
        socket.set_multicast_if_v4(&local_ip)?;
    }

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Join the multicast group on the given interface address
/// (`0.0.0.0` lets the OS pick).
pub(crate) fn join_multicast(
    socket: &UdpSocket,
    group: Ipv4Addr,
    interface: Ipv4Addr,
) -> io::Result<()> {
    socket.join_multicast_v4(&group, &interface)
}

/// Leave the multicast group.
pub(crate) fn leave_multicast(
    socket: &UdpSocket,
    group: Ipv4Addr,
    interface: Ipv4Addr,
) -> io::Result<()> {
    socket.leave_multicast_v4(&group, &interface)
}

/// Receive one datagram, returning its length, source address and (when the
/// platform reports one) destination address.
///
/// The socket must be non-blocking; `WouldBlock` passes through for the
/// caller's readiness loop.
pub(crate) fn recv_with_destination(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<Ipv4Addr>)> {
    let mut source: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // 8-byte aligned control buffer, large enough for one in_pktinfo cmsg.
    let mut control = [0u64; 8];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(source).cast();
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = std::mem::size_of_val(&control) as _;

    let n = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let source = source_address(&source)?;
    let destination = destination_from_msghdr(&msg);
    Ok((n as usize, source, destination))
}

fn source_address(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    if i32::from(storage.ss_family) != libc::AF_INET {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "non-IPv4 source address",
        ));
    }
    let sin = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in>() };
    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    let port = u16::from_be(sin.sin_port);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

#[cfg(target_os = "linux")]
fn enable_destination_reports(socket: &Socket) -> io::Result<()> {
    setsockopt_ip(socket.as_raw_fd(), libc::IP_PKTINFO)
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn enable_destination_reports(socket: &Socket) -> io::Result<()> {
    setsockopt_ip(socket.as_raw_fd(), libc::IP_RECVDSTADDR)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
fn enable_destination_reports(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
fn setsockopt_ip(fd: std::os::fd::RawFd, option: libc::c_int) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            option,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn destination_from_msghdr(msg: &libc::msghdr) -> Option<Ipv4Addr> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_PKTINFO {
                let info = &*libc::CMSG_DATA(cmsg).cast::<libc::in_pktinfo>();
                return Some(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr)));
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn destination_from_msghdr(msg: &libc::msghdr) -> Option<Ipv4Addr> {
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::IPPROTO_IP && (*cmsg).cmsg_type == libc::IP_RECVDSTADDR
            {
                let addr = &*libc::CMSG_DATA(cmsg).cast::<libc::in_addr>();
                return Some(Ipv4Addr::from(u32::from_be(addr.s_addr)));
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    None
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "freebsd")))]
fn destination_from_msghdr(_msg: &libc::msghdr) -> Option<Ipv4Addr> {
    None
}

/// Port 5568 is protocol-fixed; tests across the crate that bind it
/// serialize on this lock.
#[cfg(test)]
pub(crate) static PORT_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
