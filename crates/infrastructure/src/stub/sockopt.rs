//! Raw socket options the stub needs beyond what `socket2` wraps.

use std::io;
use std::os::unix::io::AsRawFd;

use socket2::Socket;
use tracing::debug;

/// Interface index of `lo` on Linux.
pub const LOOPBACK_IFINDEX: u32 = 1;

/// TCP_FASTOPEN queue length. Everybody appears to pick qlen=5.
const TCP_FASTOPEN_QUEUE: libc::c_int = 5;

// Not yet exposed by the libc crate on all targets.
const SO_BINDTOIFINDEX: libc::c_int = 62;
const IP_RECVFRAGSIZE: libc::c_int = 25;
const IPV6_RECVFRAGSIZE: libc::c_int = 77;

fn setsockopt_int(
    fd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Options every stub socket gets: address reuse plus the packet-info and
/// TTL control messages on receive.
pub fn set_common_socket_options(socket: &Socket, ipv6: bool) -> io::Result<()> {
    socket.set_reuse_address(true)?;

    let fd = socket.as_raw_fd();
    if ipv6 {
        setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, 1)?;
        setsockopt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, 1)?;
    } else {
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_PKTINFO, 1)?;
        setsockopt_int(fd, libc::IPPROTO_IP, libc::IP_RECVTTL, 1)?;
    }
    Ok(())
}

/// Options for stub TCP listening sockets. Failures here are quality-of-
/// service only and are logged instead of propagated.
pub fn set_common_tcp_socket_options(socket: &Socket) {
    let fd = socket.as_raw_fd();

    if let Err(e) = setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN, TCP_FASTOPEN_QUEUE)
    {
        debug!(error = %e, "Failed to enable TCP_FASTOPEN on TCP listening socket, ignoring");
    }
    if let Err(e) = setsockopt_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1) {
        debug!(error = %e, "Failed to enable TCP_NODELAY mode, ignoring");
    }
}

/// Pins a socket to an interface so its traffic cannot leave that interface.
pub fn bind_to_ifindex(socket: &Socket, ifindex: u32) -> io::Result<()> {
    setsockopt_int(
        socket.as_raw_fd(),
        libc::SOL_SOCKET,
        SO_BINDTOIFINDEX,
        ifindex as libc::c_int,
    )
}

/// Turns off path-MTU discovery for extra UDP listeners; the address may not
/// be local and fragmentation beats blackholing for plain DNS.
pub fn disable_pmtud(socket: &Socket, ipv6: bool) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    if ipv6 {
        setsockopt_int(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_MTU_DISCOVER,
            libc::IP_PMTUDISC_DONT,
        )
    } else {
        setsockopt_int(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            libc::IP_PMTUDISC_DONT,
        )
    }
}

/// Asks for the fragment-size control message on extra UDP listeners.
pub fn set_recvfragsize(socket: &Socket, ipv6: bool) -> io::Result<()> {
    let fd = socket.as_raw_fd();
    if ipv6 {
        setsockopt_int(fd, libc::IPPROTO_IPV6, IPV6_RECVFRAGSIZE, 1)
    } else {
        setsockopt_int(fd, libc::IPPROTO_IP, IP_RECVFRAGSIZE, 1)
    }
}
