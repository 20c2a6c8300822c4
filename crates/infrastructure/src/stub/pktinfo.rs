//! recvmsg/sendmsg plumbing for UDP listeners.
//!
//! Receiving pulls the destination address and interface index out of the
//! IP_PKTINFO control message so replies can go back the way the query came.
//! Sending forces the source address of IPv4 replies; the kernel would
//! otherwise pick a source by routing table, which on the primary listener
//! would turn 127.0.0.53 into 127.0.0.1. IPv6 sends fall back to a plain
//! sendmsg without control data.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

/// What recvmsg learned about one datagram.
pub struct RecvMeta {
    pub len: usize,
    pub from: SocketAddr,
    pub destination: Option<IpAddr>,
    pub ifindex: Option<u32>,
}

pub fn try_recv(fd: RawFd, buf: &mut [u8]) -> io::Result<RecvMeta> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut src_addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut cmsg_buf = [0u8; 128];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut src_addr as *mut libc::sockaddr_storage as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let from = sockaddr_to_socket_addr(&src_addr)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))?;

    let (destination, ifindex) = extract_pktinfo(&msg);

    Ok(RecvMeta {
        len: n as usize,
        from,
        destination,
        ifindex,
    })
}

fn extract_pktinfo(msg: &libc::msghdr) -> (Option<IpAddr>, Option<u32>) {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
            let pktinfo = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo) };
            let addr = Ipv4Addr::from(u32::from_be(pktinfo.ipi_addr.s_addr));
            return (Some(IpAddr::V4(addr)), Some(pktinfo.ipi_ifindex as u32));
        }
        if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_PKTINFO {
            let pktinfo = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo) };
            let addr = Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr);
            return (Some(IpAddr::V6(addr)), Some(pktinfo.ipi6_ifindex));
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    (None, None)
}

pub fn try_send(
    fd: RawFd,
    buf: &[u8],
    to: SocketAddr,
    src: Option<IpAddr>,
    ifindex: Option<u32>,
) -> io::Result<usize> {
    match (to, src) {
        (SocketAddr::V4(to4), Some(IpAddr::V4(src4))) => {
            try_send_v4_with_source(fd, buf, to4, src4, ifindex)
        }
        _ => send_plain(fd, buf, to),
    }
}

fn try_send_v4_with_source(
    fd: RawFd,
    buf: &[u8],
    to: SocketAddrV4,
    src: Ipv4Addr,
    ifindex: Option<u32>,
) -> io::Result<usize> {
    let dst_addr = socket_addr_v4_to_sockaddr_in(to);

    let pktinfo = libc::in_pktinfo {
        ipi_ifindex: ifindex.unwrap_or(0) as libc::c_int,
        ipi_spec_dst: libc::in_addr {
            s_addr: u32::from_ne_bytes(src.octets()),
        },
        ipi_addr: libc::in_addr { s_addr: 0 },
    };

    let cmsg_space =
        unsafe { libc::CMSG_SPACE(mem::size_of::<libc::in_pktinfo>() as u32) } as usize;
    let mut cmsg_buf = [0u8; 64];

    let iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &dst_addr as *const libc::sockaddr_in as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return send_plain(fd, buf, SocketAddr::V4(to));
        }
        (*cmsg).cmsg_level = libc::IPPROTO_IP;
        (*cmsg).cmsg_type = libc::IP_PKTINFO;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as u32) as _;
        let data = libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo;
        data.write_unaligned(pktinfo);
    }

    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn send_plain(fd: RawFd, buf: &[u8], to: SocketAddr) -> io::Result<usize> {
    let iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };

    let mut v4_storage: libc::sockaddr_in;
    let mut v6_storage: libc::sockaddr_in6;
    match to {
        SocketAddr::V4(to4) => {
            v4_storage = socket_addr_v4_to_sockaddr_in(to4);
            msg.msg_name = &mut v4_storage as *mut libc::sockaddr_in as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        }
        SocketAddr::V6(to6) => {
            v6_storage = socket_addr_v6_to_sockaddr_in6(to6);
            msg.msg_name = &mut v6_storage as *mut libc::sockaddr_in6 as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        }
    }
    msg.msg_iov = &iov as *const libc::iovec as *mut libc::iovec;
    msg.msg_iovlen = 1;

    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_DONTWAIT) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn sockaddr_to_socket_addr(addr: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match addr.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn socket_addr_v4_to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr.s_addr = u32::from_be_bytes(addr.ip().octets()).to_be();
    sa.sin_port = addr.port().to_be();
    sa
}

fn socket_addr_v6_to_sockaddr_in6(addr: SocketAddrV6) -> libc::sockaddr_in6 {
    let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
    sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
    sa.sin6_addr.s6_addr = addr.ip().octets();
    sa.sin6_port = addr.port().to_be();
    sa.sin6_flowinfo = addr.flowinfo();
    sa.sin6_scope_id = addr.scope_id();
    sa
}
