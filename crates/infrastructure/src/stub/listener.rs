//! Stub listener sockets and their receive loops.
//!
//! The primary listener serves 127.0.0.53:53, bound to the loopback
//! interface with a TTL of 1 so its traffic cannot leave the host. Extra
//! listeners bind wherever configured, with freebind so boot ordering does
//! not matter. Losing the primary address to another process downgrades the
//! stub with a warning instead of failing the whole service; a broken extra
//! endpoint only disables itself.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use loopdns_domain::{Config, DomainError, ExtraListenerSpec, ListenerMode, Transport};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatcher::{Egress, ExtraListener, ListenerContext, StubDispatcher, DNS_STUB_ADDRESS};
use super::packet::DnsPacket;
use super::pktinfo::{self, RecvMeta};
use super::sockopt;
use super::stream::{self, StubStream};

const DNS_PORT: u16 = 53;
const UDP_RECV_BUFFER_SIZE: usize = 0x10000;

pub struct StubListenerSet {
    tasks: Vec<JoinHandle<()>>,
    extra_udp_addrs: Vec<SocketAddr>,
    extra_tcp_addrs: Vec<SocketAddr>,
}

impl StubListenerSet {
    /// Binds and starts every configured listener. Only configuration
    /// errors and unexpected primary-socket failures propagate; busy or
    /// unusable endpoints degrade with a warning.
    pub fn start(config: &Config, dispatcher: Arc<StubDispatcher>) -> Result<Self, DomainError> {
        let mut set = StubListenerSet {
            tasks: Vec::new(),
            extra_udp_addrs: Vec::new(),
            extra_tcp_addrs: Vec::new(),
        };

        let mode = config.stub.listener;
        if mode == ListenerMode::No {
            debug!("Not creating stub listener.");
        } else {
            debug!(mode = %mode, "Creating stub listener.");
            match set.start_primary(mode, &dispatcher) {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
                    ) =>
                {
                    warn!(
                        error = %e,
                        "Cannot listen on 127.0.0.53:53. Turning off local DNS stub support."
                    );
                }
                Err(e) => return Err(DomainError::Io(e.to_string())),
            }
        }

        let extras = config
            .stub
            .extra_listeners()
            .map_err(|e| DomainError::Io(e.to_string()))?;
        let mut seen: HashSet<ExtraListenerSpec> = HashSet::new();
        let extras: Vec<_> = extras.into_iter().filter(|s| seen.insert(s.clone())).collect();

        if !extras.is_empty() {
            debug!("Creating extra stub listeners.");
        }
        for spec in extras {
            let listener = ExtraListener::new(spec.clone());
            for transport in spec.transports() {
                if let Err(e) = set.start_extra(&spec, transport, &listener, &dispatcher) {
                    warn!(
                        listener = %spec,
                        transport = %transport,
                        error = %e,
                        "Failed to listen on extra stub socket, disabling it"
                    );
                }
            }
        }

        Ok(set)
    }

    /// Local addresses of the extra UDP listeners, in start order.
    pub fn extra_udp_addrs(&self) -> &[SocketAddr] {
        &self.extra_udp_addrs
    }

    /// Local addresses of the extra TCP listeners, in start order.
    pub fn extra_tcp_addrs(&self) -> &[SocketAddr] {
        &self.extra_tcp_addrs
    }

    /// Stops every receive loop. In-flight queries are dropped without
    /// replies.
    pub fn stop(self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    fn start_primary(
        &mut self,
        mode: ListenerMode,
        dispatcher: &Arc<StubDispatcher>,
    ) -> io::Result<()> {
        // Bind everything first so a busy TCP port does not leave a
        // half-started stub behind.
        let udp = mode.has_udp().then(primary_udp_socket).transpose()?;
        let tcp = mode.has_tcp().then(primary_tcp_listener).transpose()?;

        if let Some(socket) = udp {
            info!("Listening on UDP socket 127.0.0.53:53.");
            self.tasks.push(tokio::spawn(udp_loop(
                Arc::new(socket),
                dispatcher.clone(),
                ListenerContext::primary(),
            )));
        }
        if let Some(listener) = tcp {
            info!("Listening on TCP socket 127.0.0.53:53.");
            self.tasks.push(tokio::spawn(tcp_loop(
                Arc::new(listener),
                dispatcher.clone(),
                ListenerContext::primary(),
            )));
        }
        Ok(())
    }

    fn start_extra(
        &mut self,
        spec: &ExtraListenerSpec,
        transport: Transport,
        listener: &Arc<ExtraListener>,
        dispatcher: &Arc<StubDispatcher>,
    ) -> io::Result<()> {
        match transport {
            Transport::Udp => {
                let socket = extra_udp_socket(spec)?;
                self.extra_udp_addrs.push(socket.local_addr()?);
                debug!(listener = %spec, "Listening on UDP socket.");
                self.tasks.push(tokio::spawn(udp_loop(
                    Arc::new(socket),
                    dispatcher.clone(),
                    ListenerContext::extra(listener.clone()),
                )));
            }
            Transport::Tcp => {
                let tcp = extra_tcp_listener(spec)?;
                self.extra_tcp_addrs.push(tcp.local_addr()?);
                debug!(listener = %spec, "Listening on TCP socket.");
                self.tasks.push(tokio::spawn(tcp_loop(
                    Arc::new(tcp),
                    dispatcher.clone(),
                    ListenerContext::extra(listener.clone()),
                )));
            }
        }
        Ok(())
    }
}

fn primary_udp_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    sockopt::set_common_socket_options(&socket, false)?;

    // Make sure no traffic from outside the local host can leak onto this
    // socket.
    sockopt::bind_to_ifindex(&socket, sockopt::LOOPBACK_IFINDEX)?;
    socket.set_ttl(1)?;

    socket.bind(&SocketAddr::from((DNS_STUB_ADDRESS, DNS_PORT)).into())?;
    UdpSocket::from_std(socket.into())
}

fn primary_tcp_listener() -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    sockopt::set_common_socket_options(&socket, false)?;
    sockopt::set_common_tcp_socket_options(&socket);

    sockopt::bind_to_ifindex(&socket, sockopt::LOOPBACK_IFINDEX)?;
    socket.set_ttl(1)?;

    socket.bind(&SocketAddr::from((DNS_STUB_ADDRESS, DNS_PORT)).into())?;
    socket.listen(libc::SOMAXCONN)?;
    TcpListener::from_std(socket.into())
}

fn extra_udp_socket(spec: &ExtraListenerSpec) -> io::Result<UdpSocket> {
    let domain = if spec.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    sockopt::set_common_socket_options(&socket, spec.is_ipv6())?;

    // The configured address may not exist yet when we start.
    socket.set_freebind(true)?;

    // No TTL clamp here: the address may not be local, and clients may sit
    // more than one hop away.
    if let Err(e) = sockopt::disable_pmtud(&socket, spec.is_ipv6()) {
        debug!(listener = %spec, error = %e, "Failed to disable UDP PMTUD, ignoring");
    }
    if let Err(e) = sockopt::set_recvfragsize(&socket, spec.is_ipv6()) {
        debug!(listener = %spec, error = %e, "Failed to enable fragment size reception, ignoring");
    }

    socket.bind(&spec.socket_addr().into())?;
    UdpSocket::from_std(socket.into())
}

fn extra_tcp_listener(spec: &ExtraListenerSpec) -> io::Result<TcpListener> {
    let domain = if spec.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    sockopt::set_common_socket_options(&socket, spec.is_ipv6())?;
    sockopt::set_common_tcp_socket_options(&socket);
    socket.set_freebind(true)?;

    socket.bind(&spec.socket_addr().into())?;
    socket.listen(libc::SOMAXCONN)?;
    TcpListener::from_std(socket.into())
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    dispatcher: Arc<StubDispatcher>,
    ctx: ListenerContext,
) {
    let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
    loop {
        let meta = match recv_packet(&socket, &mut buf).await {
            Ok(meta) => meta,
            Err(e) => {
                debug!(error = %e, "UDP receive error");
                continue;
            }
        };

        let mut packet = match DnsPacket::from_wire(buf[..meta.len].to_vec(), Transport::Udp) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(error = %e, "Dropping undersized datagram");
                continue;
            }
        };
        packet.sender = Some(meta.from);
        packet.destination = meta.destination;
        packet.ifindex = meta.ifindex;

        if packet.validate_query() {
            debug!(id = packet.id(), "Got DNS stub UDP query packet");
            dispatcher
                .clone()
                .process_packet(
                    ctx.clone(),
                    Egress::Udp {
                        socket: socket.clone(),
                    },
                    packet,
                )
                .await;
        } else {
            debug!("Invalid DNS stub UDP packet, ignoring.");
        }
    }
}

async fn recv_packet(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<RecvMeta> {
    loop {
        socket.readable().await?;
        match socket.try_io(Interest::READABLE, || {
            pktinfo::try_recv(socket.as_raw_fd(), buf)
        }) {
            Ok(meta) => return Ok(meta),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn tcp_loop(
    listener: Arc<TcpListener>,
    dispatcher: Arc<StubDispatcher>,
    ctx: ListenerContext,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(error = %e, "TCP accept error");
                continue;
            }
        };
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to enable TCP_NODELAY mode, ignoring");
        }

        let dispatcher = dispatcher.clone();
        let ctx = ctx.clone();
        tokio::spawn(stream_loop(tcp, peer, dispatcher, ctx));
    }
}

async fn stream_loop(
    tcp: TcpStream,
    peer: SocketAddr,
    dispatcher: Arc<StubDispatcher>,
    ctx: ListenerContext,
) {
    let local_addr = tcp.local_addr().ok();
    let (stub_stream, mut read_half) = StubStream::new(tcp, peer);

    let error = loop {
        match stream::read_framed(&mut read_half).await {
            Ok(None) => break None,
            Ok(Some(body)) => {
                let mut packet = match DnsPacket::from_wire(body, Transport::Tcp) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "Dropping undersized TCP message");
                        continue;
                    }
                };
                packet.sender = Some(peer);
                packet.destination = local_addr.map(|a| a.ip());

                if packet.validate_query() {
                    debug!(id = packet.id(), "Got DNS stub TCP query packet");
                    dispatcher
                        .clone()
                        .process_packet(
                            ctx.clone(),
                            Egress::Tcp {
                                stream: stub_stream.clone(),
                            },
                            packet,
                        )
                        .await;
                } else {
                    debug!("Invalid DNS stub TCP packet, ignoring.");
                }
            }
            Err(e) => break Some(e),
        }
    };

    // The stream is gone; every query it still carries dies with it.
    debug!(
        peer = %peer,
        error = ?error,
        "DNS TCP connection terminated, destroying queries"
    );
    for (key, abort) in stub_stream.take_queries() {
        abort.abort();
        dispatcher.table(&ctx).remove(&key);
    }
}
