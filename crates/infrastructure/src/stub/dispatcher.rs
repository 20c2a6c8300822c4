//! Request dispatch: ingress validation, duplicate suppression, resolver
//! hand-off and reply delivery.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use dashmap::DashMap;
use loopdns_application::ports::Resolver;
use loopdns_application::services::SectionAssembler;
use loopdns_application::use_cases::{HandleStubQuery, ReplyDisposition};
use loopdns_domain::{rcode, DnsProtocol, ExtraListenerSpec, ResolverCompletion, Transport};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::{debug, error, warn};

use super::packet::DnsPacket;
use super::pktinfo;
use super::reply::{self, ADVERTISE_DATAGRAM_SIZE_MAX, ADVERTISE_EXTRA_DATAGRAM_SIZE_MAX};
use super::sockopt::LOOPBACK_IFINDEX;
use super::stream::StubStream;

/// The primary stub address, fixed by convention.
pub const DNS_STUB_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 53);

/// Identity of a client request for duplicate suppression: who sent it, over
/// what, plus the raw header. Requests with the same key whose packets are
/// byte-equal are retransmits of one another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DupKey {
    protocol: DnsProtocol,
    transport: Transport,
    sender: IpAddr,
    sender_port: u16,
    header: [u8; 12],
}

impl DupKey {
    pub(crate) fn for_packet(packet: &DnsPacket) -> Option<Self> {
        let sender = packet.sender?;
        Some(Self {
            protocol: packet.protocol,
            transport: packet.transport,
            sender: sender.ip(),
            sender_port: sender.port(),
            header: packet.header_bytes(),
        })
    }
}

/// Table entry for duplicate detection. The spawned query task owns the
/// query itself; TCP cancellation goes through the stream's registry, and
/// UDP queries run to completion or resolver timeout.
pub(crate) struct InflightEntry {
    request: Vec<u8>,
}

/// One extra listener endpoint. Owns its own in-flight table so duplicate
/// suppression stays per-endpoint.
pub struct ExtraListener {
    pub spec: ExtraListenerSpec,
    pub(crate) queries: DashMap<DupKey, InflightEntry>,
}

impl ExtraListener {
    pub fn new(spec: ExtraListenerSpec) -> Arc<Self> {
        Arc::new(Self {
            spec,
            queries: DashMap::new(),
        })
    }
}

/// Which listener a packet arrived on; `extra == None` is the primary stub.
#[derive(Clone)]
pub struct ListenerContext {
    pub extra: Option<Arc<ExtraListener>>,
}

impl ListenerContext {
    pub fn primary() -> Self {
        Self { extra: None }
    }

    pub fn extra(listener: Arc<ExtraListener>) -> Self {
        Self {
            extra: Some(listener),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.extra.is_none()
    }

    fn advertised_size(&self) -> u16 {
        if self.is_primary() {
            ADVERTISE_DATAGRAM_SIZE_MAX
        } else {
            ADVERTISE_EXTRA_DATAGRAM_SIZE_MAX
        }
    }
}

/// Where the reply goes back out.
#[derive(Clone)]
pub enum Egress {
    Udp { socket: Arc<UdpSocket> },
    Tcp { stream: Arc<StubStream> },
}

pub struct StubDispatcher {
    resolver: Arc<dyn Resolver>,
    nsid: Option<Arc<str>>,
    /// In-flight queries of the primary listener.
    queries: DashMap<DupKey, InflightEntry>,
}

impl StubDispatcher {
    pub fn new(resolver: Arc<dyn Resolver>, nsid: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            nsid: nsid.map(Arc::from),
            queries: DashMap::new(),
        })
    }

    pub(crate) fn table<'a>(&'a self, ctx: &'a ListenerContext) -> &'a DashMap<DupKey, InflightEntry> {
        match &ctx.extra {
            Some(listener) => &listener.queries,
            None => &self.queries,
        }
    }

    /// Runs a validated-on-the-wire client packet through the ingress
    /// pipeline and, if it survives, hands it to the resolver. Replies
    /// (including failure replies) go back through `egress`.
    pub(crate) async fn process_packet(
        self: Arc<Self>,
        ctx: ListenerContext,
        egress: Egress,
        mut packet: DnsPacket,
    ) {
        // The primary stub talks to the local host only.
        if ctx.is_primary() {
            let sender_ok = packet.sender.is_some_and(|s| s.ip().is_loopback());
            let destination_ok = packet.destination.map_or(true, |d| d.is_loopback());
            if !sender_ok || !destination_ok {
                warn!(
                    id = packet.id(),
                    transport = %packet.transport,
                    "Got packet on unexpected (i.e. non-localhost) IP range, ignoring"
                );
                return;
            }
        }

        if self.resolver.packet_is_ours(packet.wire_bytes()) {
            debug!(
                id = packet.id(),
                transport = %packet.transport,
                "Got our own packet looped back, ignoring"
            );
            return;
        }

        let Some(key) = DupKey::for_packet(&packet) else {
            return;
        };
        if let Some(existing) = self.table(&ctx).get(&key) {
            if existing.request == packet.wire_bytes() {
                debug!(
                    id = packet.id(),
                    transport = %packet.transport,
                    "Got repeat packet from client, ignoring"
                );
                return;
            }
        }

        if let Err(e) = packet.extract() {
            debug!(
                id = packet.id(),
                transport = %packet.transport,
                error = %e,
                "Failed to extract resources from incoming packet, ignoring packet"
            );
            self.send_failure(&ctx, &egress, &packet, rcode::FORMERR, false)
                .await;
            return;
        }

        if packet.question().is_empty() {
            debug!(
                id = packet.id(),
                transport = %packet.transport,
                "Got packet without a question, refusing"
            );
            self.send_failure(&ctx, &egress, &packet, rcode::FORMERR, false)
                .await;
            return;
        }

        if let Some(edns) = packet.edns() {
            if edns.version != 0 {
                debug!(
                    id = packet.id(),
                    transport = %packet.transport,
                    version = edns.version,
                    "Got EDNS OPT field with unsupported version number"
                );
                self.send_failure(&ctx, &egress, &packet, rcode::BADVERS, false)
                    .await;
                return;
            }
        }

        let qtype = packet.question()[0].rtype;
        if qtype.is_obsolete() {
            debug!(
                id = packet.id(),
                transport = %packet.transport,
                qtype = %qtype,
                "Got message with obsolete key type, refusing"
            );
            self.send_failure(&ctx, &egress, &packet, rcode::REFUSED, false)
                .await;
            return;
        }

        if qtype.is_zone_transfer() {
            debug!(
                id = packet.id(),
                transport = %packet.transport,
                "Got request for zone transfer, refusing"
            );
            self.send_failure(&ctx, &egress, &packet, rcode::REFUSED, false)
                .await;
            return;
        }

        if !packet.rd() {
            // Recursion not requested: a stub has nothing else to offer.
            debug!(
                id = packet.id(),
                transport = %packet.transport,
                "Got request with recursion disabled, refusing"
            );
            self.send_failure(&ctx, &egress, &packet, rcode::REFUSED, false)
                .await;
            return;
        }

        let do_bit = packet.dnssec_ok();
        let cd_bit = packet.cd();
        if do_bit && cd_bit {
            debug!(
                id = packet.id(),
                transport = %packet.transport,
                "Got request with DNSSEC checking disabled, enabling bypass logic"
            );
        }

        let request =
            HandleStubQuery::plan(packet.question()[0].clone(), packet.wire_bytes(), do_bit, cd_bit);
        let request_bytes = packet.wire_bytes().to_vec();

        let this = Arc::clone(&self);
        let task_ctx = ctx.clone();
        let task_egress = egress.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let completion = this.resolver.resolve(request).await;
            this.complete_query(&task_ctx, &task_egress, &packet, completion)
                .await;
            this.table(&task_ctx).remove(&task_key);
            if let Egress::Tcp { stream } = &task_egress {
                stream.forget_query(&task_key);
            }
        });

        // Best-effort: losing the table entry only weakens duplicate
        // suppression. The spawned task cannot have run yet on this thread,
        // so the entry is in place before its first poll.
        self.table(&ctx).insert(
            key.clone(),
            InflightEntry {
                request: request_bytes,
            },
        );
        if let Egress::Tcp { stream } = &egress {
            stream.register_query(key, handle.abort_handle());
        }
    }

    async fn complete_query(
        &self,
        ctx: &ListenerContext,
        egress: &Egress,
        packet: &DnsPacket,
        completion: ResolverCompletion,
    ) {
        let do_bit = packet.dnssec_ok();
        let cd_bit = packet.cd();

        if do_bit && cd_bit {
            // Bypass reply: propagate the upstream packet if we have one and
            // it is regular DNS. LLMNR and mDNS packets are not 100%
            // wire-compatible, those fall back to normal assembly.
            if let Some(upstream) = completion
                .full_packet
                .as_ref()
                .filter(|p| p.protocol == DnsProtocol::Dns)
            {
                match reply::patch_bypass_reply(upstream, packet) {
                    Ok(patched) => self.send(ctx, egress, packet, &patched).await,
                    Err(e) => debug!(
                        id = packet.id(),
                        transport = %packet.transport,
                        error = %e,
                        "Failed to patch bypass reply packet"
                    ),
                }
                return;
            }
        }

        let edns0_do = HandleStubQuery::reply_with_edns0_do(do_bit, cd_bit, &completion);
        let sections =
            SectionAssembler::assemble(&completion.items, &packet.question()[0], edns0_do);
        if sections.alias_loop {
            debug!(
                id = packet.id(),
                transport = %packet.transport,
                "Detected alias loop, returning what we already have"
            );
        }

        match HandleStubQuery::disposition(&completion) {
            ReplyDisposition::NoReply => {
                debug!(
                    id = packet.id(),
                    transport = %packet.transport,
                    "Resolver timed out, letting the client time out as well"
                );
            }
            ReplyDisposition::Reply { rcode: reply_rcode } => {
                let flags =
                    HandleStubQuery::reply_flags(do_bit, packet.ad(), cd_bit, &completion);
                let nsid = self.nsid_for(ctx, packet);
                match reply::build_reply(
                    packet,
                    &sections,
                    flags,
                    reply_rcode,
                    ctx.advertised_size(),
                    nsid.as_deref(),
                ) {
                    Ok(built) => self.send(ctx, egress, packet, &built).await,
                    Err(e) => error!(
                        id = packet.id(),
                        transport = %packet.transport,
                        error = %e,
                        "Failed to build reply packet"
                    ),
                }
            }
        }
    }

    async fn send_failure(
        &self,
        ctx: &ListenerContext,
        egress: &Egress,
        packet: &DnsPacket,
        reply_rcode: u16,
        authenticated: bool,
    ) {
        let nsid = self.nsid_for(ctx, packet);
        match reply::build_failure(
            packet,
            reply_rcode,
            authenticated,
            ctx.advertised_size(),
            nsid.as_deref(),
        ) {
            Ok(built) => self.send(ctx, egress, packet, &built).await,
            Err(e) => debug!(
                id = packet.id(),
                transport = %packet.transport,
                error = %e,
                "Failed to build failure packet"
            ),
        }
    }

    /// NSID goes out only on the primary listener, and only when asked for.
    fn nsid_for(&self, ctx: &ListenerContext, packet: &DnsPacket) -> Option<Arc<str>> {
        if ctx.is_primary() && packet.nsid_requested() {
            self.nsid.clone()
        } else {
            None
        }
    }

    async fn send(
        &self,
        ctx: &ListenerContext,
        egress: &Egress,
        request: &DnsPacket,
        built: &DnsPacket,
    ) {
        let result = match egress {
            Egress::Tcp { stream } => stream.write_packet(built.wire_bytes()).await,
            Egress::Udp { socket } => send_udp_reply(socket, ctx, request, built).await,
        };
        if let Err(e) = result {
            debug!(
                id = request.id(),
                transport = %request.transport,
                error = %e,
                "Failed to send reply packet"
            );
        }
    }
}

/// Sends a UDP reply with an explicitly chosen source address. The kernel
/// would otherwise pick the source by routing table and answer 127.0.0.53
/// queries from 127.0.0.1. The primary listener pins 127.0.0.53 on the
/// loopback interface; extras answer from the address and interface the
/// query arrived on.
async fn send_udp_reply(
    socket: &UdpSocket,
    ctx: &ListenerContext,
    request: &DnsPacket,
    built: &DnsPacket,
) -> io::Result<()> {
    let Some(to) = request.sender else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "reply for a packet without a sender",
        ));
    };

    let (src, ifindex) = if ctx.is_primary() {
        (
            Some(IpAddr::V4(DNS_STUB_ADDRESS)),
            Some(LOOPBACK_IFINDEX),
        )
    } else {
        (request.destination, request.ifindex)
    };

    loop {
        socket.writable().await?;
        match socket.try_io(Interest::WRITABLE, || {
            pktinfo::try_send(socket.as_raw_fd(), built.wire_bytes(), to, src, ifindex)
                .map(|_| ())
        }) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

impl std::fmt::Debug for StubDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubDispatcher")
            .field("nsid", &self.nsid)
            .field("inflight", &self.queries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopdns_domain::{DnsName, RecordClass, RecordType, ResourceKey};
    use std::net::SocketAddr;

    fn packet_from(sender: &str, id: u16) -> DnsPacket {
        let mut p = DnsPacket::new(512, Transport::Udp);
        p.set_id(id);
        p.set_flags(0x0100);
        p.append_question(&[ResourceKey::new(
            DnsName::new("example.test").unwrap(),
            RecordClass::IN,
            RecordType::A,
        )])
        .unwrap();
        p.set_qdcount(1);
        let mut p = DnsPacket::from_wire(p.wire_bytes().to_vec(), Transport::Udp).unwrap();
        p.sender = Some(sender.parse::<SocketAddr>().unwrap());
        p
    }

    #[test]
    fn test_dup_key_matches_retransmit() {
        let a = DupKey::for_packet(&packet_from("127.0.0.1:4242", 7)).unwrap();
        let b = DupKey::for_packet(&packet_from("127.0.0.1:4242", 7)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_dup_key_discriminates() {
        let base = DupKey::for_packet(&packet_from("127.0.0.1:4242", 7)).unwrap();
        // Different client port.
        let other_port = DupKey::for_packet(&packet_from("127.0.0.1:4243", 7)).unwrap();
        assert_ne!(base, other_port);
        // Different transaction id.
        let other_id = DupKey::for_packet(&packet_from("127.0.0.1:4242", 8)).unwrap();
        assert_ne!(base, other_id);
        // No sender, no key.
        let mut no_sender = packet_from("127.0.0.1:4242", 7);
        no_sender.sender = None;
        assert!(DupKey::for_packet(&no_sender).is_none());
    }
}
