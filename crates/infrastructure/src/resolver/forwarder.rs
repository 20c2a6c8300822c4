//! Minimal forwarding implementation of the `Resolver` port.
//!
//! Forwards each submission to a configured upstream server: UDP first, TCP
//! retry when the answer comes back truncated. It performs no recursion, no
//! caching and no validation; its job is to make the stub operable and to
//! deliver answers in the shape the stub expects, section hints, RRSIG
//! sidecars and all.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use loopdns_application::ports::{Resolver, ResolverRequest};
use loopdns_domain::{
    rcode, AnswerItem, DnsProtocol, DnssecResult, DomainError, RData, RecordType,
    ResolverCompletion, ResolverState, ResourceKey, Transport, UpstreamPacket,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, warn};

use crate::stub::packet::{DnsPacket, DNS_PACKET_SIZE_MAX};

/// Maximum UDP DNS response size with EDNS(0).
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// EDNS payload we advertise upstream.
const UPSTREAM_ADVERTISE_SIZE: u16 = 4096;

pub struct ForwardingResolver {
    servers: Vec<SocketAddr>,
    timeout: Duration,
    /// Transaction ids of queries currently on the wire, so looped-back
    /// copies of our own packets can be recognized.
    inflight: DashMap<u16, ResourceKey>,
}

impl ForwardingResolver {
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            servers,
            timeout,
            inflight: DashMap::new(),
        })
    }

    fn build_query(
        &self,
        id: u16,
        question: &ResourceKey,
        dnssec_ok: bool,
    ) -> Result<Vec<u8>, DomainError> {
        let mut packet = DnsPacket::new(DNS_PACKET_SIZE_MAX, Transport::Udp);
        packet.set_id(id);
        packet.set_flags(DnsPacket::make_flags(
            false, 0, false, false, true, false, false, false, 0,
        ));
        packet.append_question(std::slice::from_ref(question))?;
        packet.set_qdcount(1);
        packet.append_opt(UPSTREAM_ADVERTISE_SIZE, dnssec_ok, rcode::NOERROR, None)?;
        Ok(packet.wire_bytes().to_vec())
    }

    async fn exchange(&self, server: SocketAddr, query: &[u8]) -> Result<Vec<u8>, DomainError> {
        let reply = self.exchange_udp(server, query).await?;
        if reply.len() > 3 && reply[2] & 0x02 != 0 {
            debug!(server = %server, "Upstream reply truncated, retrying over TCP");
            return self.exchange_tcp(server, query).await;
        }
        Ok(reply)
    }

    async fn exchange_udp(
        &self,
        server: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>, DomainError> {
        let bind_addr: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().expect("fixed address")
        } else {
            "[::]:0".parse().expect("fixed address")
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DomainError::Io(format!("failed to bind UDP socket: {}", e)))?;

        tokio::time::timeout(self.timeout, socket.send_to(query, server))
            .await
            .map_err(|_| DomainError::Timeout(server.to_string()))?
            .map_err(|e| DomainError::Io(format!("failed to send to {}: {}", server, e)))?;

        let mut recv_buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        let (received, from_addr) =
            tokio::time::timeout(self.timeout, socket.recv_from(&mut recv_buf))
                .await
                .map_err(|_| DomainError::Timeout(server.to_string()))?
                .map_err(|e| {
                    DomainError::Io(format!("failed to receive from {}: {}", server, e))
                })?;

        if from_addr.ip() != server.ip() {
            warn!(
                expected = %server,
                received_from = %from_addr,
                "UDP response from unexpected source"
            );
        }

        recv_buf.truncate(received);
        Ok(recv_buf)
    }

    async fn exchange_tcp(
        &self,
        server: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>, DomainError> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect(server))
            .await
            .map_err(|_| DomainError::Timeout(server.to_string()))?
            .map_err(|e| DomainError::Io(format!("failed to connect to {}: {}", server, e)))?;

        tokio::time::timeout(self.timeout, async {
            stream
                .write_all(&(query.len() as u16).to_be_bytes())
                .await?;
            stream.write_all(query).await?;
            stream.flush().await
        })
        .await
        .map_err(|_| DomainError::Timeout(server.to_string()))?
        .map_err(|e| DomainError::Io(format!("failed to send to {}: {}", server, e)))?;

        tokio::time::timeout(self.timeout, async {
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        })
        .await
        .map_err(|_| DomainError::Timeout(server.to_string()))?
        .map_err(|e| DomainError::Io(format!("failed to read from {}: {}", server, e)))
    }

    fn completion_from_reply(
        &self,
        bytes: Vec<u8>,
        keep_full_packet: bool,
    ) -> Result<ResolverCompletion, DomainError> {
        let mut packet = DnsPacket::from_wire(bytes, Transport::Udp)?;
        packet.extract()?;

        let records = packet.extract_records()?;
        let mut items: Vec<AnswerItem> = records
            .into_iter()
            .map(|(rr, hint)| AnswerItem::new(rr).with_hint(hint))
            .collect();
        attach_rrsig_sidecars(&mut items);

        let reply_rcode = packet.rcode();
        let state = match reply_rcode {
            rcode::NOERROR => ResolverState::Success,
            rcode::NXDOMAIN => ResolverState::NotFound,
            _ => ResolverState::RcodeFailure,
        };

        let full_packet = keep_full_packet.then(|| UpstreamPacket {
            protocol: DnsProtocol::Dns,
            bytes: packet.wire_bytes().to_vec(),
            received_at: packet.timestamp,
        });

        Ok(ResolverCompletion {
            state,
            rcode: reply_rcode,
            dnssec_result: DnssecResult::NotValidated,
            items,
            full_packet,
            fully_authenticated: false,
            fully_synthetic: false,
        })
    }
}

#[async_trait]
impl Resolver for ForwardingResolver {
    async fn resolve(&self, request: ResolverRequest) -> ResolverCompletion {
        let Some(&server) = self.servers.first() else {
            debug!(question = %request.question, "No upstream servers configured");
            return ResolverCompletion::failure(ResolverState::NoServers, rcode::SERVFAIL);
        };

        let id = fastrand::u16(..);
        let query = match &request.bypass_packet {
            Some(raw) => {
                // Bypass: forward the client's packet as-is, with our own
                // transaction id.
                match DnsPacket::from_wire(raw.clone(), Transport::Udp) {
                    Ok(mut packet) => {
                        packet.set_id(id);
                        Ok(packet.wire_bytes().to_vec())
                    }
                    Err(e) => Err(e),
                }
            }
            None => self.build_query(id, &request.question, request.flags.require_primary),
        };
        let query = match query {
            Ok(query) => query,
            Err(e) => {
                debug!(question = %request.question, error = %e, "Cannot build upstream query");
                return ResolverCompletion::failure(
                    ResolverState::InvalidReply,
                    rcode::SERVFAIL,
                );
            }
        };

        self.inflight.insert(id, request.question.clone());
        let result = self.exchange(server, &query).await;
        self.inflight.remove(&id);

        match result {
            Ok(bytes) => match self.completion_from_reply(bytes, request.bypass_packet.is_some())
            {
                Ok(completion) => completion,
                Err(e) => {
                    debug!(server = %server, error = %e, "Unparseable upstream reply");
                    ResolverCompletion::failure(ResolverState::InvalidReply, rcode::SERVFAIL)
                }
            },
            Err(DomainError::Timeout(server)) => {
                debug!(server = %server, "Upstream query timed out");
                ResolverCompletion::failure(ResolverState::Timeout, rcode::SERVFAIL)
            }
            Err(e) => {
                debug!(server = %server, error = %e, "Upstream query failed");
                ResolverCompletion::failure(ResolverState::Errno, rcode::SERVFAIL)
            }
        }
    }

    fn packet_is_ours(&self, packet: &[u8]) -> bool {
        let Ok(mut parsed) = DnsPacket::from_wire(packet.to_vec(), Transport::Udp) else {
            return false;
        };
        let Some(question) = self.inflight.get(&parsed.id()) else {
            return false;
        };
        if parsed.extract().is_err() {
            return false;
        }
        parsed.question().first() == Some(question.value())
    }
}

/// Folds RRSIG records into signature sidecars on the record they cover,
/// matching by owner name and the type-covered field. Unmatched RRSIGs stay
/// as standalone items.
fn attach_rrsig_sidecars(items: &mut Vec<AnswerItem>) {
    let mut index = 0;
    while index < items.len() {
        if items[index].rr.key.rtype != RecordType::RRSIG {
            index += 1;
            continue;
        }

        let Some(covered) = rrsig_type_covered(&items[index].rr.rdata) else {
            index += 1;
            continue;
        };
        let owner = items[index].rr.key.name.clone();
        let hint = items[index].hint;

        let target = items.iter().position(|item| {
            item.rr.key.rtype == covered
                && item.rr.key.name == owner
                && item.hint == hint
                && item.rrsig.is_none()
        });

        match target {
            Some(target) => {
                let rrsig = items.remove(index);
                items[target].rrsig = Some(rrsig.rr);
                // No bump: the removal shifted the next item into `index`.
            }
            None => index += 1,
        }
    }
}

fn rrsig_type_covered(rdata: &RData) -> Option<RecordType> {
    match rdata {
        RData::Generic(bytes) if bytes.len() >= 2 => {
            Some(RecordType(u16::from_be_bytes([bytes[0], bytes[1]])))
        }
        _ => None,
    }
}
