use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loopdns_application::ports::{Resolver, ResolverRequest};
use loopdns_domain::{
    AnswerItem, DnsName, RData, RecordClass, RecordType, ResolverCompletion, ResolverState,
    ResourceKey, ResourceRecord, Transport,
};
use loopdns_infrastructure::stub::{DnsPacket, DNS_PACKET_SIZE_MAX};

/// A scriptable resolver: returns a fixed completion after an optional
/// delay, counting submissions.
pub struct MockResolver {
    completion: Mutex<ResolverCompletion>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl MockResolver {
    pub fn returning(completion: ResolverCompletion) -> Arc<Self> {
        Arc::new(Self {
            completion: Mutex::new(completion),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn returning_after(completion: ResolverCompletion, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            completion: Mutex::new(completion),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve(&self, _request: ResolverRequest) -> ResolverCompletion {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completion.lock().unwrap().clone()
    }

    fn packet_is_ours(&self, _packet: &[u8]) -> bool {
        false
    }
}

pub fn question(name: &str, rtype: RecordType) -> ResourceKey {
    ResourceKey::new(DnsName::new(name).unwrap(), RecordClass::IN, rtype)
}

pub fn a_item(name: &str, octets: [u8; 4]) -> AnswerItem {
    AnswerItem::new(ResourceRecord::new(
        question(name, RecordType::A),
        300,
        RData::A(Ipv4Addr::from(octets)),
    ))
}

pub fn cname_item(owner: &str, target: &str) -> AnswerItem {
    AnswerItem::new(ResourceRecord::new(
        question(owner, RecordType::CNAME),
        300,
        RData::Cname(DnsName::new(target).unwrap()),
    ))
}

pub fn rrsig_rr(owner: &str, covered: RecordType) -> ResourceRecord {
    let mut rdata = covered.0.to_be_bytes().to_vec();
    rdata.extend_from_slice(&[5, 2, 0, 0, 1, 44]);
    ResourceRecord::new(
        question(owner, RecordType::RRSIG),
        300,
        RData::Generic(rdata),
    )
}

pub fn success_completion(items: Vec<AnswerItem>) -> ResolverCompletion {
    ResolverCompletion {
        state: ResolverState::Success,
        rcode: 0,
        dnssec_result: loopdns_domain::DnssecResult::NotValidated,
        items,
        full_packet: None,
        fully_authenticated: false,
        fully_synthetic: false,
    }
}

pub struct QuerySpec {
    pub name: &'static str,
    pub rtype: RecordType,
    pub id: u16,
    pub flags: u16,
    pub edns: Option<EdnsSpec>,
}

pub struct EdnsSpec {
    pub payload_size: u16,
    pub dnssec_ok: bool,
    pub nsid: bool,
}

/// Builds raw query bytes the way a stub client would.
pub fn build_query(spec: &QuerySpec) -> Vec<u8> {
    let mut packet = DnsPacket::new(DNS_PACKET_SIZE_MAX, Transport::Udp);
    packet.set_id(spec.id);
    packet.set_flags(spec.flags);
    packet
        .append_question(&[question(spec.name, spec.rtype)])
        .unwrap();
    packet.set_qdcount(1);
    if let Some(edns) = &spec.edns {
        packet
            .append_opt(
                edns.payload_size,
                edns.dnssec_ok,
                0,
                edns.nsid.then_some(""),
            )
            .unwrap();
    }
    packet.wire_bytes().to_vec()
}

/// Parses reply bytes into a fully-extracted packet for assertions.
pub fn parse_reply(bytes: &[u8]) -> DnsPacket {
    let mut packet = DnsPacket::from_wire(bytes.to_vec(), Transport::Udp).unwrap();
    packet.extract().unwrap();
    packet
}
