//! End-to-end stub tests over real sockets: an extra listener on an
//! ephemeral loopback port, a scripted resolver behind the port, and a
//! plain UDP/TCP client in front.

use std::sync::Arc;
use std::time::{Duration, Instant};

use loopdns_domain::{
    rcode, Config, DnsProtocol, DnssecResult, ListenerMode, RecordType, ResolverState,
    Transport, UpstreamPacket,
};
use loopdns_infrastructure::stub::{
    DnsPacket, StubDispatcher, StubListenerSet, ADVERTISE_DATAGRAM_SIZE_MAX,
    DNS_PACKET_SIZE_MAX,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

mod helpers;
use helpers::*;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn test_config() -> Config {
    let mut config = Config::default();
    // The primary listener needs port 53; tests run on an ephemeral extra.
    config.stub.listener = ListenerMode::No;
    config.stub.extra = vec!["127.0.0.1:0".to_string()];
    config
}

async fn start_stub(
    resolver: Arc<MockResolver>,
    nsid: Option<String>,
) -> (StubListenerSet, std::net::SocketAddr, std::net::SocketAddr) {
    let dispatcher = StubDispatcher::new(resolver, nsid);
    let listeners = StubListenerSet::start(&test_config(), dispatcher).unwrap();
    let udp = listeners.extra_udp_addrs()[0];
    let tcp = listeners.extra_tcp_addrs()[0];
    (listeners, udp, tcp)
}

async fn udp_roundtrip(server: std::net::SocketAddr, query: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(query, server).await.unwrap();
    let mut buf = vec![0u8; 0x10000];
    let (n, from) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
        .await
        .expect("no reply within timeout")
        .unwrap();
    assert_eq!(from, server);
    buf.truncate(n);
    buf
}

#[tokio::test]
async fn test_s1_plain_a_query() {
    let resolver = MockResolver::returning(success_completion(vec![a_item(
        "example.test",
        [203, 0, 113, 7],
    )]));
    let (listeners, udp, _) = start_stub(resolver.clone(), None).await;

    let query = build_query(&QuerySpec {
        name: "example.test",
        rtype: RecordType::A,
        id: 0x4242,
        flags: 0x0100,
        edns: None,
    });
    let reply = parse_reply(&udp_roundtrip(udp, &query).await);

    assert_eq!(reply.id(), 0x4242);
    assert!(reply.is_response());
    assert!(reply.rd());
    assert!(reply.ra());
    assert!(!reply.ad());
    assert_eq!(reply.rcode(), rcode::NOERROR);
    assert_eq!(reply.ancount(), 1);
    // No EDNS on the request, none on the reply.
    assert!(!reply.has_opt());
    assert_eq!(resolver.call_count(), 1);

    listeners.stop();
}

#[tokio::test]
async fn test_s2_dnssec_chain_with_do() {
    let items = vec![
        cname_item("www.example.test", "srv.example.test")
            .with_rrsig(rrsig_rr("www.example.test", RecordType::CNAME)),
        a_item("srv.example.test", [203, 0, 113, 9])
            .with_rrsig(rrsig_rr("srv.example.test", RecordType::A)),
    ];
    let mut completion = success_completion(items);
    completion.dnssec_result = DnssecResult::Secure;
    completion.fully_authenticated = true;

    let (listeners, udp, _) = start_stub(MockResolver::returning(completion), None).await;

    // RD + AD in the header, DO in the OPT.
    let query = build_query(&QuerySpec {
        name: "www.example.test",
        rtype: RecordType::A,
        id: 0x0202,
        flags: 0x0120,
        edns: Some(EdnsSpec {
            payload_size: 4096,
            dnssec_ok: true,
            nsid: false,
        }),
    });
    let reply = parse_reply(&udp_roundtrip(udp, &query).await);

    assert_eq!(reply.rcode(), rcode::NOERROR);
    assert_eq!(reply.ancount(), 4);
    assert_eq!(reply.nscount(), 0);
    assert!(reply.ad());
    assert!(reply.has_opt());
    assert!(reply.edns().unwrap().dnssec_ok);

    let records = reply.extract_records().unwrap();
    let types: Vec<RecordType> = records.iter().map(|(rr, _)| rr.key.rtype).collect();
    assert_eq!(
        &types[..4],
        &[
            RecordType::CNAME,
            RecordType::RRSIG,
            RecordType::A,
            RecordType::RRSIG
        ]
    );

    listeners.stop();
}

#[tokio::test]
async fn test_s3_zone_transfer_refused() {
    let resolver = MockResolver::returning(success_completion(vec![]));
    let (listeners, udp, _) = start_stub(resolver.clone(), None).await;

    let query = build_query(&QuerySpec {
        name: "example.test",
        rtype: RecordType::AXFR,
        id: 0x0303,
        flags: 0x0100,
        edns: None,
    });
    let reply = parse_reply(&udp_roundtrip(udp, &query).await);

    assert_eq!(reply.rcode(), rcode::REFUSED);
    assert_eq!(reply.ancount(), 0);
    // Refused before the resolver ever saw it.
    assert_eq!(resolver.call_count(), 0);

    listeners.stop();
}

#[tokio::test]
async fn test_obsolete_type_refused() {
    let resolver = MockResolver::returning(success_completion(vec![]));
    let (listeners, udp, _) = start_stub(resolver.clone(), None).await;

    let query = build_query(&QuerySpec {
        name: "example.test",
        rtype: RecordType::MD,
        id: 0x0404,
        flags: 0x0100,
        edns: None,
    });
    let reply = parse_reply(&udp_roundtrip(udp, &query).await);
    assert_eq!(reply.rcode(), rcode::REFUSED);
    assert_eq!(resolver.call_count(), 0);

    listeners.stop();
}

#[tokio::test]
async fn test_recursion_not_desired_refused() {
    let resolver = MockResolver::returning(success_completion(vec![]));
    let (listeners, udp, _) = start_stub(resolver.clone(), None).await;

    let query = build_query(&QuerySpec {
        name: "example.test",
        rtype: RecordType::A,
        id: 0x0505,
        flags: 0x0000,
        edns: None,
    });
    let reply = parse_reply(&udp_roundtrip(udp, &query).await);
    assert_eq!(reply.rcode(), rcode::REFUSED);
    assert!(!reply.rd());
    assert_eq!(resolver.call_count(), 0);

    listeners.stop();
}

#[tokio::test]
async fn test_s5_duplicate_suppression() {
    let resolver = MockResolver::returning_after(
        success_completion(vec![a_item("example.test", [203, 0, 113, 7])]),
        Duration::from_millis(200),
    );
    let (listeners, udp, _) = start_stub(resolver.clone(), None).await;

    let query = build_query(&QuerySpec {
        name: "example.test",
        rtype: RecordType::A,
        id: 0x0606,
        flags: 0x0100,
        edns: None,
    });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query, udp).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    client.send_to(&query, udp).await.unwrap();

    let mut buf = vec![0u8; 0x10000];
    let (n, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
        .await
        .expect("no reply within timeout")
        .unwrap();
    let reply = parse_reply(&buf[..n]);
    assert_eq!(reply.id(), 0x0606);

    // Exactly one resolver submission, exactly one reply.
    assert_eq!(resolver.call_count(), 1);
    let second = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(second.is_err(), "retransmit must not produce a second reply");

    listeners.stop();
}

#[tokio::test]
async fn test_nxdomain_mapping() {
    let mut completion = success_completion(vec![]);
    completion.state = ResolverState::NotFound;
    let (listeners, udp, _) = start_stub(MockResolver::returning(completion), None).await;

    let query = build_query(&QuerySpec {
        name: "missing.example.test",
        rtype: RecordType::A,
        id: 0x0707,
        flags: 0x0100,
        edns: None,
    });
    let reply = parse_reply(&udp_roundtrip(udp, &query).await);
    assert_eq!(reply.rcode(), rcode::NXDOMAIN);

    listeners.stop();
}

#[tokio::test]
async fn test_resolver_timeout_means_silence() {
    let mut completion = success_completion(vec![]);
    completion.state = ResolverState::Timeout;
    let (listeners, udp, _) = start_stub(MockResolver::returning(completion), None).await;

    let query = build_query(&QuerySpec {
        name: "slow.example.test",
        rtype: RecordType::A,
        id: 0x0808,
        flags: 0x0100,
        edns: None,
    });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query, udp).await.unwrap();
    let mut buf = vec![0u8; 512];
    let outcome = timeout(Duration::from_millis(300), client.recv_from(&mut buf)).await;
    assert!(outcome.is_err(), "timeouts must propagate as silence");

    listeners.stop();
}

#[tokio::test]
async fn test_nsid_suppressed_on_extra_listener() {
    let resolver = MockResolver::returning(success_completion(vec![a_item(
        "example.test",
        [203, 0, 113, 7],
    )]));
    let (listeners, udp, _) = start_stub(
        resolver,
        Some("00ff00ff00ff00ff00ff00ff00ff00ff.loopdns.example".to_string()),
    )
    .await;

    let query = build_query(&QuerySpec {
        name: "example.test",
        rtype: RecordType::A,
        id: 0x0909,
        flags: 0x0100,
        edns: Some(EdnsSpec {
            payload_size: 4096,
            dnssec_ok: false,
            nsid: true,
        }),
    });
    let reply = parse_reply(&udp_roundtrip(udp, &query).await);

    assert!(reply.has_opt());
    // The NSID request came over an extra listener: no NSID in the reply.
    assert!(!reply.nsid_requested());

    listeners.stop();
}

#[tokio::test]
async fn test_s6_bypass_patched_upstream() {
    // Upstream packet: a 300 s TTL answer received two seconds ago.
    let mut upstream = DnsPacket::new(DNS_PACKET_SIZE_MAX, Transport::Udp);
    upstream.set_id(0x9999);
    upstream.set_flags(0x8180);
    upstream
        .append_question(&[question("secure.example.test", RecordType::A)])
        .unwrap();
    upstream.set_qdcount(1);
    upstream
        .append_rr(&a_item("secure.example.test", [203, 0, 113, 44]).rr)
        .unwrap();
    upstream.set_ancount(1);
    upstream.append_opt(1232, true, 0, None).unwrap();

    let mut completion = success_completion(vec![]);
    completion.full_packet = Some(UpstreamPacket {
        protocol: DnsProtocol::Dns,
        bytes: upstream.wire_bytes().to_vec(),
        received_at: Instant::now() - Duration::from_secs(2),
    });

    let (listeners, udp, _) = start_stub(MockResolver::returning(completion), None).await;

    // DO + CD selects the bypass path.
    let query = build_query(&QuerySpec {
        name: "secure.example.test",
        rtype: RecordType::A,
        id: 0x0A0A,
        flags: 0x0110,
        edns: Some(EdnsSpec {
            payload_size: 65494,
            dnssec_ok: true,
            nsid: false,
        }),
    });
    let raw = udp_roundtrip(udp, &query).await;
    let reply = parse_reply(&raw);

    assert_eq!(raw.len(), upstream.wire_bytes().len());
    assert_eq!(reply.id(), 0x0A0A);
    assert_eq!(
        reply.edns().unwrap().payload_size,
        ADVERTISE_DATAGRAM_SIZE_MAX
    );
    let records = reply.extract_records().unwrap();
    assert_eq!(records[0].0.ttl, 298);

    listeners.stop();
}

#[tokio::test]
async fn test_tcp_roundtrip_and_large_reply() {
    // 60 A records: too big for a 512-byte datagram, fine for TCP.
    let items = (0..60)
        .map(|i| a_item("big.example.test", [203, 0, 113, i as u8]))
        .collect();
    let (listeners, _, tcp) =
        start_stub(MockResolver::returning(success_completion(items)), None).await;

    let query = build_query(&QuerySpec {
        name: "big.example.test",
        rtype: RecordType::A,
        id: 0x0B0B,
        flags: 0x0100,
        edns: None,
    });

    let mut stream = TcpStream::connect(tcp).await.unwrap();
    stream
        .write_all(&(query.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&query).await.unwrap();

    let mut len_buf = [0u8; 2];
    timeout(RECV_TIMEOUT, stream.read_exact(&mut len_buf))
        .await
        .expect("no reply within timeout")
        .unwrap();
    let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    stream.read_exact(&mut body).await.unwrap();

    let reply = parse_reply(&body);
    assert_eq!(reply.id(), 0x0B0B);
    assert!(!reply.tc());
    assert_eq!(reply.ancount(), 60);

    listeners.stop();
}

#[tokio::test]
async fn test_s4_udp_truncation() {
    let items = (0..60)
        .map(|i| a_item("big.example.test", [203, 0, 113, i as u8]))
        .collect();
    let (listeners, udp, _) =
        start_stub(MockResolver::returning(success_completion(items)), None).await;

    // Client advertises a 512-byte ceiling.
    let query = build_query(&QuerySpec {
        name: "big.example.test",
        rtype: RecordType::A,
        id: 0x0C0C,
        flags: 0x0100,
        edns: Some(EdnsSpec {
            payload_size: 512,
            dnssec_ok: false,
            nsid: false,
        }),
    });
    let raw = udp_roundtrip(udp, &query).await;
    assert!(raw.len() <= 512);

    let reply = parse_reply(&raw);
    assert!(reply.tc());
    assert!(reply.ancount() > 0 && reply.ancount() < 60);
    let records = reply.extract_records().unwrap();
    assert_eq!(records.len(), reply.ancount() as usize);

    listeners.stop();
}

#[tokio::test]
async fn test_tcp_disconnect_cancels_queries() {
    let resolver = MockResolver::returning_after(
        success_completion(vec![a_item("example.test", [203, 0, 113, 7])]),
        Duration::from_millis(500),
    );
    let (listeners, _, tcp) = start_stub(resolver.clone(), None).await;

    let query = build_query(&QuerySpec {
        name: "example.test",
        rtype: RecordType::A,
        id: 0x0D0D,
        flags: 0x0100,
        edns: None,
    });

    let mut stream = TcpStream::connect(tcp).await.unwrap();
    stream
        .write_all(&(query.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(&query).await.unwrap();
    // Give the stub a moment to start the query, then hang up.
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(stream);

    // The resolver was reached once; the completed reply has nowhere to go
    // and the query is torn down without panicking the server.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(resolver.call_count(), 1);

    listeners.stop();
}
