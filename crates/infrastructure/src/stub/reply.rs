//! Reply construction and finalization.
//!
//! Turns assembled sections into a finished wire packet: question echo,
//! truncation policy, header flags, OPT/NSID mirroring, and the bypass path
//! that patches an upstream packet instead of building one.

use std::time::Instant;

use loopdns_application::services::AssembledReply;
use loopdns_application::use_cases::ReplyFlags;
use loopdns_domain::{rcode, DomainError, Transport, UpstreamPacket};
use tracing::debug;

use super::packet::{DnsPacket, DNS_PACKET_SIZE_MAX};

/// Datagram size advertised on the primary listener: the loopback MTU of
/// 65536 minus ethernet, IP and UDP headers (14 + 20 + 8).
pub const ADVERTISE_DATAGRAM_SIZE_MAX: u16 = 65494;

/// Datagram size advertised on extra listeners, which may face real
/// networks.
pub const ADVERTISE_EXTRA_DATAGRAM_SIZE_MAX: u16 = 4096;

const FLAG_TC: u16 = 0x0200;

/// Largest reply we may send for this request: the client's advertised
/// ceiling capped by our own, transport permitting.
fn reply_size_max(request: &DnsPacket, advertised_size: u16) -> usize {
    if request.transport == Transport::Tcp {
        return DNS_PACKET_SIZE_MAX;
    }
    request.payload_size_max().min(advertised_size as usize)
}

/// Builds a finished reply packet for `request` from the assembled sections.
///
/// Truncation policy: a question that does not fit sets TC with an empty
/// body; an ANSWER overflow sets TC and stops; an AUTHORITY overflow sets TC
/// only for DO clients; ADDITIONAL overflow silently drops the tail. TCP
/// never truncates on size.
pub fn build_reply(
    request: &DnsPacket,
    sections: &AssembledReply,
    flags: ReplyFlags,
    reply_rcode: u16,
    advertised_size: u16,
    nsid: Option<&str>,
) -> Result<DnsPacket, DomainError> {
    let mut reply = DnsPacket::new(reply_size_max(request, advertised_size), request.transport);
    let mut truncated = false;

    match reply.append_question(request.question()) {
        Ok(()) => reply.set_qdcount(request.question().len() as u16),
        Err(DomainError::ExceedsMaxSize) => truncated = true,
        Err(e) => return Err(e),
    }

    if !truncated {
        let answer = reply.append_answer(&sections.answer)?;
        reply.set_ancount(answer.written);
        if answer.truncated {
            truncated = true;
        } else {
            let authoritative = reply.append_answer(&sections.authoritative)?;
            reply.set_nscount(authoritative.written);
            if authoritative.truncated {
                if flags.edns0_do {
                    truncated = true;
                }
            } else {
                // Dropped trailing ADDITIONAL records are not essential and
                // do not signal truncation.
                let additional = reply.append_answer(&sections.additional)?;
                reply.set_arcount(additional.written);
            }
        }
    }

    finish_reply(
        &mut reply,
        request,
        reply_rcode,
        truncated,
        flags,
        advertised_size,
        nsid,
    )?;
    Ok(reply)
}

/// A failure reply: the echoed question and a status header, nothing else.
pub fn build_failure(
    request: &DnsPacket,
    reply_rcode: u16,
    authenticated: bool,
    advertised_size: u16,
    nsid: Option<&str>,
) -> Result<DnsPacket, DomainError> {
    let mut reply = DnsPacket::new(reply_size_max(request, advertised_size), request.transport);
    let mut truncated = false;

    match reply.append_question(request.question()) {
        Ok(()) => reply.set_qdcount(request.question().len() as u16),
        Err(DomainError::ExceedsMaxSize) => truncated = true,
        Err(e) => return Err(e),
    }

    let flags = ReplyFlags {
        edns0_do: request.dnssec_ok(),
        authoritative: false,
        authenticated_data: request.ad() && authenticated,
        checking_disabled: request.cd(),
    };

    finish_reply(
        &mut reply,
        request,
        reply_rcode,
        truncated,
        flags,
        advertised_size,
        nsid,
    )?;
    Ok(reply)
}

/// Appends the OPT mirror and writes the header. The reply id, QR/RD/RA and
/// the rcode clamping below all live here so every reply goes through one
/// place.
fn finish_reply(
    reply: &mut DnsPacket,
    request: &DnsPacket,
    reply_rcode: u16,
    mut truncated: bool,
    flags: ReplyFlags,
    advertised_size: u16,
    nsid: Option<&str>,
) -> Result<(), DomainError> {
    let mut edns0_do = flags.edns0_do;
    let mut reply_rcode = reply_rcode;

    if request.has_opt() {
        match reply.append_opt(advertised_size, edns0_do, reply_rcode, nsid) {
            Ok(()) => {}
            Err(DomainError::ExceedsMaxSize) => truncated = true,
            Err(e) => return Err(e),
        }
    } else {
        // No EDNS on the request: no DO either, and the rcode has to fit the
        // 4-bit header field.
        edns0_do = false;
        if reply_rcode > rcode::BASIC_RCODE_MAX {
            reply_rcode = rcode::SERVFAIL;
        }
    }

    // CD is never set without DO.
    let cd = flags.checking_disabled && edns0_do;

    reply.set_id(request.id());
    reply.set_flags(DnsPacket::make_flags(
        true,
        0,
        flags.authoritative,
        truncated && request.transport == Transport::Udp,
        request.rd(),
        true,
        flags.authenticated_data,
        cd,
        (reply_rcode & 0xF) as u8,
    ));
    Ok(())
}

/// Patches an upstream packet into a reply for `request`: same bytes, with
/// the client's transaction id, our advertised datagram size, and TTLs aged
/// by the time the packet spent with us. Oversize replies are cut down to
/// the client's ceiling with TC set.
pub fn patch_bypass_reply(
    upstream: &UpstreamPacket,
    request: &DnsPacket,
) -> Result<DnsPacket, DomainError> {
    let mut reply = DnsPacket::from_wire(upstream.bytes.clone(), request.transport)?;
    reply.extract()?;

    reply.set_id(request.id());
    reply.patch_max_udp_size(ADVERTISE_DATAGRAM_SIZE_MAX)?;
    reply.patch_ttls(upstream.received_at, Instant::now())?;

    let limit = request.payload_size_max();
    if reply.len() > limit {
        debug!(
            id = request.id(),
            "Artificially truncating stub response, as advertised size of client is smaller than upstream one"
        );
        reply.truncate(limit);
        reply.set_flags(reply.flags() | FLAG_TC);
    }

    Ok(reply)
}
