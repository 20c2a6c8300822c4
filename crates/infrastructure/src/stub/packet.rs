//! DNS wire-format packets.
//!
//! A [`DnsPacket`] is a raw byte buffer with a declared maximum size plus the
//! ingress metadata the stub needs (transport, addresses, arrival time) and
//! the pieces extracted from the wire (questions, EDNS state). Construction
//! is append-only and bounded: every append either fits completely or fails
//! with [`DomainError::ExceedsMaxSize`] leaving the buffer untouched, which
//! is what the truncation logic upstack is built on.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use loopdns_domain::{
    AnswerItem, DnsName, DnsProtocol, DomainError, RData, RecordClass, RecordType, ResourceKey,
    ResourceRecord, SectionHint, Transport,
};

pub const DNS_PACKET_HEADER_SIZE: usize = 12;

/// Hard upper bound of a DNS message (TCP length prefix is 16 bit).
pub const DNS_PACKET_SIZE_MAX: usize = 0xFFFF;

/// Payload a client without EDNS(0) is assumed to accept (RFC 1035).
pub const DNS_PACKET_UNICAST_SIZE_MAX: usize = 512;

const EDNS_OPTION_NSID: u16 = 3;
const COMPRESSION_JUMPS_MAX: usize = 64;

/// Result of appending a section's records.
#[derive(Debug, Clone, Copy)]
pub struct AppendedAnswer {
    pub written: u16,
    /// True when at least one trailing record did not fit.
    pub truncated: bool,
}

/// EDNS(0) state of a packet, filled in by [`DnsPacket::extract`].
#[derive(Debug, Clone, Copy)]
pub struct EdnsInfo {
    pub payload_size: u16,
    pub extended_rcode: u8,
    pub version: u8,
    pub dnssec_ok: bool,
    pub nsid_requested: bool,
    /// Offset of the OPT record's owner name in the buffer.
    offset: usize,
}

#[derive(Debug, Clone)]
pub struct DnsPacket {
    data: Vec<u8>,
    max_size: usize,
    pub protocol: DnsProtocol,
    pub transport: Transport,
    pub sender: Option<SocketAddr>,
    /// Local address the packet arrived on, when the socket reported it.
    pub destination: Option<IpAddr>,
    pub ifindex: Option<u32>,
    pub timestamp: Instant,
    question: Vec<ResourceKey>,
    edns: Option<EdnsInfo>,
}

impl DnsPacket {
    /// An empty packet (zeroed header) that will refuse to grow beyond
    /// `max_size` bytes.
    pub fn new(max_size: usize, transport: Transport) -> Self {
        let max_size = max_size.clamp(DNS_PACKET_HEADER_SIZE, DNS_PACKET_SIZE_MAX);
        Self {
            data: vec![0u8; DNS_PACKET_HEADER_SIZE],
            max_size,
            protocol: DnsProtocol::Dns,
            transport,
            sender: None,
            destination: None,
            ifindex: None,
            timestamp: Instant::now(),
            question: Vec::new(),
            edns: None,
        }
    }

    /// Wraps received bytes. Fails when the buffer cannot even hold a
    /// header; everything beyond that is left to [`extract`](Self::extract).
    pub fn from_wire(bytes: Vec<u8>, transport: Transport) -> Result<Self, DomainError> {
        if bytes.len() < DNS_PACKET_HEADER_SIZE {
            return Err(DomainError::PacketTooShort);
        }
        if bytes.len() > DNS_PACKET_SIZE_MAX {
            return Err(DomainError::BadPacket(format!(
                "{} bytes exceeds the DNS message limit",
                bytes.len()
            )));
        }
        let max_size = bytes.len();
        Ok(Self {
            data: bytes,
            max_size,
            protocol: DnsProtocol::Dns,
            transport,
            sender: None,
            destination: None,
            ifindex: None,
            timestamp: Instant::now(),
            question: Vec::new(),
            edns: None,
        })
    }

    pub fn wire_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn header_bytes(&self) -> [u8; DNS_PACKET_HEADER_SIZE] {
        let mut header = [0u8; DNS_PACKET_HEADER_SIZE];
        header.copy_from_slice(&self.data[..DNS_PACKET_HEADER_SIZE]);
        header
    }

    pub fn question(&self) -> &[ResourceKey] {
        &self.question
    }

    pub fn edns(&self) -> Option<&EdnsInfo> {
        self.edns.as_ref()
    }

    pub fn has_opt(&self) -> bool {
        self.edns.is_some()
    }

    pub fn nsid_requested(&self) -> bool {
        self.edns.is_some_and(|e| e.nsid_requested)
    }

    /// A byte-for-byte copy sharing no storage with the original.
    pub fn duplicate(&self) -> DnsPacket {
        self.clone()
    }

    /// Canonical byte-form equality.
    pub fn bytes_equal(&self, other: &DnsPacket) -> bool {
        self.data == other.data
    }

    /* ---- header accessors ---- */

    fn get_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    fn put_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn id(&self) -> u16 {
        self.get_u16(0)
    }

    pub fn set_id(&mut self, id: u16) {
        self.put_u16(0, id);
    }

    pub fn flags(&self) -> u16 {
        self.get_u16(2)
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.put_u16(2, flags);
    }

    pub fn is_response(&self) -> bool {
        self.flags() & 0x8000 != 0
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags() >> 11) & 0xF) as u8
    }

    pub fn aa(&self) -> bool {
        self.flags() & 0x0400 != 0
    }

    pub fn tc(&self) -> bool {
        self.flags() & 0x0200 != 0
    }

    pub fn rd(&self) -> bool {
        self.flags() & 0x0100 != 0
    }

    pub fn ra(&self) -> bool {
        self.flags() & 0x0080 != 0
    }

    pub fn ad(&self) -> bool {
        self.flags() & 0x0020 != 0
    }

    pub fn cd(&self) -> bool {
        self.flags() & 0x0010 != 0
    }

    /// DNSSEC OK: only meaningful with an OPT present.
    pub fn dnssec_ok(&self) -> bool {
        self.edns.is_some_and(|e| e.dnssec_ok)
    }

    /// Full rcode including the EDNS extended bits.
    pub fn rcode(&self) -> u16 {
        let basic = self.flags() & 0xF;
        match &self.edns {
            Some(e) => ((e.extended_rcode as u16) << 4) | basic,
            None => basic,
        }
    }

    pub fn qdcount(&self) -> u16 {
        self.get_u16(4)
    }

    pub fn ancount(&self) -> u16 {
        self.get_u16(6)
    }

    pub fn nscount(&self) -> u16 {
        self.get_u16(8)
    }

    pub fn arcount(&self) -> u16 {
        self.get_u16(10)
    }

    pub fn set_qdcount(&mut self, n: u16) {
        self.put_u16(4, n);
    }

    pub fn set_ancount(&mut self, n: u16) {
        self.put_u16(6, n);
    }

    pub fn set_nscount(&mut self, n: u16) {
        self.put_u16(8, n);
    }

    pub fn set_arcount(&mut self, n: u16) {
        self.put_u16(10, n);
    }

    /// Assembles the 16-bit header flag word.
    #[allow(clippy::too_many_arguments)]
    pub fn make_flags(
        qr: bool,
        opcode: u8,
        aa: bool,
        tc: bool,
        rd: bool,
        ra: bool,
        ad: bool,
        cd: bool,
        rcode: u8,
    ) -> u16 {
        ((qr as u16) << 15)
            | (((opcode & 0xF) as u16) << 11)
            | ((aa as u16) << 10)
            | ((tc as u16) << 9)
            | ((rd as u16) << 8)
            | ((ra as u16) << 7)
            | ((ad as u16) << 5)
            | ((cd as u16) << 4)
            | ((rcode & 0xF) as u16)
    }

    /// Sanity check for something that claims to be a query.
    pub fn validate_query(&self) -> bool {
        !self.is_response() && self.opcode() == 0 && !self.tc()
    }

    /// Largest reply payload the sender of this packet accepts.
    pub fn payload_size_max(&self) -> usize {
        if self.transport == Transport::Tcp {
            return DNS_PACKET_SIZE_MAX;
        }
        match &self.edns {
            Some(e) => (e.payload_size as usize).max(DNS_PACKET_UNICAST_SIZE_MAX),
            None => DNS_PACKET_UNICAST_SIZE_MAX,
        }
    }

    /* ---- extraction ---- */

    /// Parses the question section and the OPT pseudo-RR. Resource records
    /// other than OPT are located but not decoded here.
    pub fn extract(&mut self) -> Result<(), DomainError> {
        let mut pos = DNS_PACKET_HEADER_SIZE;

        let mut question = Vec::with_capacity(self.qdcount() as usize);
        for _ in 0..self.qdcount() {
            let (key, next) = read_key(&self.data, pos)?;
            question.push(key);
            pos = next;
        }

        let mut edns: Option<EdnsInfo> = None;
        let n_records = self.ancount() as usize + self.nscount() as usize
            + self.arcount() as usize;
        for _ in 0..n_records {
            let record_start = pos;
            let (name, next) = read_name(&self.data, pos)?;
            pos = next;

            let fixed = self
                .data
                .get(pos..pos + 10)
                .ok_or(DomainError::PacketTooShort)?;
            let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
            let class = u16::from_be_bytes([fixed[2], fixed[3]]);
            let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
            let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
            pos += 10;

            let rdata = self
                .data
                .get(pos..pos + rdlen)
                .ok_or(DomainError::PacketTooShort)?;

            if RecordType(rtype) == RecordType::OPT {
                if edns.is_some() {
                    return Err(DomainError::BadPacket(
                        "more than one OPT record".to_string(),
                    ));
                }
                if !name.is_root() {
                    return Err(DomainError::BadPacket(
                        "OPT record with a non-root owner".to_string(),
                    ));
                }
                edns = Some(EdnsInfo {
                    payload_size: class,
                    extended_rcode: (ttl >> 24) as u8,
                    version: ((ttl >> 16) & 0xFF) as u8,
                    dnssec_ok: ttl & 0x8000 != 0,
                    nsid_requested: rdata_has_option(rdata, EDNS_OPTION_NSID)?,
                    offset: record_start,
                });
            }

            pos += rdlen;
        }

        self.question = question;
        self.edns = edns;
        Ok(())
    }

    /// Decodes every resource record with its reply section, skipping the
    /// OPT pseudo-RR. Compressed names in the classic name-bearing rdata
    /// types are resolved so nothing keeps pointing into this buffer.
    pub fn extract_records(
        &self,
    ) -> Result<Vec<(ResourceRecord, SectionHint)>, DomainError> {
        let mut pos = DNS_PACKET_HEADER_SIZE;
        for _ in 0..self.qdcount() {
            let (_, next) = read_key(&self.data, pos)?;
            pos = next;
        }

        let sections = [
            (self.ancount() as usize, SectionHint::Answer),
            (self.nscount() as usize, SectionHint::Authority),
            (self.arcount() as usize, SectionHint::Additional),
        ];

        let mut records = Vec::new();
        for (count, hint) in sections {
            for _ in 0..count {
                let (name, next) = read_name(&self.data, pos)?;
                pos = next;

                let fixed = self
                    .data
                    .get(pos..pos + 10)
                    .ok_or(DomainError::PacketTooShort)?;
                let rtype = RecordType(u16::from_be_bytes([fixed[0], fixed[1]]));
                let class = RecordClass(u16::from_be_bytes([fixed[2], fixed[3]]));
                let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
                let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
                pos += 10;

                if self.data.len() < pos + rdlen {
                    return Err(DomainError::PacketTooShort);
                }

                if rtype != RecordType::OPT {
                    let rdata = read_rdata(&self.data, pos, rdlen, rtype)?;
                    records.push((
                        ResourceRecord::new(ResourceKey::new(name, class, rtype), ttl, rdata),
                        hint,
                    ));
                }

                pos += rdlen;
            }
        }

        Ok(records)
    }

    /* ---- bounded appends ---- */

    fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), DomainError> {
        if self.data.len() + bytes.len() > self.max_size {
            return Err(DomainError::ExceedsMaxSize);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends the question section. Atomic: on failure nothing is written.
    /// The caller still owns QDCOUNT.
    pub fn append_question(&mut self, keys: &[ResourceKey]) -> Result<(), DomainError> {
        let mut buf = Vec::new();
        for key in keys {
            encode_name(&mut buf, &key.name);
            buf.extend_from_slice(&key.rtype.0.to_be_bytes());
            buf.extend_from_slice(&key.class.0.to_be_bytes());
        }
        self.append_bytes(&buf)
    }

    /// Appends a run of answer items record by record. Each record append is
    /// atomic; when one does not fit, the outcome reports how many made it
    /// and that the rest were cut, and the packet keeps everything written
    /// so far. Section counts stay with the caller.
    pub fn append_answer(
        &mut self,
        items: &[AnswerItem],
    ) -> Result<AppendedAnswer, DomainError> {
        let mut written = 0u16;
        for item in items {
            match self.append_rr(&item.rr) {
                Ok(()) => written += 1,
                Err(DomainError::ExceedsMaxSize) => {
                    return Ok(AppendedAnswer {
                        written,
                        truncated: true,
                    })
                }
                Err(e) => return Err(e),
            }
        }
        Ok(AppendedAnswer {
            written,
            truncated: false,
        })
    }

    /// Appends one resource record, uncompressed. Atomic.
    pub fn append_rr(&mut self, rr: &ResourceRecord) -> Result<(), DomainError> {
        let mut buf = Vec::new();
        encode_name(&mut buf, &rr.key.name);
        buf.extend_from_slice(&rr.key.rtype.0.to_be_bytes());
        buf.extend_from_slice(&rr.key.class.0.to_be_bytes());
        buf.extend_from_slice(&rr.ttl.to_be_bytes());

        let mut rdata = Vec::new();
        encode_rdata(&mut rdata, &rr.rdata);
        if rdata.len() > u16::MAX as usize {
            return Err(DomainError::BadPacket("rdata too large".to_string()));
        }
        buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&rdata);

        self.append_bytes(&buf)
    }

    /// Appends the EDNS(0) OPT pseudo-RR and bumps ARCOUNT. The upper bits
    /// of `rcode` go into the extended-rcode field. Atomic.
    pub fn append_opt(
        &mut self,
        payload_size: u16,
        dnssec_ok: bool,
        rcode: u16,
        nsid: Option<&str>,
    ) -> Result<(), DomainError> {
        let mut buf = Vec::new();
        buf.push(0); /* root owner */
        buf.extend_from_slice(&RecordType::OPT.0.to_be_bytes());
        buf.extend_from_slice(&payload_size.to_be_bytes());

        let ttl: u32 = ((rcode as u32 >> 4) << 24) | if dnssec_ok { 0x8000 } else { 0 };
        buf.extend_from_slice(&ttl.to_be_bytes());

        let mut rdata = Vec::new();
        if let Some(nsid) = nsid {
            rdata.extend_from_slice(&EDNS_OPTION_NSID.to_be_bytes());
            rdata.extend_from_slice(&(nsid.len() as u16).to_be_bytes());
            rdata.extend_from_slice(nsid.as_bytes());
        }
        buf.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        buf.extend_from_slice(&rdata);

        self.append_bytes(&buf)?;
        let arcount = self.arcount() + 1;
        self.set_arcount(arcount);
        Ok(())
    }

    /* ---- in-place patching ---- */

    /// Cuts the packet down to `new_size` bytes. Section counts are left
    /// alone; the TC bit is how the receiver learns the tail is gone.
    pub fn truncate(&mut self, new_size: usize) {
        let new_size = new_size.max(DNS_PACKET_HEADER_SIZE);
        if new_size < self.data.len() {
            self.data.truncate(new_size);
        }
    }

    /// Rewrites the advertised UDP payload size of the OPT record found by
    /// [`extract`](Self::extract). No-op without EDNS.
    pub fn patch_max_udp_size(&mut self, size: u16) -> Result<(), DomainError> {
        let Some(edns) = self.edns else {
            return Ok(());
        };
        let pos = skip_name(&self.data, edns.offset)?;
        if self.data.len() < pos + 4 {
            return Err(DomainError::PacketTooShort);
        }
        self.put_u16(pos + 2, size);
        if let Some(edns) = self.edns.as_mut() {
            edns.payload_size = size;
        }
        Ok(())
    }

    /// Lowers every record TTL by the whole seconds elapsed since `since`,
    /// clamping at zero. The wire length never changes. OPT is skipped, its
    /// TTL field holds flags.
    pub fn patch_ttls(&mut self, since: Instant, now: Instant) -> Result<(), DomainError> {
        let age = now.saturating_duration_since(since).as_secs();
        let age = u32::try_from(age).unwrap_or(u32::MAX);
        if age == 0 {
            return Ok(());
        }

        let mut pos = DNS_PACKET_HEADER_SIZE;
        for _ in 0..self.qdcount() {
            pos = skip_name(&self.data, pos)?;
            pos += 4;
        }

        let n_records = self.ancount() as usize + self.nscount() as usize
            + self.arcount() as usize;
        for _ in 0..n_records {
            pos = skip_name(&self.data, pos)?;
            let fixed = self
                .data
                .get(pos..pos + 10)
                .ok_or(DomainError::PacketTooShort)?;
            let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
            let rdlen = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;

            if RecordType(rtype) != RecordType::OPT {
                let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
                let patched = ttl.saturating_sub(age);
                self.data[pos + 4..pos + 8].copy_from_slice(&patched.to_be_bytes());
            }

            pos += 10 + rdlen;
            if pos > self.data.len() {
                return Err(DomainError::PacketTooShort);
            }
        }

        Ok(())
    }
}

/* ---- wire helpers ---- */

fn encode_name(buf: &mut Vec<u8>, name: &DnsName) {
    for label in name.labels() {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

fn encode_rdata(buf: &mut Vec<u8>, rdata: &RData) {
    match rdata {
        RData::A(addr) => buf.extend_from_slice(&addr.octets()),
        RData::Aaaa(addr) => buf.extend_from_slice(&addr.octets()),
        RData::Cname(name) | RData::Dname(name) | RData::Ns(name) | RData::Ptr(name) => {
            encode_name(buf, name)
        }
        RData::Mx {
            preference,
            exchange,
        } => {
            buf.extend_from_slice(&preference.to_be_bytes());
            encode_name(buf, exchange);
        }
        RData::Soa {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            encode_name(buf, mname);
            encode_name(buf, rname);
            for v in [serial, refresh, retry, expire, minimum] {
                buf.extend_from_slice(&v.to_be_bytes());
            }
        }
        RData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            for v in [priority, weight, port] {
                buf.extend_from_slice(&v.to_be_bytes());
            }
            encode_name(buf, target);
        }
        RData::Txt(strings) => {
            for s in strings {
                buf.push(s.len() as u8);
                buf.extend_from_slice(s);
            }
        }
        RData::Generic(bytes) => buf.extend_from_slice(bytes),
    }
}

/// Decodes a possibly-compressed name starting at `start`. Returns the name
/// and the offset just past its in-line representation. Pointers must aim
/// strictly backwards, which also bounds the walk.
fn read_name(data: &[u8], start: usize) -> Result<(DnsName, usize), DomainError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end = None;
    let mut jumps = 0usize;

    loop {
        let len = *data.get(pos).ok_or(DomainError::PacketTooShort)? as usize;
        match len {
            0 => {
                pos += 1;
                break;
            }
            l if l & 0xC0 == 0xC0 => {
                let low = *data.get(pos + 1).ok_or(DomainError::PacketTooShort)?;
                let target = ((l & 0x3F) << 8) | low as usize;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                if target >= pos {
                    return Err(DomainError::BadPacket(
                        "forward compression pointer".to_string(),
                    ));
                }
                jumps += 1;
                if jumps > COMPRESSION_JUMPS_MAX {
                    return Err(DomainError::BadPacket(
                        "too many compression pointers".to_string(),
                    ));
                }
                pos = target;
            }
            l if l & 0xC0 != 0 => {
                return Err(DomainError::BadPacket(
                    "unsupported label type".to_string(),
                ));
            }
            l => {
                let label = data
                    .get(pos + 1..pos + 1 + l)
                    .ok_or(DomainError::PacketTooShort)?;
                let label = std::str::from_utf8(label)
                    .map_err(|_| DomainError::BadPacket("non-ASCII label".to_string()))?;
                labels.push(label.to_string());
                pos += 1 + l;
            }
        }
    }

    let name = DnsName::new(&labels.join("."))?;
    Ok((name, end.unwrap_or(pos)))
}

/// Advances past a name without decoding it.
fn skip_name(data: &[u8], start: usize) -> Result<usize, DomainError> {
    let mut pos = start;
    loop {
        let len = *data.get(pos).ok_or(DomainError::PacketTooShort)? as usize;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xC0 == 0xC0 => {
                if data.len() < pos + 2 {
                    return Err(DomainError::PacketTooShort);
                }
                return Ok(pos + 2);
            }
            l if l & 0xC0 != 0 => {
                return Err(DomainError::BadPacket(
                    "unsupported label type".to_string(),
                ));
            }
            l => pos += 1 + l,
        }
    }
}

fn read_key(data: &[u8], start: usize) -> Result<(ResourceKey, usize), DomainError> {
    let (name, pos) = read_name(data, start)?;
    let fixed = data
        .get(pos..pos + 4)
        .ok_or(DomainError::PacketTooShort)?;
    let rtype = RecordType(u16::from_be_bytes([fixed[0], fixed[1]]));
    let class = RecordClass(u16::from_be_bytes([fixed[2], fixed[3]]));
    Ok((ResourceKey::new(name, class, rtype), pos + 4))
}

fn read_rdata(
    data: &[u8],
    pos: usize,
    rdlen: usize,
    rtype: RecordType,
) -> Result<RData, DomainError> {
    let raw = &data[pos..pos + rdlen];
    let rdata = match rtype {
        RecordType::A if rdlen == 4 => {
            RData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
        }
        RecordType::AAAA if rdlen == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(raw);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        RecordType::CNAME => RData::Cname(read_name(data, pos)?.0),
        RecordType::DNAME => RData::Dname(read_name(data, pos)?.0),
        RecordType::NS => RData::Ns(read_name(data, pos)?.0),
        RecordType::PTR => RData::Ptr(read_name(data, pos)?.0),
        RecordType::MX if rdlen >= 3 => RData::Mx {
            preference: u16::from_be_bytes([raw[0], raw[1]]),
            exchange: read_name(data, pos + 2)?.0,
        },
        RecordType::SOA => {
            let (mname, next) = read_name(data, pos)?;
            let (rname, next) = read_name(data, next)?;
            let fixed = data
                .get(next..next + 20)
                .ok_or(DomainError::PacketTooShort)?;
            let mut words = fixed
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]));
            RData::Soa {
                mname,
                rname,
                serial: words.next().unwrap_or(0),
                refresh: words.next().unwrap_or(0),
                retry: words.next().unwrap_or(0),
                expire: words.next().unwrap_or(0),
                minimum: words.next().unwrap_or(0),
            }
        }
        RecordType::SRV if rdlen >= 7 => RData::Srv {
            priority: u16::from_be_bytes([raw[0], raw[1]]),
            weight: u16::from_be_bytes([raw[2], raw[3]]),
            port: u16::from_be_bytes([raw[4], raw[5]]),
            target: read_name(data, pos + 6)?.0,
        },
        RecordType::TXT => {
            let mut strings = Vec::new();
            let mut off = 0usize;
            while off < rdlen {
                let len = raw[off] as usize;
                let s = raw
                    .get(off + 1..off + 1 + len)
                    .ok_or(DomainError::PacketTooShort)?;
                strings.push(s.to_vec());
                off += 1 + len;
            }
            RData::Txt(strings)
        }
        _ => RData::Generic(raw.to_vec()),
    };
    Ok(rdata)
}

fn rdata_has_option(rdata: &[u8], wanted: u16) -> Result<bool, DomainError> {
    let mut pos = 0usize;
    while pos < rdata.len() {
        let header = rdata
            .get(pos..pos + 4)
            .ok_or_else(|| DomainError::BadPacket("truncated OPT option".to_string()))?;
        let code = u16::from_be_bytes([header[0], header[1]]);
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        if rdata.len() < pos + 4 + len {
            return Err(DomainError::BadPacket("truncated OPT option".to_string()));
        }
        if code == wanted {
            return Ok(true);
        }
        pos += 4 + len;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question_key(name: &str, rtype: RecordType) -> ResourceKey {
        ResourceKey::new(DnsName::new(name).unwrap(), RecordClass::IN, rtype)
    }

    fn a_rr(name: &str, octets: [u8; 4], ttl: u32) -> ResourceRecord {
        ResourceRecord::new(
            question_key(name, RecordType::A),
            ttl,
            RData::A(Ipv4Addr::from(octets)),
        )
    }

    fn build_query(name: &str, rtype: RecordType, flags: u16) -> DnsPacket {
        let mut p = DnsPacket::new(DNS_PACKET_SIZE_MAX, Transport::Udp);
        p.set_id(0x1234);
        p.set_flags(flags);
        p.append_question(&[question_key(name, rtype)]).unwrap();
        p.set_qdcount(1);
        p
    }

    #[test]
    fn test_roundtrip_question() {
        let built = build_query("www.example.test", RecordType::A, 0x0100);
        let mut parsed =
            DnsPacket::from_wire(built.wire_bytes().to_vec(), Transport::Udp).unwrap();
        parsed.extract().unwrap();

        assert_eq!(parsed.id(), 0x1234);
        assert!(parsed.rd());
        assert!(!parsed.is_response());
        assert_eq!(parsed.question().len(), 1);
        assert_eq!(parsed.question()[0].name.as_str(), "www.example.test");
        assert_eq!(parsed.question()[0].rtype, RecordType::A);
        assert!(!parsed.has_opt());
        assert_eq!(parsed.payload_size_max(), DNS_PACKET_UNICAST_SIZE_MAX);
    }

    #[test]
    fn test_append_is_atomic_on_overflow() {
        let mut p = DnsPacket::new(DNS_PACKET_HEADER_SIZE + 10, Transport::Udp);
        let before = p.len();
        let err = p
            .append_question(&[question_key("a-rather-long-name.example.test", RecordType::A)])
            .unwrap_err();
        assert!(matches!(err, DomainError::ExceedsMaxSize));
        assert_eq!(p.len(), before);
    }

    #[test]
    fn test_append_rr_and_reparse() {
        let mut p = build_query("host.example.test", RecordType::A, 0x8180);
        p.append_rr(&a_rr("host.example.test", [203, 0, 113, 7], 300))
            .unwrap();
        p.set_ancount(1);

        let parsed = DnsPacket::from_wire(p.wire_bytes().to_vec(), Transport::Udp).unwrap();
        let records = parsed.extract_records().unwrap();
        assert_eq!(records.len(), 1);
        let (rr, hint) = &records[0];
        assert_eq!(*hint, SectionHint::Answer);
        assert_eq!(rr.ttl, 300);
        assert_eq!(rr.rdata, RData::A(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[test]
    fn test_append_answer_reports_partial_write() {
        let mut p = DnsPacket::new(100, Transport::Udp);
        p.append_question(&[question_key("host.example.test", RecordType::A)])
            .unwrap();
        p.set_qdcount(1);

        let items: Vec<AnswerItem> = (0..5)
            .map(|i| AnswerItem::new(a_rr("host.example.test", [203, 0, 113, i as u8], 300)))
            .collect();
        let outcome = p.append_answer(&items).unwrap();

        // Two 33-byte records fit into the remaining space, the cut is
        // reported rather than silent.
        assert!(outcome.truncated);
        assert!(outcome.written > 0 && (outcome.written as usize) < items.len());
        assert!(p.len() <= 100);
    }

    #[test]
    fn test_opt_roundtrip_with_nsid() {
        let mut p = build_query("host.example.test", RecordType::A, 0x8180);
        p.append_opt(4096, true, 0, Some("abcd.loopdns.example"))
            .unwrap();
        assert_eq!(p.arcount(), 1);

        let mut parsed =
            DnsPacket::from_wire(p.wire_bytes().to_vec(), Transport::Udp).unwrap();
        parsed.extract().unwrap();
        let edns = parsed.edns().unwrap();
        assert_eq!(edns.payload_size, 4096);
        assert_eq!(edns.version, 0);
        assert!(edns.dnssec_ok);
        assert!(parsed.nsid_requested());
        assert_eq!(parsed.payload_size_max(), 4096);
    }

    #[test]
    fn test_extended_rcode_in_opt() {
        let mut p = build_query("host.example.test", RecordType::A, 0x8180);
        // BADVERS = 16: low 4 bits in the header, upper bits in the OPT.
        p.append_opt(512, false, 16, None).unwrap();

        let mut parsed =
            DnsPacket::from_wire(p.wire_bytes().to_vec(), Transport::Udp).unwrap();
        parsed.extract().unwrap();
        assert_eq!(parsed.edns().unwrap().extended_rcode, 1);
        assert_eq!(parsed.rcode(), 16);
    }

    #[test]
    fn test_patch_max_udp_size_preserves_length() {
        let mut p = build_query("host.example.test", RecordType::A, 0x8180);
        p.append_opt(512, false, 0, None).unwrap();

        let mut parsed =
            DnsPacket::from_wire(p.wire_bytes().to_vec(), Transport::Udp).unwrap();
        parsed.extract().unwrap();
        let len_before = parsed.len();
        parsed.patch_max_udp_size(65494).unwrap();
        assert_eq!(parsed.len(), len_before);

        let mut reparsed =
            DnsPacket::from_wire(parsed.wire_bytes().to_vec(), Transport::Udp).unwrap();
        reparsed.extract().unwrap();
        assert_eq!(reparsed.edns().unwrap().payload_size, 65494);
    }

    #[test]
    fn test_patch_ttls_clamps_and_skips_opt() {
        let mut p = build_query("host.example.test", RecordType::A, 0x8180);
        p.append_rr(&a_rr("host.example.test", [203, 0, 113, 7], 300))
            .unwrap();
        p.append_rr(&a_rr("host.example.test", [203, 0, 113, 8], 1))
            .unwrap();
        p.set_ancount(2);
        p.append_opt(4096, true, 0, None).unwrap();

        let mut packet =
            DnsPacket::from_wire(p.wire_bytes().to_vec(), Transport::Udp).unwrap();
        packet.extract().unwrap();
        let len_before = packet.len();

        let now = Instant::now();
        let since = now - std::time::Duration::from_secs(2);
        packet.patch_ttls(since, now).unwrap();

        assert_eq!(packet.len(), len_before);
        let records = packet.extract_records().unwrap();
        assert_eq!(records[0].0.ttl, 298);
        assert_eq!(records[1].0.ttl, 0);

        // OPT flags live in the TTL field and must be untouched.
        let mut reparsed =
            DnsPacket::from_wire(packet.wire_bytes().to_vec(), Transport::Udp).unwrap();
        reparsed.extract().unwrap();
        assert!(reparsed.edns().unwrap().dnssec_ok);
    }

    #[test]
    fn test_truncate_floors_at_header() {
        let mut p = build_query("host.example.test", RecordType::A, 0x8180);
        p.truncate(4);
        assert_eq!(p.len(), DNS_PACKET_HEADER_SIZE);
    }

    #[test]
    fn test_duplicate_and_equality() {
        let p = build_query("host.example.test", RecordType::A, 0x0100);
        let mut copy = p.duplicate();
        assert!(p.bytes_equal(&copy));
        copy.set_id(0x4321);
        assert!(!p.bytes_equal(&copy));
    }

    #[test]
    fn test_compressed_name_decoding() {
        // Query for example.test with an answer whose owner is a pointer to
        // the question name, plus a CNAME whose rdata points there too.
        let mut data = Vec::new();
        data.extend_from_slice(&0x1234u16.to_be_bytes());
        data.extend_from_slice(&0x8180u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        // question: example.test A IN, name starts at offset 12
        data.extend_from_slice(b"\x07example\x04test\x00");
        data.extend_from_slice(&RecordType::A.0.to_be_bytes());
        data.extend_from_slice(&RecordClass::IN.0.to_be_bytes());
        // answer: CNAME at "www" + pointer to offset 12, rdata = pointer
        data.extend_from_slice(b"\x03www\xC0\x0C");
        data.extend_from_slice(&RecordType::CNAME.0.to_be_bytes());
        data.extend_from_slice(&RecordClass::IN.0.to_be_bytes());
        data.extend_from_slice(&60u32.to_be_bytes());
        data.extend_from_slice(&2u16.to_be_bytes());
        data.extend_from_slice(b"\xC0\x0C");

        let packet = DnsPacket::from_wire(data, Transport::Udp).unwrap();
        let records = packet.extract_records().unwrap();
        assert_eq!(records.len(), 1);
        let (rr, _) = &records[0];
        assert_eq!(rr.key.name.as_str(), "www.example.test");
        assert_eq!(
            rr.rdata,
            RData::Cname(DnsName::new("example.test").unwrap())
        );
    }

    #[test]
    fn test_rejects_forward_pointer() {
        let mut data = vec![0u8; DNS_PACKET_HEADER_SIZE];
        data[5] = 1; /* qdcount = 1 */
        data.extend_from_slice(b"\xC0\xFF");
        data.extend_from_slice(&[0, 1, 0, 1]);

        let mut packet = DnsPacket::from_wire(data, Transport::Udp).unwrap();
        assert!(packet.extract().is_err());
    }

    #[test]
    fn test_rejects_double_opt() {
        let mut p = build_query("host.example.test", RecordType::A, 0);
        p.append_opt(512, false, 0, None).unwrap();
        p.append_opt(512, false, 0, None).unwrap();

        let mut parsed =
            DnsPacket::from_wire(p.wire_bytes().to_vec(), Transport::Udp).unwrap();
        assert!(parsed.extract().is_err());
    }

    #[test]
    fn test_validate_query() {
        let query = build_query("host.example.test", RecordType::A, 0x0100);
        assert!(query.validate_query());

        let response = build_query("host.example.test", RecordType::A, 0x8180);
        assert!(!response.validate_query());
    }

    #[test]
    fn test_too_short_packet_rejected() {
        assert!(matches!(
            DnsPacket::from_wire(vec![0u8; 5], Transport::Udp),
            Err(DomainError::PacketTooShort)
        ));
    }
}
