use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::name::DnsName;
use crate::record_type::{RecordClass, RecordType};

/// The (name, class, type) triple identifying an RRset. This is the unit of
/// section-placement and duplicate suppression: RRsets move between reply
/// sections together or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub name: DnsName,
    pub class: RecordClass,
    pub rtype: RecordType,
}

impl ResourceKey {
    pub fn new(name: DnsName, class: RecordClass, rtype: RecordType) -> Self {
        Self { name, class, rtype }
    }

    /// True if an RR with the given key answers a question for this key.
    /// ANY matches every class/type; names compare in normalized form.
    pub fn matches(&self, rr_key: &ResourceKey) -> bool {
        if self.name != rr_key.name {
            return false;
        }
        if self.class != rr_key.class
            && self.class != RecordClass::ANY
            && rr_key.class != RecordClass::ANY
        {
            return false;
        }
        self.rtype == rr_key.rtype || self.rtype == RecordType::ANY
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.class, self.rtype)
    }
}

/// Decoded rdata for the types the stub has to understand structurally
/// (aliases for chain-following, the classic name-bearing types so upstream
/// name compression never leaks into a reply). Everything else passes through
/// as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(DnsName),
    Dname(DnsName),
    Ns(DnsName),
    Ptr(DnsName),
    Mx {
        preference: u16,
        exchange: DnsName,
    },
    Soa {
        mname: DnsName,
        rname: DnsName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: DnsName,
    },
    Txt(Vec<Vec<u8>>),
    Generic(Vec<u8>),
}

impl RData {
    /// Encoded rdata length, uncompressed.
    pub fn wire_len(&self) -> usize {
        match self {
            RData::A(_) => 4,
            RData::Aaaa(_) => 16,
            RData::Cname(n) | RData::Dname(n) | RData::Ns(n) | RData::Ptr(n) => n.wire_len(),
            RData::Mx { exchange, .. } => 2 + exchange.wire_len(),
            RData::Soa { mname, rname, .. } => mname.wire_len() + rname.wire_len() + 20,
            RData::Srv { target, .. } => 6 + target.wire_len(),
            RData::Txt(strings) => strings.iter().map(|s| 1 + s.len()).sum(),
            RData::Generic(bytes) => bytes.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub key: ResourceKey,
    pub ttl: u32,
    pub rdata: RData,
}

impl ResourceRecord {
    pub fn new(key: ResourceKey, ttl: u32, rdata: RData) -> Self {
        Self { key, ttl, rdata }
    }

    /// If this RR redirects a lookup for `key`, returns the name the lookup
    /// continues at: the CNAME target when the owner matches exactly, or the
    /// DNAME-rewritten name when `key` lies below the DNAME owner.
    pub fn alias_target(&self, key: &ResourceKey) -> Option<DnsName> {
        if self.key.class != key.class
            && self.key.class != RecordClass::ANY
            && key.class != RecordClass::ANY
        {
            return None;
        }
        match &self.rdata {
            RData::Cname(target) if self.key.rtype == RecordType::CNAME => {
                (self.key.name == key.name).then(|| target.clone())
            }
            RData::Dname(target) if self.key.rtype == RecordType::DNAME => {
                key.name.rebase(&self.key.name, target)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ResourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (ttl {})", self.key, self.ttl)
    }
}
