use std::fmt;

/// A DNS RR type code. Kept as the raw 16-bit value so obsolete and unknown
/// types can be carried through unchanged; well-known codes get named
/// constants and an RFC 3597 style display for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: RecordType = RecordType(1);
    pub const NS: RecordType = RecordType(2);
    pub const MD: RecordType = RecordType(3);
    pub const MF: RecordType = RecordType(4);
    pub const CNAME: RecordType = RecordType(5);
    pub const SOA: RecordType = RecordType(6);
    pub const NULL: RecordType = RecordType(10);
    pub const PTR: RecordType = RecordType(12);
    pub const MX: RecordType = RecordType(15);
    pub const TXT: RecordType = RecordType(16);
    pub const AAAA: RecordType = RecordType(28);
    pub const SRV: RecordType = RecordType(33);
    pub const NAPTR: RecordType = RecordType(35);
    pub const DNAME: RecordType = RecordType(39);
    pub const OPT: RecordType = RecordType(41);
    pub const DS: RecordType = RecordType(43);
    pub const RRSIG: RecordType = RecordType(46);
    pub const NSEC: RecordType = RecordType(47);
    pub const DNSKEY: RecordType = RecordType(48);
    pub const NSEC3: RecordType = RecordType(50);
    pub const NSEC3PARAM: RecordType = RecordType(51);
    pub const TLSA: RecordType = RecordType(52);
    pub const CDS: RecordType = RecordType(59);
    pub const CDNSKEY: RecordType = RecordType(60);
    pub const SVCB: RecordType = RecordType(64);
    pub const HTTPS: RecordType = RecordType(65);
    pub const IXFR: RecordType = RecordType(251);
    pub const AXFR: RecordType = RecordType(252);
    pub const MAILB: RecordType = RecordType(253);
    pub const MAILA: RecordType = RecordType(254);
    pub const ANY: RecordType = RecordType(255);

    /// DNSSEC meta-types that are only meaningful to DO-aware clients.
    pub fn is_dnssec(self) -> bool {
        matches!(
            self,
            RecordType::RRSIG
                | RecordType::NSEC
                | RecordType::NSEC3
                | RecordType::DNSKEY
                | RecordType::DS
                | RecordType::NSEC3PARAM
                | RecordType::CDS
                | RecordType::CDNSKEY
        )
    }

    /// Types declared obsolete by RFC 1035 / RFC 3425 that a stub refuses.
    pub fn is_obsolete(self) -> bool {
        matches!(
            self,
            RecordType::MD
                | RecordType::MF
                | RecordType::MAILA
                | RecordType::MAILB
                | RecordType::NULL
        )
    }

    pub fn is_zone_transfer(self) -> bool {
        matches!(self, RecordType::AXFR | RecordType::IXFR)
    }

    pub fn is_alias(self) -> bool {
        matches!(self, RecordType::CNAME | RecordType::DNAME)
    }

    pub fn as_str(self) -> Option<&'static str> {
        Some(match self {
            RecordType::A => "A",
            RecordType::NS => "NS",
            RecordType::MD => "MD",
            RecordType::MF => "MF",
            RecordType::CNAME => "CNAME",
            RecordType::SOA => "SOA",
            RecordType::NULL => "NULL",
            RecordType::PTR => "PTR",
            RecordType::MX => "MX",
            RecordType::TXT => "TXT",
            RecordType::AAAA => "AAAA",
            RecordType::SRV => "SRV",
            RecordType::NAPTR => "NAPTR",
            RecordType::DNAME => "DNAME",
            RecordType::OPT => "OPT",
            RecordType::DS => "DS",
            RecordType::RRSIG => "RRSIG",
            RecordType::NSEC => "NSEC",
            RecordType::DNSKEY => "DNSKEY",
            RecordType::NSEC3 => "NSEC3",
            RecordType::NSEC3PARAM => "NSEC3PARAM",
            RecordType::TLSA => "TLSA",
            RecordType::CDS => "CDS",
            RecordType::CDNSKEY => "CDNSKEY",
            RecordType::SVCB => "SVCB",
            RecordType::HTTPS => "HTTPS",
            RecordType::IXFR => "IXFR",
            RecordType::AXFR => "AXFR",
            RecordType::MAILB => "MAILB",
            RecordType::MAILA => "MAILA",
            RecordType::ANY => "ANY",
            _ => return None,
        })
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "TYPE{}", self.0),
        }
    }
}

/// A DNS class code. IN is the only class this server serves, but the raw
/// value is preserved so unusual queries can be echoed faithfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordClass(pub u16);

impl RecordClass {
    pub const IN: RecordClass = RecordClass(1);
    pub const ANY: RecordClass = RecordClass(255);
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RecordClass::IN => f.write_str("IN"),
            RecordClass::ANY => f.write_str("ANY"),
            RecordClass(n) => write!(f, "CLASS{}", n),
        }
    }
}
