use std::fmt;

/// Which DNS-family protocol a packet belongs to. The stub listeners only
/// ever produce `Dns`; the other two exist so a resolver-provided upstream
/// packet can be recognized as not wire-compatible with a plain DNS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsProtocol {
    Dns,
    Llmnr,
    Mdns,
}

impl fmt::Display for DnsProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DnsProtocol::Dns => "dns",
            DnsProtocol::Llmnr => "llmnr",
            DnsProtocol::Mdns => "mdns",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
        })
    }
}
