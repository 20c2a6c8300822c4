use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::protocol::Transport;

pub const DNS_STUB_DEFAULT_PORT: u16 = 53;

/// Which transports the stub listens on. `yes` means both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    No,
    Udp,
    Tcp,
    #[default]
    Yes,
}

impl ListenerMode {
    pub fn has_udp(self) -> bool {
        matches!(self, ListenerMode::Udp | ListenerMode::Yes)
    }

    pub fn has_tcp(self) -> bool {
        matches!(self, ListenerMode::Tcp | ListenerMode::Yes)
    }
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ListenerMode::No => "no",
            ListenerMode::Udp => "udp",
            ListenerMode::Tcp => "tcp",
            ListenerMode::Yes => "yes",
        })
    }
}

impl FromStr for ListenerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no" | "false" => Ok(ListenerMode::No),
            "udp" => Ok(ListenerMode::Udp),
            "tcp" => Ok(ListenerMode::Tcp),
            "yes" | "true" => Ok(ListenerMode::Yes),
            other => Err(ConfigError::Validation(format!(
                "unknown listener mode '{}'",
                other
            ))),
        }
    }
}

/// One additional stub endpoint, parsed from `[udp:|tcp:]ADDRESS[:PORT]`.
/// Two specs are the same endpoint when mode, family, address and port all
/// match; the listener set deduplicates on that.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtraListenerSpec {
    pub mode: ListenerMode,
    pub address: IpAddr,
    pub port: u16,
}

impl ExtraListenerSpec {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }
}

impl fmt::Display for ExtraListenerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            ListenerMode::Yes => {}
            mode => write!(f, "{}:", mode)?,
        }
        if self.address.is_ipv6() {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

fn parse_addr_port(s: &str) -> Option<(IpAddr, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        let addr: IpAddr = host.parse().ok()?;
        match rest.strip_prefix(':') {
            Some(port) => Some((addr, port.parse().ok()?)),
            None if rest.is_empty() => Some((addr, DNS_STUB_DEFAULT_PORT)),
            None => None,
        }
    } else if let Ok(addr) = s.parse::<IpAddr>() {
        Some((addr, DNS_STUB_DEFAULT_PORT))
    } else {
        let (host, port) = s.rsplit_once(':')?;
        Some((host.parse().ok()?, port.parse().ok()?))
    }
}

impl FromStr for ExtraListenerSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, rest) = if let Some(rest) = s.strip_prefix("udp:") {
            (ListenerMode::Udp, rest)
        } else if let Some(rest) = s.strip_prefix("tcp:") {
            (ListenerMode::Tcp, rest)
        } else {
            (ListenerMode::Yes, s)
        };

        let (address, port) = parse_addr_port(rest).ok_or_else(|| {
            ConfigError::InvalidListener(
                s.to_string(),
                "expected [udp:|tcp:]ADDRESS[:PORT]".to_string(),
            )
        })?;

        Ok(ExtraListenerSpec {
            mode,
            address,
            port,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StubConfig {
    /// Transport mode for the primary 127.0.0.53 listener.
    #[serde(default)]
    pub listener: ListenerMode,

    /// Extra listener specs, `[udp:|tcp:]ADDRESS[:PORT]` each.
    #[serde(default)]
    pub extra: Vec<String>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            listener: ListenerMode::Yes,
            extra: Vec::new(),
        }
    }
}

impl StubConfig {
    pub fn extra_listeners(&self) -> Result<Vec<ExtraListenerSpec>, ConfigError> {
        self.extra.iter().map(|s| s.parse()).collect()
    }
}

/// Transports an extra listener spec asks for, as concrete transport values.
impl ExtraListenerSpec {
    pub fn transports(&self) -> impl Iterator<Item = Transport> + '_ {
        [
            self.mode.has_udp().then_some(Transport::Udp),
            self.mode.has_tcp().then_some(Transport::Tcp),
        ]
        .into_iter()
        .flatten()
    }
}
