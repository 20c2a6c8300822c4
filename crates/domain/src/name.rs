use std::fmt;
use std::str::FromStr;

use crate::errors::DomainError;

/// Maximum length of a single label, per RFC 1035 §2.3.4.
pub const DNS_LABEL_MAX: usize = 63;

/// Maximum wire length of a full name (labels + length octets + root).
pub const DNS_NAME_WIRE_MAX: usize = 255;

/// A fully-qualified DNS name, stored in normalized form: ASCII-lowercased,
/// dot-separated, without the trailing root dot. The root name is the empty
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DnsName(String);

impl DnsName {
    pub fn root() -> Self {
        DnsName(String::new())
    }

    /// Parses and normalizes a presentation-format name. A single trailing
    /// dot is accepted and stripped; empty labels are rejected.
    pub fn new(name: &str) -> Result<Self, DomainError> {
        let trimmed = name.strip_suffix('.').unwrap_or(name);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }

        let mut wire_len = 1; /* terminating root label */
        for label in trimmed.split('.') {
            if label.is_empty() {
                return Err(DomainError::BadName(format!(
                    "empty label in '{}'",
                    name
                )));
            }
            if label.len() > DNS_LABEL_MAX {
                return Err(DomainError::BadName(format!(
                    "label '{}' exceeds {} bytes",
                    label, DNS_LABEL_MAX
                )));
            }
            if !label.bytes().all(|b| b.is_ascii() && b != b'.') {
                return Err(DomainError::BadName(format!(
                    "non-ASCII label in '{}'",
                    name
                )));
            }
            wire_len += 1 + label.len();
        }
        if wire_len > DNS_NAME_WIRE_MAX {
            return Err(DomainError::BadName(format!(
                "name '{}' exceeds {} wire bytes",
                name, DNS_NAME_WIRE_MAX
            )));
        }

        Ok(DnsName(trimmed.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.split('.').filter(|l| !l.is_empty())
    }

    /// Encoded length on the wire: one length octet per label plus the label
    /// bytes, plus the terminating root octet.
    pub fn wire_len(&self) -> usize {
        self.labels().map(|l| 1 + l.len()).sum::<usize>() + 1
    }

    /// True if `self` is a strict subdomain of `suffix` (never true for the
    /// name itself). Every non-root name is a subdomain of the root.
    pub fn is_subdomain_of(&self, suffix: &DnsName) -> bool {
        if self == suffix {
            return false;
        }
        if suffix.is_root() {
            return !self.is_root();
        }
        self.0
            .strip_suffix(suffix.as_str())
            .is_some_and(|rest| rest.ends_with('.'))
    }

    /// Rewrites the `from` suffix of this name to `to`, as DNAME redirection
    /// does (RFC 6672). Returns `None` unless `self` is a strict subdomain of
    /// `from` or the rewritten name would be invalid.
    pub fn rebase(&self, from: &DnsName, to: &DnsName) -> Option<DnsName> {
        if !self.is_subdomain_of(from) {
            return None;
        }
        let prefix = if from.is_root() {
            self.0.as_str()
        } else {
            self.0
                .strip_suffix(from.as_str())
                .and_then(|rest| rest.strip_suffix('.'))?
        };
        let rebased = if to.is_root() {
            prefix.to_string()
        } else {
            format!("{}.{}", prefix, to.as_str())
        };
        DnsName::new(&rebased).ok()
    }
}

impl fmt::Display for DnsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl FromStr for DnsName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DnsName::new(s)
    }
}
