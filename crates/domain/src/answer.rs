use std::time::Instant;

use crate::protocol::DnsProtocol;
use crate::resource_record::ResourceRecord;

/// Longest CNAME/DNAME chain the stub will flatten into one reply before
/// declaring a loop.
pub const ALIAS_REDIRECT_MAX: usize = 16;

/// Which section of the upstream reply an answer item was seen in. Items
/// synthesized locally carry `None` and are classified by the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SectionHint {
    Answer,
    Authority,
    Additional,
    #[default]
    None,
}

/// One resolver-produced resource record plus the metadata the stub needs to
/// project it into a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerItem {
    pub rr: ResourceRecord,
    /// Interface the record was observed on, when known.
    pub ifindex: Option<u32>,
    pub hint: SectionHint,
    pub authenticated: bool,
    /// RRSIG logically bound to `rr`, emitted right after it when the client
    /// asked for DNSSEC records.
    pub rrsig: Option<ResourceRecord>,
}

impl AnswerItem {
    pub fn new(rr: ResourceRecord) -> Self {
        Self {
            rr,
            ifindex: None,
            hint: SectionHint::None,
            authenticated: false,
            rrsig: None,
        }
    }

    pub fn with_hint(mut self, hint: SectionHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn with_rrsig(mut self, rrsig: ResourceRecord) -> Self {
        self.rrsig = Some(rrsig);
        self
    }
}

/// Outcome of the resolver's DNSSEC processing for a completed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnssecResult {
    Secure,
    Insecure,
    Bogus,
    NotValidated,
}

impl DnssecResult {
    /// True when the data may be handed to a DO client as validated-or-known-
    /// insecure (the two outcomes a validating resolver can vouch for).
    pub fn is_conclusive(self) -> bool {
        matches!(self, DnssecResult::Secure | DnssecResult::Insecure)
    }
}

/// Terminal state of a resolver transaction as delivered to the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    Success,
    RcodeFailure,
    NotFound,
    Timeout,
    AttemptsMaxReached,
    NoServers,
    InvalidReply,
    Errno,
    Aborted,
    DnssecFailed,
    NoTrustAnchor,
    RrTypeUnsupported,
    NetworkDown,
    NoSource,
    StubLoop,
}

/// Flags the stub passes along with every resolver submission. Plain bools on
/// purpose; the wire-level bitmask stays inside whatever resolver consumes
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags {
    pub all_protocols: bool,
    pub no_cname: bool,
    pub no_search: bool,
    pub no_validate: bool,
    pub require_primary: bool,
    pub clamp_ttl: bool,
}

/// A complete upstream reply packet, retained only for bypass-mode queries.
#[derive(Debug, Clone)]
pub struct UpstreamPacket {
    pub protocol: DnsProtocol,
    pub bytes: Vec<u8>,
    pub received_at: Instant,
}

/// Everything a resolver delivers when a transaction reaches a terminal
/// state.
#[derive(Debug, Clone)]
pub struct ResolverCompletion {
    pub state: ResolverState,
    pub rcode: u16,
    pub dnssec_result: DnssecResult,
    pub items: Vec<AnswerItem>,
    pub full_packet: Option<UpstreamPacket>,
    pub fully_authenticated: bool,
    pub fully_synthetic: bool,
}

impl ResolverCompletion {
    /// A bare completion with the given terminal state and rcode, no records.
    pub fn failure(state: ResolverState, rcode: u16) -> Self {
        Self {
            state,
            rcode,
            dnssec_result: DnssecResult::NotValidated,
            items: Vec::new(),
            full_packet: None,
            fully_authenticated: false,
            fully_synthetic: false,
        }
    }
}
