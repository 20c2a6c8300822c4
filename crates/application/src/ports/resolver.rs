use async_trait::async_trait;
use loopdns_domain::{QueryFlags, ResolverCompletion, ResourceKey};

/// One resolver submission: the parsed question, plus the raw client packet
/// when the transaction should bypass local interpretation and be forwarded
/// as-is.
#[derive(Debug, Clone)]
pub struct ResolverRequest {
    pub question: ResourceKey,
    pub bypass_packet: Option<Vec<u8>>,
    pub flags: QueryFlags,
}

impl ResolverRequest {
    pub fn question(question: ResourceKey, flags: QueryFlags) -> Self {
        Self {
            question,
            bypass_packet: None,
            flags,
        }
    }

    pub fn bypass(question: ResourceKey, packet: Vec<u8>, flags: QueryFlags) -> Self {
        Self {
            question,
            bypass_packet: Some(packet),
            flags,
        }
    }
}

/// The seam to the recursive/validating resolver. The stub owns nothing
/// behind it: transactions, caching and DNSSEC validation are the
/// implementation's business.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Runs one transaction to a terminal state. Dropping the returned
    /// future aborts the transaction; abort is idempotent and the completion
    /// can no longer be observed afterwards.
    async fn resolve(&self, request: ResolverRequest) -> ResolverCompletion;

    /// True iff the raw datagram is a looped-back copy of one of this
    /// resolver's own in-flight upstream queries.
    fn packet_is_ours(&self, packet: &[u8]) -> bool;
}
