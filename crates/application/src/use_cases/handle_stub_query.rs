use loopdns_domain::{rcode, QueryFlags, ResolverCompletion, ResolverState, ResourceKey};

use crate::ports::ResolverRequest;

/// How a completed transaction turns into client-visible behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    Reply { rcode: u16 },
    /// Timeouts propagate as silence so the client times out too.
    NoReply,
}

/// Header-flag outputs derived from the request bits and the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyFlags {
    pub edns0_do: bool,
    pub authoritative: bool,
    pub authenticated_data: bool,
    pub checking_disabled: bool,
}

/// Decision logic of the stub query path: which resolver request a client
/// packet becomes, and what the terminal state means for the reply. Wire
/// concerns stay out; callers hand in the already-extracted header bits.
pub struct HandleStubQuery;

impl HandleStubQuery {
    /// Builds the resolver submission for a validated client question.
    ///
    /// A client that sets both DO and CD wants the DNSSEC data untouched:
    /// the query runs in bypass mode, forwarding the raw packet with
    /// validation and CNAME-following disabled so the upstream reply can be
    /// propagated nearly verbatim. Everyone else gets a normal structured
    /// query; DO alone still pins the transaction to the primary server set
    /// so the DNSSEC records come from a consistent source.
    pub fn plan(
        question: ResourceKey,
        raw_packet: &[u8],
        do_bit: bool,
        cd_bit: bool,
    ) -> ResolverRequest {
        if do_bit && cd_bit {
            ResolverRequest::bypass(
                question,
                raw_packet.to_vec(),
                QueryFlags {
                    all_protocols: true,
                    no_cname: true,
                    no_search: true,
                    no_validate: true,
                    require_primary: true,
                    clamp_ttl: true,
                },
            )
        } else {
            ResolverRequest::question(
                question,
                QueryFlags {
                    all_protocols: true,
                    no_cname: false,
                    no_search: true,
                    no_validate: false,
                    require_primary: do_bit,
                    clamp_ttl: true,
                },
            )
        }
    }

    /// Whether the reply may carry DNSSEC RRs and the DO bit: only if the
    /// client asked, and the data was validated, locally authenticated, or
    /// the client disabled checking and takes it as-is.
    pub fn reply_with_edns0_do(
        do_bit: bool,
        cd_bit: bool,
        completion: &ResolverCompletion,
    ) -> bool {
        do_bit
            && (completion.dnssec_result.is_conclusive()
                || completion.fully_authenticated
                || cd_bit)
    }

    /// Header flags for an assembled reply. CD is still subject to the
    /// finalizer's rule that it is never set without DO.
    pub fn reply_flags(
        do_bit: bool,
        ad_bit: bool,
        cd_bit: bool,
        completion: &ResolverCompletion,
    ) -> ReplyFlags {
        ReplyFlags {
            edns0_do: Self::reply_with_edns0_do(do_bit, cd_bit, completion),
            authoritative: completion.fully_synthetic,
            // AD is allowed even without DO, per RFC 6840 §5.7.
            authenticated_data: ad_bit && completion.fully_authenticated,
            checking_disabled: cd_bit,
        }
    }

    /// Maps a terminal transaction state onto the client-visible outcome.
    pub fn disposition(completion: &ResolverCompletion) -> ReplyDisposition {
        match completion.state {
            ResolverState::Success | ResolverState::RcodeFailure => ReplyDisposition::Reply {
                rcode: completion.rcode,
            },
            ResolverState::NotFound => ReplyDisposition::Reply {
                rcode: rcode::NXDOMAIN,
            },
            ResolverState::Timeout | ResolverState::AttemptsMaxReached => {
                ReplyDisposition::NoReply
            }
            ResolverState::NoServers
            | ResolverState::InvalidReply
            | ResolverState::Errno
            | ResolverState::Aborted
            | ResolverState::DnssecFailed
            | ResolverState::NoTrustAnchor
            | ResolverState::RrTypeUnsupported
            | ResolverState::NetworkDown
            | ResolverState::NoSource
            | ResolverState::StubLoop => ReplyDisposition::Reply {
                rcode: rcode::SERVFAIL,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loopdns_domain::{DnsName, DnssecResult, RecordClass, RecordType};

    fn question() -> ResourceKey {
        ResourceKey::new(
            DnsName::new("example.test").unwrap(),
            RecordClass::IN,
            RecordType::A,
        )
    }

    fn completion(state: ResolverState, rcode: u16) -> ResolverCompletion {
        ResolverCompletion::failure(state, rcode)
    }

    #[test]
    fn test_do_and_cd_select_bypass() {
        let request = HandleStubQuery::plan(question(), &[0u8; 12], true, true);
        assert!(request.bypass_packet.is_some());
        assert!(request.flags.no_cname);
        assert!(request.flags.no_validate);
        assert!(request.flags.require_primary);
        assert!(request.flags.clamp_ttl);
    }

    #[test]
    fn test_normal_mode_flags() {
        let request = HandleStubQuery::plan(question(), &[0u8; 12], false, false);
        assert!(request.bypass_packet.is_none());
        assert!(request.flags.all_protocols);
        assert!(request.flags.no_search);
        assert!(!request.flags.no_cname);
        assert!(!request.flags.require_primary);

        // DO alone keeps the structured path but pins the primary servers.
        let request = HandleStubQuery::plan(question(), &[0u8; 12], true, false);
        assert!(request.bypass_packet.is_none());
        assert!(request.flags.require_primary);
    }

    #[test]
    fn test_edns0_do_requires_client_do() {
        let mut done = completion(ResolverState::Success, rcode::NOERROR);
        done.dnssec_result = DnssecResult::Secure;
        assert!(!HandleStubQuery::reply_with_edns0_do(false, false, &done));
        assert!(HandleStubQuery::reply_with_edns0_do(true, false, &done));
    }

    #[test]
    fn test_edns0_do_needs_conclusive_or_cd() {
        let mut done = completion(ResolverState::Success, rcode::NOERROR);
        done.dnssec_result = DnssecResult::NotValidated;
        assert!(!HandleStubQuery::reply_with_edns0_do(true, false, &done));
        // The client taking validation into its own hands is enough.
        assert!(HandleStubQuery::reply_with_edns0_do(true, true, &done));

        done.fully_authenticated = true;
        assert!(HandleStubQuery::reply_with_edns0_do(true, false, &done));
    }

    #[test]
    fn test_ad_independent_of_do() {
        let mut done = completion(ResolverState::Success, rcode::NOERROR);
        done.fully_authenticated = true;
        let flags = HandleStubQuery::reply_flags(false, true, false, &done);
        assert!(flags.authenticated_data);
        assert!(!flags.edns0_do);
    }

    #[test]
    fn test_disposition_table() {
        assert_eq!(
            HandleStubQuery::disposition(&completion(ResolverState::Success, rcode::NOERROR)),
            ReplyDisposition::Reply {
                rcode: rcode::NOERROR
            }
        );
        assert_eq!(
            HandleStubQuery::disposition(&completion(
                ResolverState::RcodeFailure,
                rcode::REFUSED
            )),
            ReplyDisposition::Reply {
                rcode: rcode::REFUSED
            }
        );
        assert_eq!(
            HandleStubQuery::disposition(&completion(ResolverState::NotFound, rcode::NOERROR)),
            ReplyDisposition::Reply {
                rcode: rcode::NXDOMAIN
            }
        );
        assert_eq!(
            HandleStubQuery::disposition(&completion(ResolverState::Timeout, rcode::NOERROR)),
            ReplyDisposition::NoReply
        );
        assert_eq!(
            HandleStubQuery::disposition(&completion(ResolverState::NetworkDown, rcode::NOERROR)),
            ReplyDisposition::Reply {
                rcode: rcode::SERVFAIL
            }
        );
    }
}
