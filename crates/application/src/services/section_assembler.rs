use loopdns_domain::{
    AnswerItem, ResourceKey, SectionHint, ALIAS_REDIRECT_MAX,
};
use rustc_hash::FxHashSet;

/// The three reply sections built from a resolver answer, in the order the
/// records will be written to the wire.
#[derive(Debug, Default)]
pub struct AssembledReply {
    pub answer: Vec<AnswerItem>,
    pub authoritative: Vec<AnswerItem>,
    pub additional: Vec<AnswerItem>,
    /// Set when the alias chain exceeded [`ALIAS_REDIRECT_MAX`]; the
    /// sections hold whatever was gathered up to that point.
    pub alias_loop: bool,
}

impl AssembledReply {
    pub fn is_empty(&self) -> bool {
        self.answer.is_empty() && self.authoritative.is_empty() && self.additional.is_empty()
    }
}

/// Projects the flat, section-hinted record list a resolver delivers into
/// the ANSWER/AUTHORITY/ADDITIONAL sections of a stub reply.
///
/// The placement mirrors what the upstream server sent where possible:
/// anything directly answering the question (following CNAME/DNAME
/// redirections) goes to ANSWER regardless of its hint; hinted AUTHORITY
/// records not already used go to AUTHORITY; everything else that was
/// hinted ANSWER/ADDITIONAL or synthesized locally goes to ADDITIONAL.
pub struct SectionAssembler;

impl SectionAssembler {
    pub fn assemble(
        items: &[AnswerItem],
        question: &ResourceKey,
        edns0_do: bool,
    ) -> AssembledReply {
        let mut reply = AssembledReply::default();

        reply.alias_loop =
            collect_answer_by_question(&mut reply.answer, items, question, edns0_do);

        collect_answer_by_section(
            &mut reply.authoritative,
            items,
            SectionHint::Authority,
            &[&reply.answer],
            edns0_do,
        );

        let mut additional = std::mem::take(&mut reply.additional);
        for hint in [SectionHint::Answer, SectionHint::Additional, SectionHint::None] {
            collect_answer_by_section(
                &mut additional,
                items,
                hint,
                &[&reply.answer, &reply.authoritative],
                edns0_do,
            );
        }
        reply.additional = additional;

        suppress_duplicate_section_rrs(&mut reply);
        reply
    }
}

/// Appends `item` (and its RRSIG sidecar when the client wants DNSSEC RRs)
/// unless the record is already present. RRset merging keeps a record that
/// shows up repeatedly across chain elements from being written twice.
fn push_with_rrsig(
    section: &mut Vec<AnswerItem>,
    item: &AnswerItem,
    hint: SectionHint,
    with_rrsig: bool,
) {
    if section.iter().any(|existing| existing.rr == item.rr) {
        return;
    }

    let mut placed = item.clone();
    placed.hint = hint;
    let rrsig = placed.rrsig.take().filter(|_| with_rrsig);
    section.push(placed);

    if let Some(rrsig) = rrsig {
        if !section.iter().any(|existing| existing.rr == rrsig) {
            let mut sig = AnswerItem::new(rrsig);
            sig.ifindex = item.ifindex;
            sig.authenticated = item.authenticated;
            sig.hint = hint;
            section.push(sig);
        }
    }
}

/// Collects every record that answers `question` into `section`, restarting
/// the scan whenever a CNAME/DNAME redirects the lookup, so a whole alias
/// chain lands in ANSWER in chain order. Returns true when the chain ran
/// past [`ALIAS_REDIRECT_MAX`] and the scan was cut short.
fn collect_answer_by_question(
    section: &mut Vec<AnswerItem>,
    items: &[AnswerItem],
    question: &ResourceKey,
    edns0_do: bool,
) -> bool {
    let mut current = question.clone();
    let mut n_redirects = 0usize;

    loop {
        let mut next_redirect: Option<ResourceKey> = None;

        for item in items {
            if !edns0_do && item.rr.key.rtype.is_dnssec() {
                continue;
            }

            if !current.matches(&item.rr.key) {
                let Some(target) = item.rr.alias_target(&current) else {
                    continue;
                };

                n_redirects += 1;
                if n_redirects > ALIAS_REDIRECT_MAX {
                    return true;
                }

                // There can only be one alias per name, the last match wins.
                next_redirect = Some(ResourceKey::new(
                    target,
                    current.class,
                    current.rtype,
                ));
            }

            // Primary answers go out without section info so they are
            // classified into ANSWER, whatever the upstream hint said.
            push_with_rrsig(section, item, SectionHint::None, edns0_do);
        }

        match next_redirect {
            Some(key) => current = key,
            None => return false,
        }
    }
}

/// Copies every record whose hint is `hint` into `section`, skipping
/// records already placed in one of the `exclude` sections.
fn collect_answer_by_section(
    section: &mut Vec<AnswerItem>,
    items: &[AnswerItem],
    hint: SectionHint,
    exclude: &[&[AnswerItem]],
    edns0_do: bool,
) {
    for item in items {
        if item.hint != hint {
            continue;
        }
        if !edns0_do && item.rr.key.rtype.is_dnssec() {
            continue;
        }
        if exclude
            .iter()
            .any(|placed| placed.iter().any(|existing| existing.rr == item.rr))
        {
            continue;
        }

        push_with_rrsig(section, item, item.hint, edns0_do);
    }
}

/// Removes lower-priority duplicates after placement: AUTHORITY and
/// ADDITIONAL lose every RRset whose key is in ANSWER, ADDITIONAL loses
/// every RRset whose key is in AUTHORITY. Matching by key rather than full
/// record keeps RRsets whole within a single section.
fn suppress_duplicate_section_rrs(reply: &mut AssembledReply) {
    let answer_keys: FxHashSet<&ResourceKey> =
        reply.answer.iter().map(|item| &item.rr.key).collect();

    reply
        .authoritative
        .retain(|item| !answer_keys.contains(&item.rr.key));

    let authoritative_keys: FxHashSet<ResourceKey> = reply
        .authoritative
        .iter()
        .map(|item| item.rr.key.clone())
        .collect();

    reply.additional.retain(|item| {
        !answer_keys.contains(&item.rr.key) && !authoritative_keys.contains(&item.rr.key)
    });
}
