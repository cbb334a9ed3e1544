//! Semantic arbitration: one MatchDecision per worthy conversation.
//!
//! Policy is value-addition-first: the capability is instructed to prefer
//! UPDATE over CREATE whenever the new content supports, extends, or
//! resolves something a shortlisted document covers, even when topical
//! similarity is only moderate. CREATE is reserved for genuinely
//! independent topics; IGNORE covers duplicates, thin content, and low
//! extraction confidence.
//!
//! Hard rules live here in code: an empty snapshot or empty shortlist
//! short-circuits to CREATE without invoking the capability, and a
//! returned decision must satisfy the action/target invariant or it is
//! treated as a schema failure. The low-confidence gate travels to the
//! capability as a strong prior, not as a code-level override.

use tracing::{instrument, warn};

use lorekeeper_reasoning::{ArbitrateRequest, CandidateDoc, RawDecision, Reasoner};
use lorekeeper_shared::{
    ExtractionResult, KbCategory, LorekeeperError, MatchAction, MatchDecision, Result,
    TargetDocument,
};

use crate::prefilter::ScoredCandidate;
use crate::templates;

/// A decision plus how it was reached, for the run ledger.
#[derive(Debug, Clone)]
pub struct ArbiterOutcome {
    pub decision: MatchDecision,
    /// True when the decision came from a fallback path rather than the
    /// capability.
    pub fallback: bool,
}

/// The CREATE short-circuit: no existing documents worth comparing to.
pub fn short_circuit_create(extraction: &ExtractionResult) -> MatchDecision {
    MatchDecision {
        action: MatchAction::Create,
        confidence: extraction.confidence,
        rationale: "No relevant existing documents; this content stands on its own.".into(),
        value_added: "New independent content that warrants its own document.".into(),
        target: Some(suggested_target(extraction)),
    }
}

/// Fallback when the capability errors out: fail open with CREATE so no
/// content is silently discarded. Possible duplicates are left for a
/// human reviewer to merge.
pub fn fallback_create(extraction: &ExtractionResult, cause: &LorekeeperError) -> MatchDecision {
    MatchDecision {
        action: MatchAction::Create,
        confidence: extraction.confidence,
        rationale: format!("Fell back to create: {cause}"),
        value_added: "Unable to assess value addition; content preserved for review.".into(),
        target: Some(suggested_target(extraction)),
    }
}

fn suggested_target(extraction: &ExtractionResult) -> TargetDocument {
    TargetDocument {
        path: templates::suggest_path(extraction.category, &extraction.title),
        title: Some(extraction.title.clone()),
        category: Some(extraction.category),
    }
}

/// Build the arbitration request for one extraction and its shortlist.
pub fn build_arbitrate_request(
    record_id: &str,
    extraction: &ExtractionResult,
    shortlist: &[ScoredCandidate<'_>],
    confidence_gate: f64,
) -> ArbitrateRequest {
    ArbitrateRequest {
        record_id: record_id.to_string(),
        title: extraction.title.clone(),
        category: extraction.category.as_str().to_string(),
        tags: extraction.tags.clone(),
        confidence: extraction.confidence,
        low_confidence_prior: extraction.confidence < confidence_gate,
        new_content: templates::render_body(extraction),
        candidates: shortlist
            .iter()
            .map(|c| CandidateDoc {
                path: c.document.path.clone(),
                title: c.document.title.clone(),
                category: c.document.category.as_str().to_string(),
                tags: c.document.tags.clone(),
                summary: summarize_for_prompt(&c.document.content),
            })
            .collect(),
    }
}

/// First non-heading lines of a document, for the arbiter prompt.
fn summarize_for_prompt(content: &str) -> String {
    const MAX_CHARS: usize = 1200;
    let mut summary = String::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(line);
        if summary.len() >= MAX_CHARS {
            summary.truncate(MAX_CHARS);
            break;
        }
    }
    summary
}

/// Validate a raw capability decision into a [`MatchDecision`].
///
/// Unknown actions and violated target invariants are schema failures;
/// confidence is clamped into range.
pub fn validate_decision(raw: RawDecision) -> Result<MatchDecision> {
    let action = match raw.action.trim().to_ascii_lowercase().as_str() {
        "create" => MatchAction::Create,
        "update" => MatchAction::Update,
        "append" => MatchAction::Append,
        "replace" => MatchAction::Replace,
        "ignore" => MatchAction::Ignore,
        other => {
            return Err(LorekeeperError::ReasoningSchema(format!(
                "unknown action: {other:?}"
            )));
        }
    };

    let target = raw.target_path.map(|path| TargetDocument {
        path,
        title: raw.target_title,
        category: raw
            .target_category
            .as_deref()
            .and_then(|c| KbCategory::parse(c).ok()),
    });

    let decision = MatchDecision {
        action,
        confidence: raw.confidence.clamp(0.0, 1.0),
        rationale: raw.rationale,
        value_added: raw.value_added,
        target,
    };

    decision
        .validate()
        .map_err(|e| LorekeeperError::ReasoningSchema(e.to_string()))?;
    Ok(decision)
}

/// Arbitrate a set of worthy extractions, batching reasoning calls.
///
/// `items` pairs each extraction with its shortlist; an empty shortlist
/// short-circuits to CREATE without a capability call. Always returns one
/// outcome per item, in order.
#[instrument(skip_all, fields(items = items.len(), batch_size))]
pub fn arbitrate_records(
    reasoner: &mut dyn Reasoner,
    items: &[(String, &ExtractionResult, Vec<ScoredCandidate<'_>>)],
    batch_size: usize,
    confidence_gate: f64,
) -> Vec<ArbiterOutcome> {
    let batch_size = batch_size.max(1);
    let mut outcomes: Vec<Option<ArbiterOutcome>> = (0..items.len()).map(|_| None).collect();

    let mut pending: Vec<usize> = Vec::new();
    for (i, (_, extraction, shortlist)) in items.iter().enumerate() {
        if shortlist.is_empty() {
            outcomes[i] = Some(ArbiterOutcome {
                decision: short_circuit_create(extraction),
                fallback: false,
            });
        } else {
            pending.push(i);
        }
    }

    for chunk in pending.chunks(batch_size) {
        let requests: Vec<ArbitrateRequest> = chunk
            .iter()
            .map(|&i| {
                let (record_id, extraction, shortlist) = &items[i];
                build_arbitrate_request(record_id, extraction, shortlist, confidence_gate)
            })
            .collect();

        for (&i, raw) in chunk.iter().zip(reasoner.arbitrate_batch(&requests)) {
            let (_, extraction, _) = &items[i];
            outcomes[i] = Some(match raw.and_then(validate_decision) {
                Ok(decision) => ArbiterOutcome {
                    decision,
                    fallback: false,
                },
                Err(e) => {
                    warn!(error = %e, "arbitration failed, falling back to create");
                    ArbiterOutcome {
                        decision: fallback_create(extraction, &e),
                        fallback: true,
                    }
                }
            });
        }
    }

    outcomes
        .into_iter()
        .map(|o| o.expect("every item resolved"))
        .collect()
}
