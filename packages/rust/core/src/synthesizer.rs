//! Document synthesis: turn a decision into a rendered document.
//!
//! CREATE renders fresh from the category template. UPDATE/APPEND/REPLACE
//! hand the existing body and the new information to the capability under
//! the selective-update rule: only lines whose meaning changes may be
//! altered, and the document's title, tags, and structure carry over. A
//! failed or empty merge falls back to the CREATE rendering path so a
//! partially-merged document can never escape this stage.

use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use lorekeeper_reasoning::{Reasoner, SynthesizeRequest};
use lorekeeper_shared::{
    ExistingDocument, ExtractionResult, GeneratedDocument, MatchAction, MatchDecision, RecordId,
};

use crate::templates;

/// One synthesis work item. `existing` is required for update-family
/// actions and ignored for CREATE.
#[derive(Debug, Clone)]
pub struct SynthesisItem<'a> {
    pub record_id: RecordId,
    pub extraction: &'a ExtractionResult,
    pub decision: &'a MatchDecision,
    pub existing: Option<&'a ExistingDocument>,
}

fn target_path(item: &SynthesisItem<'_>) -> String {
    item.decision
        .target
        .as_ref()
        .map(|t| t.path.clone())
        .unwrap_or_else(|| {
            templates::suggest_path(item.extraction.category, &item.extraction.title)
        })
}

/// Render a fresh document for an item (the CREATE path, also the shared
/// fallback for failed merges).
fn render_fresh(item: &SynthesisItem<'_>, now: DateTime<Utc>, fallback_note: Option<String>) -> GeneratedDocument {
    let body = templates::render_new_document(item.extraction, &[item.record_id.clone()], now);

    let mut metadata = serde_json::Map::new();
    if let Some(note) = fallback_note {
        metadata.insert("fallback".into(), serde_json::Value::String(note));
    }

    GeneratedDocument {
        title: item.extraction.title.clone(),
        category: item.extraction.category,
        body,
        metadata,
        path: target_path(item),
        action: item.decision.action,
        confidence: item.decision.confidence,
        source_records: vec![item.record_id.clone()],
    }
}

/// Assemble the merged document: refreshed frontmatter plus the merged
/// body from the capability.
fn render_merged(
    item: &SynthesisItem<'_>,
    existing: &ExistingDocument,
    merged_body: &str,
    now: DateTime<Utc>,
) -> GeneratedDocument {
    let fm = templates::updated_frontmatter(
        existing,
        item.extraction,
        &[item.record_id.clone()],
        now,
    );
    let body = format!("{}\n{}\n", fm.render(), merged_body.trim());

    GeneratedDocument {
        title: existing.title.clone(),
        category: existing.category,
        body,
        metadata: serde_json::Map::new(),
        path: existing.path.clone(),
        action: item.decision.action,
        confidence: item.decision.confidence,
        source_records: vec![item.record_id.clone()],
    }
}

/// Synthesize documents for a set of decided items, batching merge calls.
///
/// Returns one document per item, in order. IGNORE decisions must be
/// filtered out by the caller; they produce no document.
#[instrument(skip_all, fields(items = items.len(), batch_size))]
pub fn synthesize_documents(
    reasoner: &mut dyn Reasoner,
    items: &[SynthesisItem<'_>],
    batch_size: usize,
    now: DateTime<Utc>,
) -> Vec<GeneratedDocument> {
    let batch_size = batch_size.max(1);
    let mut documents: Vec<Option<GeneratedDocument>> = (0..items.len()).map(|_| None).collect();

    // CREATE and broken update-family items resolve without the capability
    let mut pending: Vec<usize> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        debug_assert_ne!(item.decision.action, MatchAction::Ignore);

        if !item.decision.action.requires_target() {
            documents[i] = Some(render_fresh(item, now, None));
        } else if item.existing.is_none() {
            warn!(
                record = %item.record_id,
                action = %item.decision.action,
                "target document missing from snapshot, rendering fresh"
            );
            documents[i] = Some(render_fresh(
                item,
                now,
                Some("target document missing from snapshot".into()),
            ));
        } else {
            pending.push(i);
        }
    }

    for chunk in pending.chunks(batch_size) {
        let requests: Vec<SynthesizeRequest> = chunk
            .iter()
            .map(|&i| {
                let item = &items[i];
                let existing = item.existing.expect("pending items have a target");
                SynthesizeRequest {
                    record_id: item.record_id.to_string(),
                    path: existing.path.clone(),
                    action: item.decision.action.as_str().to_string(),
                    existing_content: existing.content.clone(),
                    new_content: templates::render_body(item.extraction),
                }
            })
            .collect();

        for (&i, merged) in chunk.iter().zip(reasoner.synthesize_batch(&requests)) {
            let item = &items[i];
            let existing = item.existing.expect("pending items have a target");

            documents[i] = Some(match merged {
                Ok(body) if !body.trim().is_empty() => render_merged(item, existing, &body, now),
                Ok(_) => {
                    warn!(path = %existing.path, "merge returned empty content, rendering fresh");
                    render_fresh(item, now, Some("merge returned empty content".into()))
                }
                Err(e) => {
                    warn!(path = %existing.path, error = %e, "merge failed, rendering fresh");
                    render_fresh(item, now, Some(format!("merge failed: {e}")))
                }
            });
        }
    }

    documents
        .into_iter()
        .map(|d| d.expect("every item resolved"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::validate_extraction;
    use crate::test_support::{ScriptedReasoner, worthy_extraction};
    use chrono::TimeZone;
    use lorekeeper_shared::{DocMetadata, KbCategory, LorekeeperError, TargetDocument};

    fn extraction() -> ExtractionResult {
        validate_extraction(worthy_extraction(0.85)).unwrap()
    }

    fn existing_doc() -> ExistingDocument {
        ExistingDocument {
            path: "troubleshooting/db-timeouts.md".into(),
            category: KbCategory::Troubleshooting,
            tags: vec!["database".into()],
            title: "Database Timeouts".into(),
            content: "# Database Timeouts\n\n## Problem\n\nOld description.\n".into(),
            metadata: DocMetadata {
                created_at: Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()),
                ..Default::default()
            },
        }
    }

    fn decision(action: MatchAction, target: Option<&str>) -> MatchDecision {
        MatchDecision {
            action,
            confidence: 0.8,
            rationale: "r".into(),
            value_added: "v".into(),
            target: target.map(|path| TargetDocument {
                path: path.into(),
                title: None,
                category: None,
            }),
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 7, 12, 0, 0).unwrap()
    }

    #[test]
    fn create_renders_from_template_without_capability() {
        let mut reasoner = ScriptedReasoner::new();
        let ex = extraction();
        let dec = decision(MatchAction::Create, None);
        let items = vec![SynthesisItem {
            record_id: RecordId::new(),
            extraction: &ex,
            decision: &dec,
            existing: None,
        }];

        let docs = synthesize_documents(&mut reasoner, &items, 4, fixed_now());

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].action, MatchAction::Create);
        assert_eq!(docs[0].path, "troubleshooting/database-connection-timeouts.md");
        assert!(docs[0].body.contains("## Problem"));
        assert!(docs[0].body.starts_with("---\n"));
        assert!(reasoner.seen_syntheses.is_empty());
    }

    #[test]
    fn update_merges_and_preserves_document_identity() {
        let mut reasoner = ScriptedReasoner::new();
        reasoner.merges.push_back(Ok(
            "# Database Timeouts\n\n## Problem\n\nOld description.\n\n## Root Cause\n\nPool exhaustion.\n".into(),
        ));

        let ex = extraction();
        let doc = existing_doc();
        let dec = decision(MatchAction::Update, Some(&doc.path));
        let items = vec![SynthesisItem {
            record_id: RecordId::new(),
            extraction: &ex,
            decision: &dec,
            existing: Some(&doc),
        }];

        let docs = synthesize_documents(&mut reasoner, &items, 4, fixed_now());

        assert_eq!(docs[0].path, "troubleshooting/db-timeouts.md");
        // Identity comes from the existing document, not the extraction
        assert_eq!(docs[0].title, "Database Timeouts");
        assert!(docs[0].body.contains("title: \"Database Timeouts\""));
        assert!(docs[0].body.contains("created_at: \"2026-01-01"));
        assert!(docs[0].body.contains("## Root Cause"));
        assert!(docs[0].metadata.get("fallback").is_none());

        // The capability saw both sides of the merge
        let request = &reasoner.seen_syntheses[0];
        assert!(request.existing_content.contains("Old description."));
        assert!(request.new_content.contains("## Problem"));
        assert_eq!(request.action, "update");
    }

    #[test]
    fn empty_merge_falls_back_to_fresh_render() {
        let mut reasoner = ScriptedReasoner::new();
        reasoner.merges.push_back(Ok("   \n".into()));

        let ex = extraction();
        let doc = existing_doc();
        let dec = decision(MatchAction::Replace, Some(&doc.path));
        let items = vec![SynthesisItem {
            record_id: RecordId::new(),
            extraction: &ex,
            decision: &dec,
            existing: Some(&doc),
        }];

        let docs = synthesize_documents(&mut reasoner, &items, 4, fixed_now());

        // Fresh render at the existing path, action preserved for the sink
        assert_eq!(docs[0].path, "troubleshooting/db-timeouts.md");
        assert_eq!(docs[0].action, MatchAction::Replace);
        assert_eq!(
            docs[0].metadata.get("fallback").and_then(|v| v.as_str()),
            Some("merge returned empty content")
        );
        assert!(docs[0].body.contains("## Problem"));
    }

    #[test]
    fn merge_error_falls_back_and_is_isolated() {
        let mut reasoner = ScriptedReasoner::new();
        reasoner
            .merges
            .push_back(Err(LorekeeperError::ReasoningTimeout("slow".into())));
        reasoner.merges.push_back(Ok("merged fine\n".into()));

        let ex = extraction();
        let doc_a = existing_doc();
        let mut doc_b = existing_doc();
        doc_b.path = "troubleshooting/other.md".into();

        let dec_a = decision(MatchAction::Update, Some(&doc_a.path));
        let dec_b = decision(MatchAction::Append, Some(&doc_b.path));
        let items = vec![
            SynthesisItem {
                record_id: RecordId::new(),
                extraction: &ex,
                decision: &dec_a,
                existing: Some(&doc_a),
            },
            SynthesisItem {
                record_id: RecordId::new(),
                extraction: &ex,
                decision: &dec_b,
                existing: Some(&doc_b),
            },
        ];

        let docs = synthesize_documents(&mut reasoner, &items, 4, fixed_now());

        assert!(docs[0].metadata.get("fallback").is_some());
        assert!(docs[1].metadata.get("fallback").is_none());
        assert!(docs[1].body.contains("merged fine"));
    }

    #[test]
    fn missing_target_renders_fresh_without_capability() {
        let mut reasoner = ScriptedReasoner::new();

        let ex = extraction();
        let dec = decision(MatchAction::Update, Some("troubleshooting/gone.md"));
        let items = vec![SynthesisItem {
            record_id: RecordId::new(),
            extraction: &ex,
            decision: &dec,
            existing: None,
        }];

        let docs = synthesize_documents(&mut reasoner, &items, 4, fixed_now());

        assert_eq!(docs[0].path, "troubleshooting/gone.md");
        assert!(docs[0].metadata.get("fallback").is_some());
        assert!(reasoner.seen_syntheses.is_empty());
    }
}
