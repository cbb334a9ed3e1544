//! End-to-end batch processing: records + snapshot → decided documents.
//!
//! One processing run takes a list of conversation records and a single
//! corpus snapshot fetched at run start. The snapshot is immutable for
//! the run, so every matching decision is made against one consistent
//! view of the corpus. Stages run in phases with batched reasoning calls;
//! failures are isolated per record and partial success is the default.

use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use lorekeeper_corpus::CorpusSnapshot;
use lorekeeper_reasoning::Reasoner;
use lorekeeper_shared::{
    ConversationRecord, ExtractionResult, GeneratedDocument, MatchAction, PipelineConfig,
    RecordId, Result, RunId,
};
use lorekeeper_storage::{Ledger, OutcomeCounts, content_hash};
use lorekeeper_thread::Redactor;

use crate::arbiter::{self, ArbiterOutcome};
use crate::extractor;
use crate::prefilter::{self, PrefilterOptions};
use crate::synthesizer::{self, SynthesisItem};

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Task-level progress within the current phase.
    fn task_progress(&self, current: usize, total: usize, detail: &str);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn task_progress(&self, _current: usize, _total: usize, _detail: &str) {}
}

// ---------------------------------------------------------------------------
// Run config & result
// ---------------------------------------------------------------------------

/// Configuration for one processing run.
#[derive(Debug, Clone)]
pub struct ProcessRunConfig {
    pub pipeline: PipelineConfig,
    /// Model identifier, used for reasoning-cache keying.
    pub model: String,
}

/// The per-record outcome of a run.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub record_id: RecordId,
    pub action: MatchAction,
    pub confidence: f64,
    pub target_path: Option<String>,
    /// True when a conservative fallback produced this outcome.
    pub fallback: bool,
    pub note: Option<String>,
    /// True when the record could not be processed at all.
    pub failed: bool,
}

/// Result of one processing run.
#[derive(Debug)]
pub struct ProcessRunResult {
    pub run_id: RunId,
    pub outcomes: Vec<RecordOutcome>,
    pub documents: Vec<GeneratedDocument>,
    pub counts: OutcomeCounts,
    pub elapsed: std::time::Duration,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Process a batch of conversation records against one corpus snapshot.
///
/// Stages: redaction boundary → extraction (batched, cached) → prefilter
/// → arbitration (batched) → synthesis (batched). One record's failure
/// never blocks its siblings; the run result reports every outcome.
#[instrument(skip_all, fields(records = records.len(), snapshot = snapshot.len()))]
pub async fn process_records(
    records: &[ConversationRecord],
    snapshot: &CorpusSnapshot,
    reasoner: &mut dyn Reasoner,
    redactor: &dyn Redactor,
    config: &ProcessRunConfig,
    cache: Option<&Ledger>,
    progress: &dyn ProgressReporter,
) -> Result<ProcessRunResult> {
    let start = Instant::now();
    let run_id = RunId::new();
    let now = Utc::now();

    info!(%run_id, records = records.len(), "starting processing run");

    let mut outcomes: Vec<RecordOutcome> = Vec::with_capacity(records.len());
    let mut documents: Vec<GeneratedDocument> = Vec::new();

    // --- Phase 1: Redaction boundary ---
    progress.phase("Masking conversations");
    let mut masked: Vec<Option<ConversationRecord>> = Vec::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        progress.task_progress(i + 1, records.len(), &format!("Masking {}", record.id));
        match redactor.mask(record) {
            Ok(m) => masked.push(Some(m)),
            Err(e) => {
                warn!(record = %record.id, error = %e, "redaction failed, skipping record");
                outcomes.push(RecordOutcome {
                    record_id: record.id.clone(),
                    action: MatchAction::Ignore,
                    confidence: 0.0,
                    target_path: None,
                    fallback: false,
                    note: Some(format!("redaction failed: {e}")),
                    failed: true,
                });
                masked.push(None);
            }
        }
    }

    // --- Phase 2: Extraction (with cache) ---
    progress.phase("Extracting knowledge");
    let mut extractions: Vec<Option<ExtractionResult>> = vec![None; records.len()];
    let mut uncached: Vec<usize> = Vec::new();

    for (i, record) in masked.iter().enumerate() {
        let Some(record) = record else { continue };
        if let Some(ledger) = cache {
            let hash = extraction_cache_key(record);
            match ledger
                .get_cached_reasoning("extract", &hash, &config.model)
                .await
            {
                Ok(Some(json)) => match serde_json::from_str::<ExtractionResult>(&json) {
                    Ok(cached) => {
                        extractions[i] = Some(cached);
                        continue;
                    }
                    Err(e) => warn!(error = %e, "ignoring undecodable cache entry"),
                },
                Ok(None) => {}
                Err(e) => warn!(error = %e, "reasoning cache read failed"),
            }
        }
        uncached.push(i);
    }

    if !uncached.is_empty() {
        let to_extract: Vec<&ConversationRecord> = uncached
            .iter()
            .map(|&i| masked[i].as_ref().expect("uncached records are masked"))
            .collect();
        let fresh = extractor::extract_records(reasoner, &to_extract, config.pipeline.batch_size);

        for (&i, extraction) in uncached.iter().zip(fresh) {
            if let Some(ledger) = cache {
                let record = masked[i].as_ref().expect("uncached records are masked");
                let hash = extraction_cache_key(record);
                if let Ok(json) = serde_json::to_string(&extraction) {
                    let _ = ledger
                        .set_cached_reasoning("extract", &hash, &config.model, &json)
                        .await;
                }
            }
            extractions[i] = Some(extraction);
        }
    }

    // Split worthy records from the rest
    let mut worthy: Vec<usize> = Vec::new();
    for (i, record) in masked.iter().enumerate() {
        let Some(record) = record else { continue };
        let extraction = extractions[i].as_ref().expect("masked records extracted");

        if extraction.is_kb_worthy && !extraction.title.trim().is_empty() {
            worthy.push(i);
        } else {
            outcomes.push(RecordOutcome {
                record_id: record.id.clone(),
                action: MatchAction::Ignore,
                confidence: extraction.confidence,
                target_path: None,
                fallback: false,
                note: Some(extraction.reasoning.clone()),
                failed: false,
            });
        }
    }

    // --- Phase 3: Prefilter + arbitration ---
    progress.phase("Matching against existing documents");
    let prefilter_opts = PrefilterOptions {
        min_score: config.pipeline.min_score,
        shortlist_max: config.pipeline.shortlist_max,
    };

    let items: Vec<(String, &ExtractionResult, Vec<prefilter::ScoredCandidate<'_>>)> = worthy
        .iter()
        .map(|&i| {
            let record = masked[i].as_ref().expect("worthy records are masked");
            let extraction = extractions[i].as_ref().expect("worthy records extracted");
            let shortlist =
                prefilter::shortlist(extraction, snapshot.documents(), &prefilter_opts);
            (record.id.to_string(), extraction, shortlist)
        })
        .collect();

    let decided: Vec<ArbiterOutcome> = arbiter::arbitrate_records(
        reasoner,
        &items,
        config.pipeline.batch_size,
        config.pipeline.confidence_gate,
    );

    // --- Phase 4: Synthesis ---
    progress.phase("Synthesizing documents");
    let mut synthesis_items: Vec<SynthesisItem<'_>> = Vec::new();
    let mut synthesis_owners: Vec<usize> = Vec::new();

    for (&i, outcome) in worthy.iter().zip(&decided) {
        let record = masked[i].as_ref().expect("worthy records are masked");
        let extraction = extractions[i].as_ref().expect("worthy records extracted");

        if outcome.decision.action == MatchAction::Ignore {
            outcomes.push(RecordOutcome {
                record_id: record.id.clone(),
                action: MatchAction::Ignore,
                confidence: outcome.decision.confidence,
                target_path: None,
                fallback: outcome.fallback,
                note: Some(outcome.decision.rationale.clone()),
                failed: false,
            });
            continue;
        }

        let existing = outcome
            .decision
            .target
            .as_ref()
            .and_then(|t| snapshot.get(&t.path));

        synthesis_items.push(SynthesisItem {
            record_id: record.id.clone(),
            extraction,
            decision: &outcome.decision,
            existing,
        });
        synthesis_owners.push(i);
    }

    let synthesized = synthesizer::synthesize_documents(
        reasoner,
        &synthesis_items,
        config.pipeline.batch_size,
        now,
    );

    for ((document, &i), item) in synthesized.into_iter().zip(&synthesis_owners).zip(&synthesis_items) {
        let record = masked[i].as_ref().expect("worthy records are masked");
        let decided_idx = worthy.iter().position(|&w| w == i).expect("owner is worthy");
        let arbiter_fallback = decided[decided_idx].fallback;

        let synth_note = document
            .metadata
            .get("fallback")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        outcomes.push(RecordOutcome {
            record_id: record.id.clone(),
            action: document.action,
            confidence: document.confidence,
            target_path: Some(document.path.clone()),
            fallback: arbiter_fallback || synth_note.is_some(),
            note: synth_note.or_else(|| Some(item.decision.rationale.clone())),
            failed: false,
        });
        documents.push(document);
    }

    // --- Summary ---
    let mut counts = OutcomeCounts::default();
    for outcome in &outcomes {
        if outcome.failed {
            counts.failed += 1;
            continue;
        }
        match outcome.action {
            MatchAction::Create => counts.created += 1,
            MatchAction::Update => counts.updated += 1,
            MatchAction::Append => counts.appended += 1,
            MatchAction::Replace => counts.replaced += 1,
            MatchAction::Ignore => counts.ignored += 1,
        }
    }

    let result = ProcessRunResult {
        run_id,
        outcomes,
        documents,
        counts,
        elapsed: start.elapsed(),
    };

    info!(
        run_id = %result.run_id,
        created = counts.created,
        updated = counts.updated,
        appended = counts.appended,
        replaced = counts.replaced,
        ignored = counts.ignored,
        failed = counts.failed,
        elapsed_ms = result.elapsed.as_millis(),
        "processing run complete"
    );

    Ok(result)
}

/// Cache key input for a record's extraction: the full ordered content.
fn extraction_cache_key(record: &ConversationRecord) -> String {
    let mut joined = String::new();
    for m in record.messages() {
        joined.push_str(&m.message.author_id);
        joined.push(':');
        joined.push_str(&m.message.content);
        joined.push('\n');
    }
    content_hash(&joined, "extract")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedReasoner, sample_record, worthy_extraction};
    use lorekeeper_corpus::document_from_markdown;
    use lorekeeper_reasoning::RawDecision;
    use lorekeeper_shared::{AppConfig, LorekeeperError};
    use lorekeeper_thread::PatternRedactor;

    fn config() -> ProcessRunConfig {
        ProcessRunConfig {
            pipeline: PipelineConfig::from(&AppConfig::default()),
            model: "test-model".into(),
        }
    }

    fn update_decision(target: &str) -> RawDecision {
        RawDecision {
            action: "update".into(),
            confidence: 0.8,
            rationale: "adds the newly found root cause".into(),
            value_added: "newer finding".into(),
            target_path: Some(target.into()),
            target_title: None,
            target_category: None,
        }
    }

    fn ignore_decision() -> RawDecision {
        RawDecision {
            action: "ignore".into(),
            confidence: 0.9,
            rationale: "restates the existing solution with nothing new".into(),
            value_added: "none".into(),
            target_path: None,
            target_title: None,
            target_category: None,
        }
    }

    /// Empty corpus: the decision is CREATE with the extraction's own
    /// confidence and the arbiter is never consulted.
    #[tokio::test]
    async fn empty_corpus_always_creates() {
        let mut reasoner = ScriptedReasoner::new();
        reasoner.extractions.push_back(Ok(worthy_extraction(0.85)));

        let records = vec![sample_record(&["we found the fix", "pool size was too low"])];
        let snapshot = CorpusSnapshot::default();

        let result = process_records(
            &records,
            &snapshot,
            &mut reasoner,
            &PatternRedactor::new(),
            &config(),
            None,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(result.counts.created, 1);
        assert_eq!(result.outcomes[0].action, MatchAction::Create);
        assert_eq!(result.outcomes[0].confidence, 0.85);
        assert!(reasoner.seen_arbitrations.is_empty());
        assert_eq!(result.documents.len(), 1);
        assert!(result.documents[0].body.contains("## Problem"));
    }

    /// A value-adding follow-up updates the matched document.
    #[tokio::test]
    async fn follow_up_updates_existing_document() {
        let existing = document_from_markdown(
            "troubleshooting/database-connection-timeouts.md",
            "---\ntitle: \"Database Connection Timeouts\"\ncategory: \"troubleshooting\"\ntags: [\"database\", \"timeout\"]\n---\n# Database Connection Timeouts\n\nConnections time out under load.\n",
        )
        .unwrap();
        let snapshot = CorpusSnapshot::from_documents(vec![existing]);

        let mut reasoner = ScriptedReasoner::new();
        reasoner.extractions.push_back(Ok(worthy_extraction(0.9)));
        reasoner.decisions.push_back(Ok(update_decision(
            "troubleshooting/database-connection-timeouts.md",
        )));
        reasoner
            .merges
            .push_back(Ok("# Database Connection Timeouts\n\nNow with the root cause.\n".into()));

        let records = vec![sample_record(&["found the actual root cause"])];
        let result = process_records(
            &records,
            &snapshot,
            &mut reasoner,
            &PatternRedactor::new(),
            &config(),
            None,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(result.counts.updated, 1);
        assert_eq!(
            result.outcomes[0].target_path.as_deref(),
            Some("troubleshooting/database-connection-timeouts.md")
        );
        assert!(!result.outcomes[0].fallback);
        assert!(result.documents[0].body.contains("root cause"));
    }

    /// A near-duplicate is ignored and produces no document.
    #[tokio::test]
    async fn near_duplicate_is_ignored() {
        let existing = document_from_markdown(
            "troubleshooting/database-connection-timeouts.md",
            "---\ntitle: \"Database Connection Timeouts\"\ncategory: \"troubleshooting\"\ntags: [\"database\"]\n---\nRaise the pool size.\n",
        )
        .unwrap();
        let snapshot = CorpusSnapshot::from_documents(vec![existing]);

        let mut reasoner = ScriptedReasoner::new();
        reasoner.extractions.push_back(Ok(worthy_extraction(0.85)));
        reasoner.decisions.push_back(Ok(ignore_decision()));

        let records = vec![sample_record(&["the fix was raising the pool size"])];
        let result = process_records(
            &records,
            &snapshot,
            &mut reasoner,
            &PatternRedactor::new(),
            &config(),
            None,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(result.counts.ignored, 1);
        assert!(result.documents.is_empty());
        assert!(result.outcomes[0].note.as_deref().unwrap().contains("nothing new"));
    }

    /// Unworthy conversations never reach the arbiter.
    #[tokio::test]
    async fn unworthy_records_are_ignored_before_matching() {
        let mut reasoner = ScriptedReasoner::new();
        let mut raw = worthy_extraction(0.2);
        raw.is_kb_worthy = false;
        reasoner.extractions.push_back(Ok(raw));

        let records = vec![sample_record(&["lunch anyone?"])];
        let snapshot = CorpusSnapshot::default();

        let result = process_records(
            &records,
            &snapshot,
            &mut reasoner,
            &PatternRedactor::new(),
            &config(),
            None,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(result.counts.ignored, 1);
        assert!(reasoner.seen_arbitrations.is_empty());
        assert!(result.documents.is_empty());
    }

    /// One record's reasoning failure never blocks its siblings.
    #[tokio::test]
    async fn failures_are_isolated_per_record() {
        let mut reasoner = ScriptedReasoner::new();
        reasoner
            .extractions
            .push_back(Err(LorekeeperError::ReasoningTimeout("slow".into())));
        reasoner.extractions.push_back(Ok(worthy_extraction(0.85)));

        let records = vec![
            sample_record(&["first conversation"]),
            sample_record(&["second conversation"]),
        ];
        let snapshot = CorpusSnapshot::default();

        let result = process_records(
            &records,
            &snapshot,
            &mut reasoner,
            &PatternRedactor::new(),
            &config(),
            None,
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(result.counts.ignored, 1);
        assert_eq!(result.counts.created, 1);
        assert_eq!(result.documents.len(), 1);
    }

    /// Re-processing content already in the corpus must not CREATE again:
    /// the generated document shortlists and the arbiter takes over.
    #[tokio::test]
    async fn reprocessing_generated_content_does_not_create() {
        // First pass: empty corpus, document generated
        let mut reasoner = ScriptedReasoner::new();
        reasoner.extractions.push_back(Ok(worthy_extraction(0.85)));

        let records = vec![sample_record(&["pool size fix discussion"])];
        let first = process_records(
            &records,
            &CorpusSnapshot::default(),
            &mut reasoner,
            &PatternRedactor::new(),
            &config(),
            None,
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(first.counts.created, 1);

        // Second pass: corpus contains only that generated document
        let generated = document_from_markdown(
            &first.documents[0].path,
            &first.documents[0].body,
        )
        .unwrap();
        let snapshot = CorpusSnapshot::from_documents(vec![generated]);

        let mut reasoner = ScriptedReasoner::new();
        reasoner.extractions.push_back(Ok(worthy_extraction(0.85)));
        reasoner.decisions.push_back(Ok(ignore_decision()));

        let second = process_records(
            &records,
            &snapshot,
            &mut reasoner,
            &PatternRedactor::new(),
            &config(),
            None,
            &SilentProgress,
        )
        .await
        .unwrap();

        // The arbiter was consulted (no CREATE short-circuit) and chose
        // not to create a duplicate
        assert!(!reasoner.seen_arbitrations.is_empty());
        assert_ne!(second.outcomes[0].action, MatchAction::Create);
    }

    /// The extraction cache avoids repeat reasoning calls across runs.
    #[tokio::test]
    async fn extraction_cache_short_circuits_second_run() {
        let tmp = std::env::temp_dir().join(format!(
            "lk_pipeline_test_{}.db",
            uuid::Uuid::now_v7()
        ));
        let ledger = Ledger::open(&tmp).await.unwrap();

        let records = vec![sample_record(&["cacheable conversation"])];

        let mut reasoner = ScriptedReasoner::new();
        reasoner.extractions.push_back(Ok(worthy_extraction(0.85)));
        let first = process_records(
            &records,
            &CorpusSnapshot::default(),
            &mut reasoner,
            &PatternRedactor::new(),
            &config(),
            Some(&ledger),
            &SilentProgress,
        )
        .await
        .unwrap();
        assert_eq!(first.counts.created, 1);
        assert_eq!(reasoner.seen_extractions.len(), 1);

        // Second run: no scripted extraction available, cache must serve it
        let mut cold_reasoner = ScriptedReasoner::new();
        let second = process_records(
            &records,
            &CorpusSnapshot::default(),
            &mut cold_reasoner,
            &PatternRedactor::new(),
            &config(),
            Some(&ledger),
            &SilentProgress,
        )
        .await
        .unwrap();

        assert_eq!(second.counts.created, 1);
        assert!(cold_reasoner.seen_extractions.is_empty());
    }
}
