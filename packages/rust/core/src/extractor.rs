//! Knowledge extraction: worthiness, category, title, tags, topics.
//!
//! The judgment itself is delegated to the reasoning capability; this
//! stage owns validation on both sides. Inbound: the record must be
//! non-empty. Outbound: the category must be one of the closed five and
//! confidence is clamped into [0, 1]. Any reasoning failure or
//! out-of-schema result degrades to a non-worthy extraction with zero
//! confidence; an unreachable record never aborts a batch.

use tracing::{instrument, warn};

use lorekeeper_reasoning::{ExtractRequest, PromptMessage, RawExtraction, Reasoner};
use lorekeeper_shared::{
    ConversationRecord, ExtractionResult, KbCategory, LorekeeperError, Result,
};

/// Build the extraction request for one record: the full ordered message
/// sequence (content + author + idx + parent_idx) as context.
pub fn build_extract_request(record: &ConversationRecord) -> ExtractRequest {
    ExtractRequest {
        record_id: record.id.to_string(),
        channel_id: record.channel_id.clone(),
        messages: record
            .messages()
            .iter()
            .map(|m| PromptMessage {
                idx: m.idx,
                parent_idx: m.parent_idx,
                author: m
                    .message
                    .author_name
                    .clone()
                    .unwrap_or_else(|| m.message.author_id.clone()),
                content: m.message.content.clone(),
            })
            .collect(),
        categories: KbCategory::ALL.iter().map(|c| c.as_str().to_string()).collect(),
    }
}

/// Validate a raw capability result into an [`ExtractionResult`].
///
/// The category must come from the closed vocabulary; confidence is
/// clamped rather than rejected.
pub fn validate_extraction(raw: RawExtraction) -> Result<ExtractionResult> {
    let category = KbCategory::parse(&raw.category)
        .map_err(|e| LorekeeperError::ReasoningSchema(e.to_string()))?;

    Ok(ExtractionResult {
        is_kb_worthy: raw.is_kb_worthy,
        confidence: raw.confidence.clamp(0.0, 1.0),
        category,
        title: raw.title,
        tags: raw.tags,
        key_topics: raw.key_topics,
        summary: raw.summary,
        key_points: raw.key_points,
        reasoning: raw.reasoning,
    })
}

/// Extract knowledge from a set of records, batching reasoning calls.
///
/// Always returns one result per record, in order. Empty records and
/// failed reasoning calls yield conservative non-worthy results.
#[instrument(skip_all, fields(records = records.len(), batch_size))]
pub fn extract_records(
    reasoner: &mut dyn Reasoner,
    records: &[&ConversationRecord],
    batch_size: usize,
) -> Vec<ExtractionResult> {
    let batch_size = batch_size.max(1);
    let mut results: Vec<Option<ExtractionResult>> = vec![None; records.len()];

    // Empty records never reach the capability
    let mut pending: Vec<usize> = Vec::new();
    for (i, record) in records.iter().enumerate() {
        if record.is_empty() {
            results[i] = Some(ExtractionResult::not_worthy(
                "empty conversation record, nothing to extract",
            ));
        } else {
            pending.push(i);
        }
    }

    for chunk in pending.chunks(batch_size) {
        let requests: Vec<ExtractRequest> = chunk
            .iter()
            .map(|&i| build_extract_request(records[i]))
            .collect();

        for (&i, outcome) in chunk.iter().zip(reasoner.extract_batch(&requests)) {
            results[i] = Some(match outcome.and_then(validate_extraction) {
                Ok(extraction) => extraction,
                Err(e) => {
                    warn!(record = %records[i].id, error = %e, "extraction failed, marking not worthy");
                    ExtractionResult::not_worthy(format!("extraction failed: {e}"))
                }
            });
        }
    }

    results
        .into_iter()
        .map(|r| r.expect("every record resolved"))
        .collect()
}
