//! Scripted reasoner and record builders shared by the crate's tests.

use std::collections::VecDeque;

use chrono::{TimeZone, Utc};

use lorekeeper_reasoning::{
    AnswerRequest, ArbitrateRequest, ExtractRequest, RawAnswer, RawDecision, RawExtraction,
    Reasoner, SynthesizeRequest,
};
use lorekeeper_shared::{ConversationRecord, LorekeeperError, Message, Result, SourceKind};

/// A reasoner that replays scripted per-item outcomes in order.
#[derive(Default)]
pub(crate) struct ScriptedReasoner {
    pub extractions: VecDeque<Result<RawExtraction>>,
    pub decisions: VecDeque<Result<RawDecision>>,
    pub merges: VecDeque<Result<String>>,
    pub answers: VecDeque<Result<RawAnswer>>,
    /// Requests seen, for assertions on what reached the capability.
    pub seen_arbitrations: Vec<ArbitrateRequest>,
    pub seen_extractions: Vec<ExtractRequest>,
    pub seen_syntheses: Vec<SynthesizeRequest>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    fn take<T>(queue: &mut VecDeque<Result<T>>, n: usize, what: &str) -> Vec<Result<T>> {
        (0..n)
            .map(|_| {
                queue.pop_front().unwrap_or_else(|| {
                    Err(LorekeeperError::Reasoning(format!("no scripted {what} left")))
                })
            })
            .collect()
    }
}

impl Reasoner for ScriptedReasoner {
    fn extract_batch(&mut self, items: &[ExtractRequest]) -> Vec<Result<RawExtraction>> {
        self.seen_extractions.extend(items.iter().cloned());
        Self::take(&mut self.extractions, items.len(), "extraction")
    }

    fn arbitrate_batch(&mut self, items: &[ArbitrateRequest]) -> Vec<Result<RawDecision>> {
        self.seen_arbitrations.extend(items.iter().cloned());
        Self::take(&mut self.decisions, items.len(), "decision")
    }

    fn synthesize_batch(&mut self, items: &[SynthesizeRequest]) -> Vec<Result<String>> {
        self.seen_syntheses.extend(items.iter().cloned());
        Self::take(&mut self.merges, items.len(), "merge")
    }

    fn answer_batch(&mut self, items: &[AnswerRequest]) -> Vec<Result<RawAnswer>> {
        Self::take(&mut self.answers, items.len(), "answer")
    }
}

/// A worthy extraction with sensible defaults for tests.
pub(crate) fn worthy_extraction(confidence: f64) -> RawExtraction {
    RawExtraction {
        is_kb_worthy: true,
        confidence,
        category: "troubleshooting".into(),
        title: "Database Connection Timeouts".into(),
        tags: vec!["database".into(), "timeout".into()],
        key_topics: vec!["connection pool".into(), "postgresql".into()],
        summary: "Connections to the production database time out under load.".into(),
        key_points: vec![
            "Pool exhaustion caused the timeouts".into(),
            "Raising the pool size resolved it".into(),
        ],
        reasoning: "Clear problem and verified solution.".into(),
    }
}

/// Build a small conversation record for tests.
pub(crate) fn sample_record(contents: &[&str]) -> ConversationRecord {
    let mut record = ConversationRecord::new(SourceKind::Chat, "C123");
    for (i, content) in contents.iter().enumerate() {
        record
            .push(
                Message {
                    id: format!("m{i}"),
                    author_id: format!("U0{}", i % 2 + 1),
                    author_name: None,
                    content: (*content).into(),
                    timestamp: Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap(),
                    is_redacted: false,
                    metadata: serde_json::Map::new(),
                },
                None,
            )
            .unwrap();
    }
    record
}
