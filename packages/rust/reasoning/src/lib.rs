//! The semantic reasoning capability boundary.
//!
//! All language-understanding work goes through the [`Reasoner`] trait:
//! four batched request shapes (extract, arbitrate, synthesize, answer)
//! returning schema-validated structured results, never free text. The
//! production implementation is [`BridgeReasoner`], a spawned subprocess
//! speaking a JSON-lines protocol over stdin/stdout; tests substitute
//! in-process fakes.
//!
//! Failure isolation is per item: one malformed or timed-out item in a
//! batch never affects its siblings. Transient failures (rate limits,
//! timeouts) are retried with exponential backoff; everything else
//! resolves immediately so callers can apply their documented fallbacks.

pub mod bridge;
pub mod protocol;

pub use bridge::BridgeReasoner;
pub use protocol::{
    AnswerRequest, ArbitrateRequest, CandidateDoc, ContextDoc, ExtractRequest, PromptMessage,
    RawAnswer, RawDecision, RawExtraction, RawMerged, SynthesizeRequest, TaskKind,
};

use lorekeeper_shared::Result;

/// The reasoning capability. One narrow interface per task, all batched
/// (3 to 5 items per call), so the capability is mockable in tests and
/// swappable without touching pipeline logic.
pub trait Reasoner {
    /// Judge worthiness/category/title/tags for each conversation record.
    fn extract_batch(&mut self, items: &[ExtractRequest]) -> Vec<Result<RawExtraction>>;

    /// Decide create/update/append/replace/ignore against a shortlist.
    fn arbitrate_batch(&mut self, items: &[ArbitrateRequest]) -> Vec<Result<RawDecision>>;

    /// Merge new information into existing content under the
    /// selective-update rule; returns the merged markdown body.
    fn synthesize_batch(&mut self, items: &[SynthesizeRequest]) -> Vec<Result<String>>;

    /// Answer a question strictly from the provided documents.
    fn answer_batch(&mut self, items: &[AnswerRequest]) -> Vec<Result<RawAnswer>>;
}
