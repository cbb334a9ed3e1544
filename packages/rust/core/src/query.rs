//! Consumer query surface: grounded Q&A over the document snapshot.
//!
//! The capability only ever sees documents from the snapshot and is
//! instructed to answer strictly from them. Everything else (a reasoning
//! failure, an answer citing unknown paths, no matching documents)
//! resolves to the explicit no-information sentinel, never to an
//! ungrounded answer.

use tracing::{instrument, warn};

use lorekeeper_reasoning::{AnswerRequest, ContextDoc, Reasoner};
use lorekeeper_shared::ExistingDocument;

use crate::prefilter::{PrefilterOptions, Query, rank};

/// How many top-ranked documents ground one answer.
const DEFAULT_CONTEXT_DOCS: usize = 5;

/// Characters of document content handed to the capability per document.
const MAX_DOC_CHARS: usize = 6_000;

/// Outcome of a knowledge base query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// A grounded answer citing specific snapshot paths.
    Answer {
        text: String,
        citations: Vec<String>,
    },
    /// The snapshot holds nothing relevant to the question.
    NoInformation,
}

/// Answer a free-text question from the document snapshot.
#[instrument(skip_all, fields(documents = snapshot.len()))]
pub fn answer_query(
    reasoner: &mut dyn Reasoner,
    question: &str,
    snapshot: &[ExistingDocument],
) -> QueryOutcome {
    if question.trim().is_empty() || snapshot.is_empty() {
        return QueryOutcome::NoInformation;
    }

    let query = Query::from_question(question);
    let opts = PrefilterOptions {
        shortlist_max: DEFAULT_CONTEXT_DOCS,
        ..PrefilterOptions::default()
    };
    let ranked = rank(&query, snapshot, &opts);
    if ranked.is_empty() {
        return QueryOutcome::NoInformation;
    }

    let documents: Vec<ContextDoc> = ranked
        .iter()
        .map(|c| ContextDoc {
            path: c.document.path.clone(),
            title: c.document.title.clone(),
            content: truncate_content(&c.document.content, MAX_DOC_CHARS),
        })
        .collect();
    let known_paths: Vec<String> = documents.iter().map(|d| d.path.clone()).collect();

    let request = AnswerRequest {
        question: question.to_string(),
        documents,
    };

    let mut results = reasoner.answer_batch(std::slice::from_ref(&request));
    let raw = match results.pop() {
        Some(Ok(raw)) => raw,
        Some(Err(e)) => {
            warn!(error = %e, "answer call failed, reporting no information");
            return QueryOutcome::NoInformation;
        }
        None => return QueryOutcome::NoInformation,
    };

    if !raw.has_answer || raw.answer.trim().is_empty() {
        return QueryOutcome::NoInformation;
    }

    // An answer must cite documents it was actually given; anything else
    // is treated as ungrounded and discarded.
    if raw.citations.is_empty()
        || !raw.citations.iter().all(|c| known_paths.iter().any(|p| p == c))
    {
        warn!(citations = ?raw.citations, "answer cited unknown documents, discarding");
        return QueryOutcome::NoInformation;
    }

    QueryOutcome::Answer {
        text: raw.answer,
        citations: raw.citations,
    }
}

/// Truncate content to approximately `max_chars` characters.
fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        content.to_string()
    } else {
        let mut end = max_chars;
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}\n\n[... truncated ...]", &content[..end])
    }
}
