//! Wire protocol for the reasoning bridge.
//!
//! Requests carry fully-formatted context; responses are structured JSON
//! validated item by item. Raw* types deliberately keep loosely-typed
//! fields (category and action as strings): closed-vocabulary validation
//! belongs to the extractor and arbiter, not the wire layer.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Task kinds
// ---------------------------------------------------------------------------

/// The four reasoning task kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Extract,
    Arbitrate,
    Synthesize,
    Answer,
}

impl TaskKind {
    /// Cache/storage key for this task kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Arbitrate => "arbitrate",
            Self::Synthesize => "synthesize",
            Self::Answer => "answer",
        }
    }
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// One message of a conversation record as presented to the capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub idx: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_idx: Option<usize>,
    pub author: String,
    pub content: String,
}

/// Extraction request: the full ordered message sequence of one record.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractRequest {
    pub record_id: String,
    pub channel_id: String,
    pub messages: Vec<PromptMessage>,
    /// The closed category vocabulary the capability must choose from.
    pub categories: Vec<String>,
}

/// A shortlisted candidate document, formatted for the arbiter prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateDoc {
    pub path: String,
    pub title: String,
    pub category: String,
    pub tags: Vec<String>,
    /// Category-template-formatted content summary.
    pub summary: String,
}

/// Arbitration request: new content plus the prefilter shortlist.
#[derive(Debug, Clone, Serialize)]
pub struct ArbitrateRequest {
    pub record_id: String,
    pub title: String,
    pub category: String,
    pub tags: Vec<String>,
    /// Extraction confidence, passed through for the gating prior.
    pub confidence: f64,
    /// True when extraction confidence sits below the gate; instructs the
    /// capability to treat Ignore as the default absent strong rationale.
    pub low_confidence_prior: bool,
    /// New content rendered per the category template.
    pub new_content: String,
    pub candidates: Vec<CandidateDoc>,
}

/// Synthesis request: merge new information into existing content.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesizeRequest {
    pub record_id: String,
    pub path: String,
    /// The decided operation (update/append/replace).
    pub action: String,
    pub existing_content: String,
    pub new_content: String,
}

/// A grounding document for the answer task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextDoc {
    pub path: String,
    pub title: String,
    pub content: String,
}

/// Question-answering request over an explicit document set.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerRequest {
    pub question: String,
    pub documents: Vec<ContextDoc>,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Structured extraction as returned by the capability, before
/// closed-vocabulary validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExtraction {
    pub is_kb_worthy: bool,
    pub confidence: f64,
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Structured match decision as returned by the capability, before
/// invariant validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDecision {
    pub action: String,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub value_added: String,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub target_title: Option<String>,
    #[serde(default)]
    pub target_category: Option<String>,
}

/// Merged document body returned by the synthesize task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMerged {
    pub content: String,
}

/// Structured answer: grounded text with citations, or no information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAnswer {
    pub has_answer: bool,
    #[serde(default)]
    pub answer: String,
    /// Paths of the documents the answer is grounded in.
    #[serde(default)]
    pub citations: Vec<String>,
}

// ---------------------------------------------------------------------------
// Bridge messages
// ---------------------------------------------------------------------------

/// Request message sent to the bridge, one JSON line each.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub(crate) enum RequestMessage {
    #[serde(rename = "reason")]
    Reason {
        id: String,
        task: TaskKind,
        model: String,
        timeout_secs: u64,
        items: Vec<serde_json::Value>,
    },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result {
        id: String,
        items: Vec<ItemOutcome>,
    },
    #[serde(rename = "error")]
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
        #[serde(default)]
        kind: Option<ErrorKind>,
    },
}

/// Per-item outcome inside a batch result. Failures are isolated here so
/// one bad item never poisons its siblings.
#[derive(Debug, Deserialize)]
#[serde(tag = "status")]
pub(crate) enum ItemOutcome {
    #[serde(rename = "ok")]
    Ok { value: serde_json::Value },
    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(default)]
        kind: Option<ErrorKind>,
    },
}

/// Bridge-reported failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ErrorKind {
    RateLimited,
    Timeout,
    Schema,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_message_serializes_correctly() {
        let msg = RequestMessage::Reason {
            id: "req-1".into(),
            task: TaskKind::Extract,
            model: "test-model".into(),
            timeout_secs: 30,
            items: vec![serde_json::json!({"record_id": "r1"})],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"reason"#));
        assert!(json.contains(r#""task":"extract"#));
        assert!(json.contains(r#""timeout_secs":30"#));
    }

    #[test]
    fn shutdown_message_serializes_correctly() {
        let json = serde_json::to_string(&RequestMessage::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn response_message_deserializes_ready() {
        let msg: ResponseMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(msg, ResponseMessage::Ready));
    }

    #[test]
    fn response_message_deserializes_mixed_batch() {
        let json = r#"{
            "type": "result",
            "id": "req-1",
            "items": [
                {"status": "ok", "value": {"is_kb_worthy": true, "confidence": 0.9, "category": "troubleshooting"}},
                {"status": "error", "error": "model timeout", "kind": "timeout"}
            ]
        }"#;
        let msg: ResponseMessage = serde_json::from_str(json).unwrap();
        match msg {
            ResponseMessage::Result { id, items } => {
                assert_eq!(id, "req-1");
                assert_eq!(items.len(), 2);
                assert!(matches!(items[0], ItemOutcome::Ok { .. }));
                match &items[1] {
                    ItemOutcome::Error { kind, .. } => {
                        assert_eq!(*kind, Some(ErrorKind::Timeout));
                    }
                    other => panic!("expected error outcome, got {other:?}"),
                }
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[test]
    fn response_message_deserializes_batch_error() {
        let json = r#"{"type":"error","id":"req-2","error":"overloaded","kind":"rate_limited"}"#;
        let msg: ResponseMessage = serde_json::from_str(json).unwrap();
        match msg {
            ResponseMessage::Error { error, kind, .. } => {
                assert_eq!(error, "overloaded");
                assert_eq!(kind, Some(ErrorKind::RateLimited));
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn raw_extraction_fills_optional_defaults() {
        let raw: RawExtraction = serde_json::from_str(
            r#"{"is_kb_worthy": false, "confidence": 0.1, "category": "general"}"#,
        )
        .unwrap();
        assert!(!raw.is_kb_worthy);
        assert!(raw.title.is_empty());
        assert!(raw.tags.is_empty());
    }

    #[test]
    fn raw_decision_roundtrip() {
        let raw = RawDecision {
            action: "update".into(),
            confidence: 0.82,
            rationale: "adds the root cause".into(),
            value_added: "newer finding".into(),
            target_path: Some("troubleshooting/db-timeouts.md".into()),
            target_title: Some("Database Timeouts".into()),
            target_category: Some("troubleshooting".into()),
        };
        let json = serde_json::to_string(&raw).unwrap();
        let parsed: RawDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.action, "update");
        assert_eq!(parsed.target_path.as_deref(), Some("troubleshooting/db-timeouts.md"));
    }

    #[test]
    fn raw_answer_no_information_shape() {
        let raw: RawAnswer = serde_json::from_str(r#"{"has_answer": false}"#).unwrap();
        assert!(!raw.has_answer);
        assert!(raw.citations.is_empty());
    }
}
