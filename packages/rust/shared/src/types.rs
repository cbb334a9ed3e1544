//! Core domain types for the lorekeeper decision engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LorekeeperError, Result};

/// Default cap on messages per conversation record.
///
/// Mirrors the conversation source's own per-fetch ceiling. Exceeding it is
/// a hard validation error, never a silent truncation.
pub const DEFAULT_MESSAGE_CAP: usize = 100;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for conversation record identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Generate a new time-sortable record identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A UUID v7 wrapper for processing run identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Short suffix used in branch/proposal names.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Conversation record
// ---------------------------------------------------------------------------

/// Where a conversation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Chat,
    File,
    Text,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::File => "file",
            Self::Text => "text",
        }
    }
}

/// A single platform-agnostic message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Source-assigned message identifier.
    pub id: String,
    /// Author identifier (platform user id).
    pub author_id: String,
    /// Display name, if known. May be cleared by redaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,
    /// Text content.
    pub content: String,
    /// When the message was posted.
    pub timestamp: DateTime<Utc>,
    /// Whether the redaction boundary touched this message.
    #[serde(default)]
    pub is_redacted: bool,
    /// Free-form source metadata (e.g. `orphaned: true`).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A message placed in a conversation record, annotated with its global
/// position and the position of the message it replies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedMessage {
    /// Global position within the record. Unique, assigned sequentially.
    pub idx: usize,
    /// `idx` of the anchor message this one replies to. Always < `idx`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_idx: Option<usize>,
    /// The message itself.
    pub message: Message,
}

/// The normalized, globally-indexed representation of one conversation.
///
/// Built through [`ConversationRecord::push`], an append-only arena that
/// enforces the ordering invariants at construction time: `idx` values are
/// unique and strictly increasing, `parent_idx` (when present) is strictly
/// less than the owning `idx`, and the total count never exceeds the cap.
/// Back-references therefore cannot form cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: RecordId,
    pub source: SourceKind,
    /// Channel or context identifier from the source platform.
    pub channel_id: String,
    messages: Vec<IndexedMessage>,
    #[serde(default = "default_message_cap")]
    max_messages: usize,
}

fn default_message_cap() -> usize {
    DEFAULT_MESSAGE_CAP
}

impl ConversationRecord {
    /// Create an empty record with the default message cap.
    pub fn new(source: SourceKind, channel_id: impl Into<String>) -> Self {
        Self::with_message_cap(source, channel_id, DEFAULT_MESSAGE_CAP)
    }

    /// Create an empty record with an explicit message cap.
    pub fn with_message_cap(
        source: SourceKind,
        channel_id: impl Into<String>,
        max_messages: usize,
    ) -> Self {
        Self {
            id: RecordId::new(),
            source,
            channel_id: channel_id.into(),
            messages: Vec::new(),
            max_messages,
        }
    }

    /// Append a message, assigning the next `idx`.
    ///
    /// Rejects forward/self parent references and cap overflow with a
    /// validation error. Returns the assigned `idx`.
    pub fn push(&mut self, message: Message, parent_idx: Option<usize>) -> Result<usize> {
        let idx = self.messages.len();

        if idx >= self.max_messages {
            return Err(LorekeeperError::validation(format!(
                "message cap {} exceeded for record {}",
                self.max_messages, self.id
            )));
        }

        if let Some(parent) = parent_idx {
            if parent >= idx {
                return Err(LorekeeperError::validation(format!(
                    "parent_idx {parent} must be < idx {idx} (no forward or self references)"
                )));
            }
        }

        self.messages.push(IndexedMessage {
            idx,
            parent_idx,
            message,
        });
        Ok(idx)
    }

    /// Messages in global index order.
    pub fn messages(&self) -> &[IndexedMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message_cap(&self) -> usize {
        self.max_messages
    }

    /// Distinct author ids, in first-appearance order.
    pub fn participants(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for m in &self.messages {
            let author = m.message.author_id.as_str();
            if !seen.contains(&author) {
                seen.push(author);
            }
        }
        seen
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Knowledge base document categories. Closed vocabulary: downstream
/// template selection matches exhaustively over these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KbCategory {
    Troubleshooting,
    Process,
    Decision,
    Reference,
    General,
}

impl KbCategory {
    /// All categories, in display order.
    pub const ALL: [KbCategory; 5] = [
        Self::Troubleshooting,
        Self::Process,
        Self::Decision,
        Self::Reference,
        Self::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Troubleshooting => "troubleshooting",
            Self::Process => "process",
            Self::Decision => "decision",
            Self::Reference => "reference",
            Self::General => "general",
        }
    }

    /// Parse a category name, rejecting anything outside the closed set.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "troubleshooting" => Ok(Self::Troubleshooting),
            "process" => Ok(Self::Process),
            "decision" => Ok(Self::Decision),
            "reference" => Ok(Self::Reference),
            "general" => Ok(Self::General),
            other => Err(LorekeeperError::validation(format!(
                "unknown category: {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for KbCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The worthiness judgment for one conversation record.
///
/// Produced once per record per processing run and never mutated; a retry
/// produces a fresh value so the reasoning trail stays auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    /// Whether the conversation contains knowledge worth persisting.
    pub is_kb_worthy: bool,
    /// Confidence in the judgment, clamped to [0, 1].
    pub confidence: f64,
    pub category: KbCategory,
    pub title: String,
    pub tags: Vec<String>,
    pub key_topics: Vec<String>,
    /// One-paragraph summary of the knowledge.
    pub summary: String,
    /// Bullet points carried into the rendered document.
    pub key_points: Vec<String>,
    /// The capability's own explanation of the judgment.
    pub reasoning: String,
}

impl ExtractionResult {
    /// A conservative non-worthy result used when reasoning fails.
    pub fn not_worthy(reason: impl Into<String>) -> Self {
        Self {
            is_kb_worthy: false,
            confidence: 0.0,
            category: KbCategory::General,
            title: String::new(),
            tags: Vec::new(),
            key_topics: Vec::new(),
            summary: String::new(),
            key_points: Vec::new(),
            reasoning: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Existing documents
// ---------------------------------------------------------------------------

/// Frontmatter-equivalent metadata of an existing document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    /// Source references (record ids, permalinks).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

/// A document in the existing-corpus snapshot. Read-only for the duration
/// of one processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingDocument {
    /// Path within the corpus; unique key (e.g. `troubleshooting/db-timeouts.md`).
    pub path: String,
    pub category: KbCategory,
    pub tags: Vec<String>,
    pub title: String,
    /// Full markdown content, frontmatter excluded.
    pub content: String,
    pub metadata: DocMetadata,
}

// ---------------------------------------------------------------------------
// Match decision
// ---------------------------------------------------------------------------

/// What to do with new content relative to the existing corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchAction {
    Create,
    Update,
    Append,
    Replace,
    Ignore,
}

impl MatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Append => "append",
            Self::Replace => "replace",
            Self::Ignore => "ignore",
        }
    }

    /// Whether the action operates on an existing document.
    pub fn requires_target(&self) -> bool {
        matches!(self, Self::Update | Self::Append | Self::Replace)
    }
}

impl std::fmt::Display for MatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the document a decision targets.
///
/// For `Update`/`Append`/`Replace` this names the matched existing
/// document; for `Create` it is a suggestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDocument {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<KbCategory>,
}

/// The arbiter's verdict for one conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchDecision {
    pub action: MatchAction,
    /// Confidence in the decision, in [0, 1].
    pub confidence: f64,
    /// Explanation of the decision and how the new content relates to
    /// existing documents.
    pub rationale: String,
    /// What value the new content adds, or why it lacks value for Ignore.
    pub value_added: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetDocument>,
}

impl MatchDecision {
    /// Enforce the decision invariants: confidence range and the
    /// target requirement for update-family actions.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(LorekeeperError::validation(format!(
                "decision confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if self.action.requires_target() && self.target.is_none() {
            return Err(LorekeeperError::validation(format!(
                "action {} requires a target document",
                self.action
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Generated documents
// ---------------------------------------------------------------------------

/// Terminal artifact of the decision engine; ownership passes to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub title: String,
    pub category: KbCategory,
    /// Rendered markdown body, frontmatter included.
    pub body: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Target path within the corpus.
    pub path: String,
    /// The operation the sink should apply.
    pub action: MatchAction,
    pub confidence: f64,
    /// Conversation records this document was generated from.
    pub source_records: Vec<RecordId>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Turn a title into a filesystem/branch-safe slug.
///
/// Lowercases, collapses every non-alphanumeric run into a single `-`,
/// and trims leading/trailing dashes.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
