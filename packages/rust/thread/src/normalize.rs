//! Thread normalization: one index-stable record per conversation.
//!
//! Merges a main message timeline with expanded reply sets into a single
//! [`ConversationRecord`] ordered by timestamp, with `idx` assigned
//! sequentially and `parent_idx` back-references resolved through a
//! source-id lookup. Ordering is fully deterministic:
//!
//! - a message precedes any of its own replies, even when client clock
//!   skew stamps a reply earlier than its anchor (the anchor's timestamp
//!   floors the reply's effective sort time);
//! - among identical timestamps, main-timeline retrieval order wins, and
//!   each reply sorts immediately after its anchor in reply-fetch order.
//!
//! Replies whose anchor is absent from the input are orphans: they attach
//! as top-level messages (`parent_idx = None`) flagged `orphaned: true` in
//! metadata rather than being dropped.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use lorekeeper_shared::{
    ConversationRecord, LorekeeperError, Message, Result, SourceKind, DEFAULT_MESSAGE_CAP,
};

use crate::source::RawMessage;

/// Replies anchored on one main-timeline message, in reply-fetch order.
#[derive(Debug, Clone)]
pub struct ReplySet {
    /// Source id of the anchoring message.
    pub anchor_id: String,
    pub messages: Vec<RawMessage>,
}

/// Input to normalization: a main timeline plus expanded reply sets.
#[derive(Debug, Clone, Default)]
pub struct ThreadInput {
    /// Main-timeline messages in retrieval order.
    pub timeline: Vec<RawMessage>,
    pub replies: Vec<ReplySet>,
}

impl ThreadInput {
    pub fn message_count(&self) -> usize {
        self.timeline.len() + self.replies.iter().map(|r| r.messages.len()).sum::<usize>()
    }
}

/// Options for one normalization call.
#[derive(Debug, Clone)]
pub struct NormalizeOptions {
    pub source: SourceKind,
    pub channel_id: String,
    /// Hard cap on total messages; exceeding it is a validation error.
    pub message_cap: usize,
}

impl NormalizeOptions {
    pub fn new(source: SourceKind, channel_id: impl Into<String>) -> Self {
        Self {
            source,
            channel_id: channel_id.into(),
            message_cap: DEFAULT_MESSAGE_CAP,
        }
    }

    pub fn with_message_cap(mut self, cap: usize) -> Self {
        self.message_cap = cap;
        self
    }
}

/// Position of an entry in the deterministic merge order.
///
/// Sorting is by `(effective_ts, group, rank, sub)`: `group` is the main
/// position of the message (or of its anchor, for replies; orphan sets
/// group after all mains), `rank` separates anchors (0) from their replies
/// (1), `sub` keeps replies in fetch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    effective_ts: DateTime<Utc>,
    group: usize,
    rank: u8,
    sub: usize,
}

struct MergeEntry {
    key: SortKey,
    raw: RawMessage,
    /// Source id of the anchor, for reply entries with a present anchor.
    parent_source_id: Option<String>,
    orphaned: bool,
}

/// Merge a main timeline and its reply sets into one conversation record.
#[instrument(skip_all, fields(channel = %opts.channel_id, total = input.message_count()))]
pub fn normalize_thread(input: &ThreadInput, opts: &NormalizeOptions) -> Result<ConversationRecord> {
    let total = input.message_count();
    if total > opts.message_cap {
        return Err(LorekeeperError::validation(format!(
            "input of {total} messages exceeds cap {} (refusing to truncate)",
            opts.message_cap
        )));
    }

    // Main-timeline retrieval positions and timestamps, keyed by source id.
    let mut main_pos: HashMap<&str, usize> = HashMap::new();
    let mut main_ts: HashMap<&str, DateTime<Utc>> = HashMap::new();
    for (pos, msg) in input.timeline.iter().enumerate() {
        if main_pos.insert(msg.id.as_str(), pos).is_some() {
            return Err(LorekeeperError::validation(format!(
                "duplicate message id in timeline: {}",
                msg.id
            )));
        }
        main_ts.insert(msg.id.as_str(), msg.timestamp()?);
    }

    let mut entries: Vec<MergeEntry> = Vec::with_capacity(total);

    for (pos, msg) in input.timeline.iter().enumerate() {
        entries.push(MergeEntry {
            key: SortKey {
                effective_ts: msg.timestamp()?,
                group: pos,
                rank: 0,
                sub: 0,
            },
            raw: msg.clone(),
            parent_source_id: None,
            orphaned: false,
        });
    }

    // Orphan reply sets take group slots after all main messages, in
    // encounter order, so their relative placement stays deterministic.
    let mut next_orphan_group = input.timeline.len();

    for reply_set in &input.replies {
        match main_pos.get(reply_set.anchor_id.as_str()) {
            Some(&anchor_pos) => {
                let anchor_ts = main_ts[reply_set.anchor_id.as_str()];
                for (sub, reply) in reply_set.messages.iter().enumerate() {
                    let ts = reply.timestamp()?;
                    entries.push(MergeEntry {
                        key: SortKey {
                            effective_ts: ts.max(anchor_ts),
                            group: anchor_pos,
                            rank: 1,
                            sub,
                        },
                        raw: reply.clone(),
                        parent_source_id: Some(reply_set.anchor_id.clone()),
                        orphaned: false,
                    });
                }
            }
            None => {
                warn!(
                    anchor = %reply_set.anchor_id,
                    count = reply_set.messages.len(),
                    "reply anchor missing from input, attaching replies as top-level"
                );
                let group = next_orphan_group;
                next_orphan_group += 1;
                for (sub, reply) in reply_set.messages.iter().enumerate() {
                    entries.push(MergeEntry {
                        key: SortKey {
                            effective_ts: reply.timestamp()?,
                            group,
                            rank: 0,
                            sub,
                        },
                        raw: reply.clone(),
                        parent_source_id: None,
                        orphaned: true,
                    });
                }
            }
        }
    }

    entries.sort_by(|a, b| a.key.cmp(&b.key));

    // Single walk: assign idx in merge order, resolve parents through the
    // source-id lookup built as we go. Anchors always sort before their
    // replies, so the lookup never misses.
    let mut record =
        ConversationRecord::with_message_cap(opts.source, opts.channel_id.clone(), opts.message_cap);
    let mut assigned: HashMap<String, usize> = HashMap::with_capacity(entries.len());

    for entry in entries {
        let parent_idx = match &entry.parent_source_id {
            Some(anchor_id) => assigned.get(anchor_id).copied(),
            None => None,
        };

        let mut metadata = serde_json::Map::new();
        if entry.orphaned {
            metadata.insert("orphaned".into(), serde_json::Value::Bool(true));
        }

        let message = Message {
            id: entry.raw.id.clone(),
            author_id: entry.raw.author_id.clone(),
            author_name: entry.raw.author_name.clone(),
            content: entry.raw.text.clone(),
            timestamp: entry.raw.timestamp()?,
            is_redacted: false,
            metadata,
        };

        let idx = record.push(message, parent_idx)?;
        if assigned.insert(entry.raw.id, idx).is_some() {
            return Err(LorekeeperError::validation(format!(
                "duplicate message id across timeline and replies at idx {idx}"
            )));
        }
    }

    debug!(messages = record.len(), "normalized conversation record");
    Ok(record)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
