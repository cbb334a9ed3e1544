//! Conversation intake: source client, thread normalization, redaction.
//!
//! This crate provides:
//! - [`source`] — the conversation-source collaborator (HTTP client,
//!   permalink parsing, rate-limit backoff)
//! - [`normalize`] — merging a main timeline with expanded reply threads
//!   into one index-stable [`ConversationRecord`]
//! - [`redact`] — the redaction boundary crossed before any further
//!   processing
//!
//! [`ConversationRecord`]: lorekeeper_shared::ConversationRecord

pub mod normalize;
pub mod redact;
pub mod source;

pub use normalize::{NormalizeOptions, ReplySet, ThreadInput, normalize_thread};
pub use redact::{PatternRedactor, Redactor};
pub use source::{ChatApiClient, ConversationSource, FetchRange, ParsedPermalink, RawMessage,
    parse_permalink, parse_source_timestamp};
