//! Redaction boundary.
//!
//! Every normalized record crosses this boundary before extraction.
//! [`Redactor::mask`] produces a new record with the same shape (same ids,
//! indices, and parent references) and redacted content; it never mutates
//! its input.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use lorekeeper_shared::{ConversationRecord, Result};

/// The redaction collaborator: same shape out, content redacted.
pub trait Redactor {
    fn mask(&self, record: &ConversationRecord) -> Result<ConversationRecord>;
}

// ---------------------------------------------------------------------------
// Pattern redactor
// ---------------------------------------------------------------------------

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
});
static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("valid regex"));
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+\d{1,3}[\s-]?\d{2,4}[\s-]?\d{3,4}[\s-]?\d{3,4}").expect("valid regex"));
static EMPLOYEE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[IiDd]\d{6}\b").expect("valid regex"));

/// Deterministic regex-based masker for personal and internal identifiers.
///
/// Each distinct matched value gets a stable per-record token
/// (`[EMAIL_1]`, `[IP_2]`, ...), so repeated mentions stay correlated for
/// the downstream reasoning steps. Author display names are replaced with
/// `[USER_n]` tokens in first-appearance order.
#[derive(Debug, Default)]
pub struct PatternRedactor;

impl PatternRedactor {
    pub fn new() -> Self {
        Self
    }
}

/// Per-record token table: original value -> assigned token.
struct TokenTable {
    prefix: &'static str,
    assigned: HashMap<String, String>,
}

impl TokenTable {
    fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            assigned: HashMap::new(),
        }
    }

    fn token_for(&mut self, original: &str) -> String {
        let next = self.assigned.len() + 1;
        self.assigned
            .entry(original.to_string())
            .or_insert_with(|| format!("[{}_{next}]", self.prefix))
            .clone()
    }

    fn mask_all(&mut self, re: &Regex, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in re.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            out.push_str(&self.token_for(m.as_str()));
            last = m.end();
        }
        out.push_str(&text[last..]);
        out
    }
}

impl Redactor for PatternRedactor {
    #[instrument(skip_all, fields(record = %record.id, messages = record.len()))]
    fn mask(&self, record: &ConversationRecord) -> Result<ConversationRecord> {
        let mut emails = TokenTable::new("EMAIL");
        let mut ips = TokenTable::new("IP");
        let mut phones = TokenTable::new("PHONE");
        let mut employee_ids = TokenTable::new("EMPLOYEE_ID");
        let mut users = TokenTable::new("USER");

        let mut masked = ConversationRecord::with_message_cap(
            record.source,
            record.channel_id.clone(),
            record.message_cap(),
        );
        masked.id = record.id.clone();

        let mut touched = 0usize;
        for indexed in record.messages() {
            let mut message = indexed.message.clone();

            let mut content = emails.mask_all(&EMAIL_RE, &message.content);
            content = ips.mask_all(&IPV4_RE, &content);
            content = phones.mask_all(&PHONE_RE, &content);
            content = employee_ids.mask_all(&EMPLOYEE_ID_RE, &content);

            let name_token = users.token_for(&message.author_id);
            let name_changed = message.author_name.as_deref() != Some(name_token.as_str());

            if content != message.content || name_changed {
                message.is_redacted = true;
                touched += 1;
            }
            message.content = content;
            message.author_name = Some(name_token);

            masked.push(message, indexed.parent_idx)?;
        }

        debug!(touched, "masked conversation record");
        Ok(masked)
    }
}
