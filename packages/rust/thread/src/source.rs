//! Conversation-source collaborator client.
//!
//! Fetches main-timeline messages and per-thread reply sets over HTTP,
//! honoring the source's externally-imposed limits: at most 100 messages
//! per fetch, and exponential backoff (1s, 2s, 4s, ...) on rate-limit
//! signals.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use lorekeeper_shared::{LorekeeperError, Result, RetryPolicy, SourceConfig};

/// User-Agent string for source API requests.
const USER_AGENT: &str = concat!("lorekeeper/", env!("CARGO_PKG_VERSION"));

/// Hard ceiling the source imposes on messages per fetch.
pub const MAX_MESSAGES_PER_FETCH: usize = 100;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A raw message as returned by the conversation source, before
/// normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    /// Source message identifier (the dotted timestamp doubles as the id).
    pub id: String,
    pub author_id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    pub text: String,
    /// Dotted source timestamp, e.g. `1234567890.123456`.
    pub ts: String,
    /// Number of replies anchored on this message, if any.
    #[serde(default)]
    pub reply_count: usize,
}

impl RawMessage {
    /// Parsed posting time.
    pub fn timestamp(&self) -> Result<DateTime<Utc>> {
        parse_source_timestamp(&self.ts)
    }
}

/// Inclusive time range for a timeline fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchRange {
    pub oldest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

/// The conversation-source collaborator.
///
/// The normalizer's caller uses this to retrieve a main timeline and, for
/// each message that anchors a thread, its ordered reply set.
pub trait ConversationSource {
    /// Fetch up to `limit` main-timeline messages for a channel.
    ///
    /// `limit` is clamped to [`MAX_MESSAGES_PER_FETCH`].
    async fn fetch_timeline(
        &self,
        channel_id: &str,
        range: FetchRange,
        limit: usize,
    ) -> Result<Vec<RawMessage>>;

    /// Fetch the ordered reply set anchored on `anchor_id`.
    async fn fetch_replies(&self, channel_id: &str, anchor_id: &str) -> Result<Vec<RawMessage>>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// HTTP client for a chat-platform conversation source.
pub struct ChatApiClient {
    client: Client,
    api_base: Url,
    token: String,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<RawMessage>,
}

impl ChatApiClient {
    /// Build a client from config; the API token comes from the configured
    /// env var and is never persisted.
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env).map_err(|_| {
            LorekeeperError::config(format!(
                "conversation source token not found. Set the {} environment variable.",
                config.token_env
            ))
        })?;

        let api_base = Url::parse(&config.api_base)
            .map_err(|e| LorekeeperError::config(format!("invalid source api_base: {e}")))?;

        Self::new(api_base, token, RetryPolicy::standard().with_max_retries(config.max_retries))
    }

    /// Build a client against an explicit base URL (used by tests).
    pub fn new(mut api_base: Url, token: String, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LorekeeperError::Network(format!("failed to build HTTP client: {e}")))?;

        // Url::join treats a base without a trailing slash as a file and
        // would drop the last path segment
        if !api_base.path().ends_with('/') {
            let path = format!("{}/", api_base.path());
            api_base.set_path(&path);
        }

        Ok(Self {
            client,
            api_base,
            token,
            retry,
        })
    }

    /// GET an API method with rate-limit backoff.
    #[instrument(skip_all, fields(method = method))]
    async fn get_with_backoff(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<RawMessage>> {
        let url = self
            .api_base
            .join(method)
            .map_err(|e| LorekeeperError::Network(format!("invalid method url: {e}")))?;

        let mut attempt: u32 = 0;
        loop {
            match self.get_once(&url, query).await {
                Err(LorekeeperError::RateLimited { .. }) if self.retry.allows(attempt) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "source rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn get_once(&self, url: &Url, query: &[(&str, String)]) -> Result<Vec<RawMessage>> {
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| LorekeeperError::Network(format!("{url}: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(LorekeeperError::RateLimited { retry_after_secs });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LorekeeperError::Permission(format!(
                "{url}: HTTP {status}"
            )));
        }

        if !status.is_success() {
            return Err(LorekeeperError::Network(format!("{url}: HTTP {status}")));
        }

        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| LorekeeperError::Network(format!("{url}: invalid response: {e}")))?;

        if !body.ok {
            let error = body.error.unwrap_or_else(|| "unknown".into());
            // The source also signals rate limits in-band
            if error == "ratelimited" {
                return Err(LorekeeperError::RateLimited { retry_after_secs: 1 });
            }
            return Err(LorekeeperError::Network(format!("{url}: {error}")));
        }

        debug!(count = body.messages.len(), "fetched messages");
        Ok(body.messages)
    }
}

impl ChatApiClient {
    /// Fetch one whole thread by its anchor id: the anchor message plus
    /// its ordered replies.
    pub async fn fetch_thread(
        &self,
        channel_id: &str,
        anchor_id: &str,
    ) -> Result<(RawMessage, Vec<RawMessage>)> {
        let query = vec![
            ("channel", channel_id.to_string()),
            ("ts", anchor_id.to_string()),
            ("limit", MAX_MESSAGES_PER_FETCH.to_string()),
        ];

        let messages = self.get_with_backoff("conversations.replies", &query).await?;
        let mut anchor = None;
        let mut replies = Vec::new();
        for message in messages {
            if message.id == anchor_id && anchor.is_none() {
                anchor = Some(message);
            } else {
                replies.push(message);
            }
        }

        let anchor = anchor.ok_or_else(|| {
            LorekeeperError::validation(format!("thread anchor {anchor_id} not found in channel"))
        })?;
        Ok((anchor, replies))
    }
}

impl ConversationSource for ChatApiClient {
    async fn fetch_timeline(
        &self,
        channel_id: &str,
        range: FetchRange,
        limit: usize,
    ) -> Result<Vec<RawMessage>> {
        let limit = limit.min(MAX_MESSAGES_PER_FETCH);
        let mut query = vec![
            ("channel", channel_id.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(oldest) = range.oldest {
            query.push(("oldest", format_source_timestamp(oldest)));
        }
        if let Some(latest) = range.latest {
            query.push(("latest", format_source_timestamp(latest)));
        }

        self.get_with_backoff("conversations.history", &query).await
    }

    async fn fetch_replies(&self, channel_id: &str, anchor_id: &str) -> Result<Vec<RawMessage>> {
        let query = vec![
            ("channel", channel_id.to_string()),
            ("ts", anchor_id.to_string()),
            ("limit", MAX_MESSAGES_PER_FETCH.to_string()),
        ];

        let mut messages = self.get_with_backoff("conversations.replies", &query).await?;
        // The replies endpoint echoes the anchor as the first element
        messages.retain(|m| m.id != anchor_id);
        Ok(messages)
    }
}

// ---------------------------------------------------------------------------
// Permalinks & timestamps
// ---------------------------------------------------------------------------

/// Parsed thread permalink components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPermalink {
    pub workspace: String,
    pub channel_id: String,
    /// Dotted thread timestamp, e.g. `1234567890.123456`.
    pub thread_ts: String,
}

/// Parse a thread permalink to extract channel and anchor timestamp.
///
/// `https://myworkspace.chat.example/archives/C123ABC456/p1234567890123456`
/// yields channel `C123ABC456` and thread_ts `1234567890.123456` (the raw
/// form carries 10 digits before the implied decimal point and 6 after).
pub fn parse_permalink(permalink: &str) -> Result<ParsedPermalink> {
    static PERMALINK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^https://([^./]+)\.[^/]+/archives/([A-Z0-9]+)/p(\d{16})$")
            .expect("valid regex")
    });

    let captures = PERMALINK_RE.captures(permalink).ok_or_else(|| {
        LorekeeperError::validation(format!("invalid thread permalink: {permalink}"))
    })?;

    let raw_ts = &captures[3];
    Ok(ParsedPermalink {
        workspace: captures[1].to_string(),
        channel_id: captures[2].to_string(),
        thread_ts: format!("{}.{}", &raw_ts[..10], &raw_ts[10..]),
    })
}

/// Parse a dotted source timestamp (`1234567890.123456`) into UTC time.
pub fn parse_source_timestamp(ts: &str) -> Result<DateTime<Utc>> {
    let (secs, micros) = ts
        .split_once('.')
        .ok_or_else(|| LorekeeperError::validation(format!("invalid source timestamp: {ts}")))?;

    let secs: i64 = secs
        .parse()
        .map_err(|_| LorekeeperError::validation(format!("invalid source timestamp: {ts}")))?;
    let micros: u32 = micros
        .parse()
        .map_err(|_| LorekeeperError::validation(format!("invalid source timestamp: {ts}")))?;

    Utc.timestamp_opt(secs, micros * 1_000)
        .single()
        .ok_or_else(|| LorekeeperError::validation(format!("source timestamp out of range: {ts}")))
}

/// Format UTC time as a dotted source timestamp.
fn format_source_timestamp(ts: DateTime<Utc>) -> String {
    format!("{}.{:06}", ts.timestamp(), ts.timestamp_subsec_micros())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
