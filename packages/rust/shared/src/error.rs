//! Error types for lorekeeper.
//!
//! Library crates use [`LorekeeperError`] via `thiserror`.
//! The CLI app wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all lorekeeper operations.
#[derive(Debug, thiserror::Error)]
pub enum LorekeeperError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Malformed or oversized input. Fail closed, reported to the caller.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Network/HTTP error while talking to the conversation source.
    #[error("network error: {0}")]
    Network(String),

    /// The conversation source signalled a rate limit.
    /// Retried with backoff; surfaced only after the retry budget is spent.
    #[error("rate limited by conversation source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    /// A reasoning call exceeded its per-batch timeout.
    /// Isolated per item; each stage applies its documented fallback.
    #[error("reasoning timeout: {0}")]
    ReasoningTimeout(String),

    /// The reasoning capability returned an out-of-schema result.
    /// Treated exactly like a timeout: conservative fallback, never an abort.
    #[error("reasoning schema error: {0}")]
    ReasoningSchema(String),

    /// Reasoning bridge transport error (spawn, I/O, protocol).
    #[error("reasoning error: {0}")]
    Reasoning(String),

    /// Database or run-ledger error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Change-proposal naming collision at the sink.
    /// Retried once with a regenerated identifier.
    #[error("sink conflict: {0}")]
    SinkConflict(String),

    /// Authentication/permission failure. Never retried, always surfaced.
    #[error("permission error: {0}")]
    Permission(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LorekeeperError>;

impl LorekeeperError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry with backoff could succeed.
    ///
    /// Only rate limits and reasoning timeouts qualify; everything else
    /// resolves immediately through the caller's documented fallback.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::ReasoningTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LorekeeperError::config("missing source token");
        assert_eq!(err.to_string(), "config error: missing source token");

        let err = LorekeeperError::validation("message cap 100 exceeded (got 142)");
        assert!(err.to_string().contains("100 exceeded"));
    }

    #[test]
    fn transient_classification() {
        assert!(LorekeeperError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(LorekeeperError::ReasoningTimeout("batch 2".into()).is_transient());

        assert!(!LorekeeperError::ReasoningSchema("bad category".into()).is_transient());
        assert!(!LorekeeperError::Permission("token rejected".into()).is_transient());
        assert!(!LorekeeperError::validation("empty record").is_transient());
    }
}
