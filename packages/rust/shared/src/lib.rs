//! Shared types, error model, and configuration for lorekeeper.
//!
//! This crate is the foundation depended on by all other lorekeeper crates.
//! It provides:
//! - [`LorekeeperError`] — the unified error type
//! - Domain types ([`ConversationRecord`], [`ExtractionResult`],
//!   [`MatchDecision`], [`GeneratedDocument`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BridgeConfig, CorpusConfig, DefaultsConfig, PipelineConfig, SourceConfig,
    config_dir, config_file_path, expand_home, init_config, ledger_path, load_config,
    load_config_from, validate_source_token,
};
pub use error::{LorekeeperError, Result};
pub use retry::RetryPolicy;
pub use types::{
    ConversationRecord, DEFAULT_MESSAGE_CAP, DocMetadata, ExistingDocument, ExtractionResult,
    GeneratedDocument, IndexedMessage, KbCategory, MatchAction, MatchDecision, Message, RecordId,
    RunId, SourceKind, TargetDocument, slugify,
};
