//! Application configuration for lorekeeper.
//!
//! User config lives at `~/.lorekeeper/lorekeeper.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LorekeeperError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "lorekeeper.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".lorekeeper";

/// File name of the run-ledger database inside the config directory.
const LEDGER_FILE_NAME: &str = "ledger.db";

// ---------------------------------------------------------------------------
// Config structs (matching lorekeeper.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Pipeline defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Conversation source settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Reasoning bridge settings.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Corpus checkout and proposal sink settings.
    #[serde(default)]
    pub corpus: CorpusConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Maximum messages per conversation record (hard cap, fail closed).
    #[serde(default = "default_message_cap")]
    pub message_cap: usize,

    /// Items per batched reasoning call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum shortlist size handed to the arbiter.
    #[serde(default = "default_shortlist_max")]
    pub shortlist_max: usize,

    /// Minimum prefilter score for a shortlist candidate.
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    /// Extraction confidence below which the arbiter biases toward Ignore.
    #[serde(default = "default_confidence_gate")]
    pub confidence_gate: f64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            message_cap: default_message_cap(),
            batch_size: default_batch_size(),
            shortlist_max: default_shortlist_max(),
            min_score: default_min_score(),
            confidence_gate: default_confidence_gate(),
        }
    }
}

fn default_message_cap() -> usize {
    crate::types::DEFAULT_MESSAGE_CAP
}
fn default_batch_size() -> usize {
    4
}
fn default_shortlist_max() -> usize {
    30
}
fn default_min_score() -> f64 {
    0.1
}
fn default_confidence_gate() -> f64 {
    0.6
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the conversation source API.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Name of the env var holding the API token (never store the token itself).
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Default channel to process when none is given.
    #[serde(default)]
    pub default_channel: String,

    /// Retry budget for rate-limited fetches.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token_env: default_token_env(),
            default_channel: String::new(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_api_base() -> String {
    "https://chat.example.com/api".into()
}
fn default_token_env() -> String {
    "LOREKEEPER_SOURCE_TOKEN".into()
}
fn default_max_retries() -> u32 {
    3
}

/// `[bridge]` section: the reasoning-bridge subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bridge command (e.g., "bun").
    #[serde(default = "default_bridge_cmd")]
    pub cmd: String,

    /// Bridge script path.
    #[serde(default = "default_bridge_script")]
    pub script: String,

    /// Working directory for the bridge subprocess.
    #[serde(default = "default_bridge_workdir")]
    pub working_dir: String,

    /// Model ID the bridge should use.
    #[serde(default = "default_model")]
    pub model: String,

    /// Per-batch timeout in seconds, enforced by the bridge.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retry budget for transient reasoning failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cmd: default_bridge_cmd(),
            script: default_bridge_script(),
            working_dir: default_bridge_workdir(),
            model: default_model(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_bridge_cmd() -> String {
    "bun".into()
}
fn default_bridge_script() -> String {
    "bridge/reason.ts".into()
}
fn default_bridge_workdir() -> String {
    ".".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_timeout_secs() -> u64 {
    30
}

/// `[corpus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusConfig {
    /// Local checkout of the knowledge base repository.
    #[serde(default = "default_corpus_root")]
    pub root: String,

    /// Directory where change proposals are assembled.
    #[serde(default = "default_proposal_root")]
    pub proposal_root: String,

    /// Prefix for generated proposal branch names.
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            root: default_corpus_root(),
            proposal_root: default_proposal_root(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

fn default_corpus_root() -> String {
    "~/lorekeeper-kb".into()
}
fn default_proposal_root() -> String {
    "~/lorekeeper-kb/.proposals".into()
}
fn default_branch_prefix() -> String {
    "kb".into()
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub message_cap: usize,
    pub batch_size: usize,
    pub shortlist_max: usize,
    pub min_score: f64,
    pub confidence_gate: f64,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            message_cap: config.defaults.message_cap,
            batch_size: config.defaults.batch_size,
            shortlist_max: config.defaults.shortlist_max,
            min_score: config.defaults.min_score,
            confidence_gate: config.defaults.confidence_gate,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.lorekeeper/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LorekeeperError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.lorekeeper/lorekeeper.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Get the path to the run-ledger database (`~/.lorekeeper/ledger.db`).
pub fn ledger_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(LEDGER_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LorekeeperError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        LorekeeperError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LorekeeperError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LorekeeperError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LorekeeperError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that the conversation-source token env var is set and non-empty.
pub fn validate_source_token(config: &AppConfig) -> Result<()> {
    let var_name = &config.source.token_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(LorekeeperError::config(format!(
            "conversation source token not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
