//! CLI command definitions, routing, and tracing setup.

use std::io::Read;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use lorekeeper_core::pipeline::{
    ProcessRunConfig, ProcessRunResult, ProgressReporter, process_records,
};
use lorekeeper_core::query::{QueryOutcome, answer_query};
use lorekeeper_corpus::{ChangeSet, CorpusSnapshot, LocalSink, ProposalSink};
use lorekeeper_reasoning::BridgeReasoner;
use lorekeeper_shared::{
    AppConfig, ConversationRecord, Message, PipelineConfig, SourceKind, config_file_path,
    expand_home, init_config, ledger_path, load_config, validate_source_token,
};
use lorekeeper_storage::Ledger;
use lorekeeper_thread::{
    ChatApiClient, ConversationSource, FetchRange, NormalizeOptions, PatternRedactor, ReplySet,
    ThreadInput, normalize_thread, parse_permalink,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// lorekeeper — turn team conversations into a living knowledge base.
#[derive(Parser)]
#[command(
    name = "lorekeeper",
    version,
    about = "Distill team conversations into a reviewable, living knowledge base.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process chat messages into knowledge base changes.
    Process {
        /// Channel ID to process (defaults to the configured channel).
        #[arg(long)]
        channel: Option<String>,

        /// Thread permalink to process instead of a channel window.
        #[arg(long, conflicts_with = "channel")]
        thread: Option<String>,

        /// Start of the time window (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        from: Option<String>,

        /// End of the time window (YYYY-MM-DD or RFC 3339).
        #[arg(long)]
        to: Option<String>,

        /// Maximum messages to fetch (capped at 100 by the source).
        #[arg(long, default_value = "100")]
        limit: usize,

        /// Decide and report, but do not submit a change proposal.
        #[arg(long)]
        dry_run: bool,
    },

    /// Process free text (a file, or stdin with `-`) into the KB.
    Text {
        /// Path to a text file, or `-` for stdin.
        input: String,

        /// Title hint for the conversation.
        #[arg(long)]
        title: Option<String>,

        /// Decide and report, but do not submit a change proposal.
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask the knowledge base a question.
    Query {
        /// The question to answer from the KB.
        question: String,
    },

    /// List recorded processing runs.
    Runs {
        /// Maximum number of runs to show.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Print the config file path.
    Path,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "lorekeeper=info",
        1 => "lorekeeper=debug",
        _ => "lorekeeper=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Process {
            channel,
            thread,
            from,
            to,
            limit,
            dry_run,
        } => {
            cmd_process(
                channel.as_deref(),
                thread.as_deref(),
                from.as_deref(),
                to.as_deref(),
                limit,
                dry_run,
            )
            .await
        }
        Command::Text {
            input,
            title,
            dry_run,
        } => cmd_text(&input, title.as_deref(), dry_run).await,
        Command::Query { question } => cmd_query(&question).await,
        Command::Runs { limit } => cmd_runs(limit).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
            ConfigAction::Path => cmd_config_path().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Process command
// ---------------------------------------------------------------------------

async fn cmd_process(
    channel: Option<&str>,
    thread: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
    limit: usize,
    dry_run: bool,
) -> Result<()> {
    let config = load_config()?;
    validate_source_token(&config)?;

    let client = ChatApiClient::from_config(&config.source)?;
    let reporter = CliProgress::new();

    // --- Fetch the conversation ---
    reporter.phase("Fetching conversation");
    let (channel_id, input) = if let Some(permalink) = thread {
        let parsed = parse_permalink(permalink)?;
        let (anchor, replies) = client
            .fetch_thread(&parsed.channel_id, &parsed.thread_ts)
            .await?;
        let anchor_id = anchor.id.clone();
        (
            parsed.channel_id,
            ThreadInput {
                timeline: vec![anchor],
                replies: vec![ReplySet {
                    anchor_id,
                    messages: replies,
                }],
            },
        )
    } else {
        let channel_id = channel
            .map(String::from)
            .or_else(|| {
                (!config.source.default_channel.is_empty())
                    .then(|| config.source.default_channel.clone())
            })
            .ok_or_else(|| eyre!("no channel given and no default_channel configured"))?;

        let range = FetchRange {
            oldest: from.map(parse_time_flag).transpose()?,
            latest: to.map(parse_time_flag).transpose()?,
        };
        let timeline = client.fetch_timeline(&channel_id, range, limit).await?;

        let mut replies = Vec::new();
        for message in timeline.iter().filter(|m| m.reply_count > 0) {
            let set = client.fetch_replies(&channel_id, &message.id).await?;
            if !set.is_empty() {
                replies.push(ReplySet {
                    anchor_id: message.id.clone(),
                    messages: set,
                });
            }
        }
        (channel_id, ThreadInput { timeline, replies })
    };

    if input.message_count() == 0 {
        reporter.finish();
        println!("No messages found in the requested range; nothing to do.");
        return Ok(());
    }

    info!(
        channel = %channel_id,
        messages = input.message_count(),
        "fetched conversation"
    );

    // --- Normalize ---
    let opts = NormalizeOptions::new(SourceKind::Chat, channel_id)
        .with_message_cap(config.defaults.message_cap);
    let record = normalize_thread(&input, &opts)?;

    run_pipeline(&config, vec![record], dry_run, reporter).await
}

// ---------------------------------------------------------------------------
// Text command
// ---------------------------------------------------------------------------

async fn cmd_text(input: &str, title: Option<&str>, dry_run: bool) -> Result<()> {
    let config = load_config()?;

    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(input).map_err(|e| eyre!("cannot read '{input}': {e}"))?
    };

    if text.trim().is_empty() {
        println!("Input is empty; nothing to do.");
        return Ok(());
    }

    // A single synthetic message carries the whole text
    let mut record = ConversationRecord::with_message_cap(
        SourceKind::Text,
        title.unwrap_or("text-input"),
        config.defaults.message_cap,
    );
    record.push(
        Message {
            id: "text-input-0".into(),
            author_id: "text-input".into(),
            author_name: None,
            content: text,
            timestamp: Utc::now(),
            is_redacted: false,
            metadata: serde_json::Map::new(),
        },
        None,
    )?;

    let reporter = CliProgress::new();
    run_pipeline(&config, vec![record], dry_run, reporter).await
}

// ---------------------------------------------------------------------------
// Shared pipeline driver
// ---------------------------------------------------------------------------

async fn run_pipeline(
    config: &AppConfig,
    records: Vec<ConversationRecord>,
    dry_run: bool,
    reporter: CliProgress,
) -> Result<()> {
    // --- Snapshot, ledger, bridge ---
    reporter.phase("Loading existing knowledge base");
    let corpus_root = expand_home(&config.corpus.root);
    let snapshot = if corpus_root.exists() {
        CorpusSnapshot::load(&corpus_root)?
    } else {
        info!(root = %corpus_root.display(), "corpus root missing, starting empty");
        CorpusSnapshot::default()
    };

    let ledger = Ledger::open(&ledger_path()?).await?;

    reporter.phase("Starting reasoning bridge");
    let mut reasoner = BridgeReasoner::spawn(&config.bridge)?;

    let run_config = ProcessRunConfig {
        pipeline: PipelineConfig::from(config),
        model: config.bridge.model.clone(),
    };

    // --- Process ---
    let result = process_records(
        &records,
        &snapshot,
        &mut reasoner,
        &PatternRedactor::new(),
        &run_config,
        Some(&ledger),
        &reporter,
    )
    .await?;

    reasoner.shutdown()?;

    // --- Ledger bookkeeping ---
    ledger
        .insert_run(&result.run_id.to_string(), records.len() as u32)
        .await?;
    for outcome in &result.outcomes {
        ledger
            .insert_outcome(
                &result.run_id.to_string(),
                &outcome.record_id.to_string(),
                if outcome.failed { "failed" } else { outcome.action.as_str() },
                outcome.confidence,
                outcome.target_path.as_deref(),
                outcome.fallback,
                outcome.note.as_deref(),
            )
            .await?;
    }

    // --- Submit proposal ---
    let proposal = if result.documents.is_empty() || dry_run {
        None
    } else {
        reporter.phase("Assembling change proposal");
        let change_set = ChangeSet::assemble(
            result.run_id.clone(),
            &config.corpus.branch_prefix,
            result.documents.clone(),
        )?;
        let sink = LocalSink::new(expand_home(&config.corpus.proposal_root));
        Some(sink.submit(&change_set)?)
    };

    let status = if result.counts.failed > 0 {
        "completed_with_errors"
    } else {
        "completed"
    };
    ledger
        .finish_run(
            &result.run_id.to_string(),
            status,
            &result.counts,
            proposal.as_ref().map(|p| p.id.as_str()),
        )
        .await?;

    reporter.finish();
    print_summary(&result, dry_run, proposal.as_ref().map(|p| p.location.as_str()));
    Ok(())
}

fn print_summary(result: &ProcessRunResult, dry_run: bool, proposal: Option<&str>) {
    println!();
    println!("  Processing run {}", result.run_id);
    println!(
        "  Records: {} ({} created, {} updated, {} appended, {} replaced, {} ignored, {} failed)",
        result.outcomes.len(),
        result.counts.created,
        result.counts.updated,
        result.counts.appended,
        result.counts.replaced,
        result.counts.ignored,
        result.counts.failed,
    );
    for outcome in &result.outcomes {
        let target = outcome.target_path.as_deref().unwrap_or("-");
        let marker = if outcome.fallback { " (fallback)" } else { "" };
        println!(
            "    {:<8} {:.2}  {}{}",
            outcome.action, outcome.confidence, target, marker
        );
    }
    match proposal {
        Some(location) => println!("  Proposal: {location}"),
        None if dry_run => println!("  Dry run: no proposal submitted."),
        None => println!("  No documents generated; no proposal needed."),
    }
    println!("  Time: {:.1}s", result.elapsed.as_secs_f64());
    println!();
}

// ---------------------------------------------------------------------------
// Query command
// ---------------------------------------------------------------------------

async fn cmd_query(question: &str) -> Result<()> {
    let config = load_config()?;

    let corpus_root = expand_home(&config.corpus.root);
    let snapshot = CorpusSnapshot::load(&corpus_root)?;

    let mut reasoner = BridgeReasoner::spawn(&config.bridge)?;
    let outcome = answer_query(&mut reasoner, question, snapshot.documents());
    reasoner.shutdown()?;

    match outcome {
        QueryOutcome::Answer { text, citations } => {
            println!();
            println!("{text}");
            println!();
            println!("Sources:");
            for path in citations {
                println!("  - {path}");
            }
        }
        QueryOutcome::NoInformation => {
            println!("No information available in the knowledge base for that question.");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Runs command
// ---------------------------------------------------------------------------

async fn cmd_runs(limit: u32) -> Result<()> {
    let ledger = Ledger::open(&ledger_path()?).await?;
    let runs = ledger.list_runs(limit).await?;

    if runs.is_empty() {
        println!("No processing runs recorded yet.");
        return Ok(());
    }

    for run in runs {
        let proposal = run.proposal_id.as_deref().unwrap_or("-");
        println!(
            "{}  {}  {:<22}  c:{} u:{} a:{} r:{} i:{} f:{}  {}",
            run.started_at,
            run.id,
            run.status,
            run.counts.created,
            run.counts.updated,
            run.counts.appended,
            run.counts.replaced,
            run.counts.ignored,
            run.counts.failed,
            proposal,
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config commands
// ---------------------------------------------------------------------------

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Created {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config = load_config()?;
    let rendered = toml::to_string_pretty(&config).map_err(|e| eyre!("render config: {e}"))?;
    println!("{rendered}");
    Ok(())
}

async fn cmd_config_path() -> Result<()> {
    println!("{}", config_file_path()?.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn task_progress(&self, current: usize, total: usize, detail: &str) {
        self.spinner
            .set_message(format!("[{current}/{total}] {detail}"));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a `--from`/`--to` flag: a plain date or a full RFC 3339 timestamp.
fn parse_time_flag(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = date.and_hms_opt(0, 0, 0).expect("valid midnight");
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    Err(eyre!("invalid time '{raw}': use YYYY-MM-DD or RFC 3339"))
}
