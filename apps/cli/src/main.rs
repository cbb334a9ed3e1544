//! lorekeeper CLI — turn team conversations into a living knowledge base.
//!
//! Fetches conversation threads, decides whether they create or enrich
//! knowledge base documents, and assembles the result into a single
//! reviewable change proposal.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
