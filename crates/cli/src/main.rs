// Copyright (C) 2024 Red Hat
// SPDX-License-Identifier: Apache-2.0

//! This module is the entrypoint of the tokengate command line.

use anyhow::Result;
use clap::{Parser, Subcommand};

use tokengate_engine::{ensure_default_rules, RuleEngine, Settings};
use tokengate_ledger::Ledger;

#[derive(Parser)]
#[clap(version, about, long_about = None)]
#[clap(disable_help_subcommand = true)]
struct Cli {
    #[clap(long, help = "Show debug logs")]
    debug: bool,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[clap(about = "Sanitize a text for a session")]
    Sanitize { session: String, text: String },

    #[clap(about = "Reconcile provider output for a session")]
    Reconcile { session: String, text: String },

    #[clap(about = "Validate the ruleset on disk")]
    Validate,

    #[clap(about = "Drop the token mappings of a session")]
    Purge { session: String },
}

fn setup_logging(debug: bool) {
    let filter = if debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    setup_logging(args.debug);

    let settings = Settings::from_env();
    ensure_default_rules(&settings)?;
    let pool = tokengate_ledger::connect(&settings.db_path).await?;
    let ledger = Ledger::new(pool, &settings.token_secret, settings.token_ttl_days).await?;
    let engine = RuleEngine::new(settings, ledger.clone())?;

    match args.command {
        Commands::Sanitize { session, text } => {
            let result = engine.sanitize(&session, &text).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Reconcile { session, text } => {
            let result = engine.reconcile(&session, &text).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Validate => {
            let validation = engine.validate();
            println!("{}", serde_json::to_string_pretty(&validation)?);
            if !validation.ok {
                std::process::exit(1);
            }
        }
        Commands::Purge { session } => {
            ledger.delete_session(&session).await?;
            tracing::info!(session, "token mappings removed");
            println!("{}", serde_json::json!({"ok": true, "session_id": session}));
        }
    }
    Ok(())
}
