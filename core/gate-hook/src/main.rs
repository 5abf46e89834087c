//! gate-hook: advice dedupe gate for coding-assistant hooks.
//!
//! Decides whether a candidate piece of advice should be shown, and remembers
//! what was shown so the same advice isn't repeated across a session tree.
//!
//! ## Subcommands
//!
//! - `serve`: long-lived request/response loop over stdin/stdout
//! - `check`: one-shot suppression decision (optionally recording the emission)
//! - `record`: one-shot emission record
//! - `config`: effective config and load warnings
//! - `lineage`: parsed lineage and scope key for a session identity
//!
//! Internal failures are logged and never turn into a non-zero exit: a broken
//! gate must not block the host from running.

mod commands;
mod logging;
mod protocol;
mod serve;

use std::io;

use clap::{Parser, Subcommand};
use gate_core::{AdviceGate, ConfigSource, DedupeMode};

use commands::AdviceArgs;

#[derive(Parser)]
#[command(name = "gate-hook")]
#[command(about = "Advice dedupe gate for session hooks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer newline-delimited JSON requests on stdin until EOF
    Serve {
        /// Seconds between config file re-reads
        #[arg(long, value_name = "SECS")]
        refresh_secs: Option<u64>,
    },

    /// Decide whether a piece of advice should be suppressed
    Check {
        #[command(flatten)]
        advice: AdviceArgs,

        /// Record the emission when the advice is not suppressed
        #[arg(long)]
        record: bool,
    },

    /// Record that a piece of advice was shown
    Record {
        #[command(flatten)]
        advice: AdviceArgs,
    },

    /// Print the effective config and any load warnings
    Config,

    /// Print the lineage and scope key for a session identity
    Lineage {
        /// Session identity (e.g. root:subagent:reviewer)
        #[arg(value_name = "IDENTITY")]
        identity: String,

        /// Scope mode (defaults to the configured mode)
        #[arg(long)]
        mode: Option<DedupeMode>,

        #[arg(long)]
        intent: Option<String>,

        #[arg(long)]
        phase: Option<String>,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { refresh_secs } => match serve::run(refresh_secs) {
            Ok(summary) => tracing::info!(
                handled = summary.handled,
                rejected = summary.rejected,
                "gate-hook serve finished"
            ),
            Err(e) => tracing::error!(error = %e, "gate-hook serve failed"),
        },
        Commands::Check { advice, record } => {
            let result = standard_gate()
                .and_then(|gate| commands::check(&gate, &advice, record, io::stdout()));
            if let Err(e) = result {
                tracing::error!(error = %e, "gate-hook check failed");
            }
        }
        Commands::Record { advice } => {
            let result =
                standard_gate().and_then(|gate| commands::record(&gate, &advice, io::stdout()));
            if let Err(e) = result {
                tracing::error!(error = %e, "gate-hook record failed");
            }
        }
        Commands::Config => {
            if let Err(e) = commands::config(ConfigSource::standard(), io::stdout()) {
                tracing::error!(error = %e, "gate-hook config failed");
            }
        }
        Commands::Lineage {
            identity,
            mode,
            intent,
            phase,
        } => {
            let mode = mode.unwrap_or_else(|| gate_core::config::global().current().mode);
            let result = commands::lineage(
                &identity,
                mode,
                intent.as_deref(),
                phase.as_deref(),
                io::stdout(),
            );
            if let Err(e) = result {
                tracing::error!(error = %e, "gate-hook lineage failed");
            }
        }
    }
}

fn standard_gate() -> Result<AdviceGate, commands::CommandError> {
    Ok(AdviceGate::standard()?)
}
