//! One-shot subcommands: `check`, `record`, `config`, `lineage`.
//!
//! Each prints a single JSON document on stdout. Session state does not
//! survive between invocations, so only the global dedupe log and config
//! matter here; `serve` is the mode that keeps local windows.

use std::io::{self, Write};

use clap::Args;
use gate_core::{
    scope_key, session_lineage, unix_now, AdviceContext, AdviceGate, ConfigAuthority,
    ConfigSource, Decision, DedupeMode, GateConfig, ScopeKey, SessionLineage,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Gate unavailable: {0}")]
    Gate(#[from] gate_core::GateError),
}

/// The advice candidate shared by `check` and `record`.
#[derive(Args, Debug, Clone)]
pub struct AdviceArgs {
    /// Tool the advice is about (e.g. Edit, Bash)
    #[arg(long)]
    pub tool: String,

    /// Stable identifier of the advice text
    #[arg(long = "advice-id")]
    pub advice_id: String,

    /// Host session identity (may carry `:subagent:` segments)
    #[arg(long)]
    pub session: String,

    /// Intent family, used by contextual mode
    #[arg(long)]
    pub intent: Option<String>,

    /// Task phase, used by contextual mode
    #[arg(long)]
    pub phase: Option<String>,

    /// Multiplier for local suppression windows
    #[arg(long)]
    pub scale: Option<f64>,

    /// Override the current time (seconds since the Unix epoch)
    #[arg(long)]
    pub now: Option<f64>,
}

impl AdviceArgs {
    fn context(&self) -> AdviceContext {
        AdviceContext {
            intent_family: self.intent.clone(),
            task_phase: self.phase.clone(),
            cooldown_scale: self.scale,
        }
    }

    fn now(&self) -> f64 {
        self.now.unwrap_or_else(unix_now)
    }
}

#[derive(Debug, Serialize)]
pub struct CheckOutput {
    #[serde(flatten)]
    pub decision: Decision,
    pub recorded: bool,
}

pub fn check(
    gate: &AdviceGate,
    args: &AdviceArgs,
    record: bool,
    out: impl Write,
) -> Result<CheckOutput, CommandError> {
    let now = args.now();
    let context = args.context();
    let decision = gate.decide(&args.tool, &args.advice_id, &args.session, now, &context);

    let recorded = record && !decision.suppress;
    if recorded {
        gate.record_emitted(&args.tool, &args.advice_id, &args.session, now, &context);
    }

    let output = CheckOutput { decision, recorded };
    print_json(out, &output)?;
    Ok(output)
}

#[derive(Debug, Serialize)]
pub struct RecordOutput {
    pub scope_key: ScopeKey,
    pub ts: f64,
}

pub fn record(
    gate: &AdviceGate,
    args: &AdviceArgs,
    out: impl Write,
) -> Result<RecordOutput, CommandError> {
    let ts = args.now();
    let scope_key = gate.record_emitted(
        &args.tool,
        &args.advice_id,
        &args.session,
        ts,
        &args.context(),
    );
    let output = RecordOutput { scope_key, ts };
    print_json(out, &output)?;
    Ok(output)
}

#[derive(Debug, Serialize)]
pub struct ConfigOutput {
    pub path: Option<String>,
    pub config: GateConfig,
    pub applied: Vec<String>,
    pub ignored: Vec<String>,
    pub rejected: Vec<String>,
    pub warnings: Vec<String>,
}

/// Loads `source` fresh so its warnings can be reported alongside the result.
pub fn config(source: ConfigSource, out: impl Write) -> Result<ConfigOutput, CommandError> {
    let path = source.file.as_ref().map(|p| p.display().to_string());
    let (authority, report) = ConfigAuthority::load_from(source);
    let output = ConfigOutput {
        path,
        config: (*authority.current()).clone(),
        applied: report.applied,
        ignored: report.ignored,
        rejected: report.rejected,
        warnings: report.warnings,
    };
    print_json(out, &output)?;
    Ok(output)
}

#[derive(Debug, Serialize)]
pub struct LineageOutput {
    #[serde(flatten)]
    pub lineage: SessionLineage,
    pub mode: DedupeMode,
    pub scope_key: ScopeKey,
}

pub fn lineage(
    identity: &str,
    mode: DedupeMode,
    intent: Option<&str>,
    phase: Option<&str>,
    out: impl Write,
) -> Result<LineageOutput, CommandError> {
    let lineage = session_lineage(identity);
    let scope_key = scope_key(&lineage, mode, intent, phase);
    let output = LineageOutput {
        lineage,
        mode,
        scope_key,
    };
    print_json(out, &output)?;
    Ok(output)
}

fn print_json(mut out: impl Write, value: &impl Serialize) -> Result<(), CommandError> {
    serde_json::to_writer(&mut out, value)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
