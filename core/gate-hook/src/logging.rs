//! File logging for gate-hook.
//!
//! stdout carries protocol and command output, so diagnostics go to a daily
//! rolling file under `~/.advice-gate/logs/`. If that directory can't be
//! created we fall back to stderr rather than going silent.

use std::env;

use fs_err as fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "gate-hook.log";
const DEBUG_ENV: &str = "ADVICE_GATE_DEBUG_LOG";

/// Installs the global subscriber. Keep the returned guard alive until exit so
/// buffered lines are flushed.
pub fn init() -> Option<WorkerGuard> {
    let filter = env_filter();

    let log_dir = gate_core::paths::default_log_dir()
        .ok()
        .filter(|dir| fs::create_dir_all(dir).is_ok());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let installed = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .is_ok();
            installed.then_some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .try_init();
            None
        }
    }
}

fn debug_enabled() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn env_filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
