//! On-disk locations.
//!
//! Everything lives under `~/.advice-gate/` (override with `ADVICE_GATE_HOME`).
//! We never write into the host's own config directory.

use std::env;
use std::path::PathBuf;

use crate::error::{GateError, Result};

const STATE_DIR_NAME: &str = ".advice-gate";
const CONFIG_FILE_NAME: &str = "config.json";
const DEDUPE_LOG_NAME: &str = "advice-dedupe.jsonl";
const LOG_DIR_NAME: &str = "logs";

pub const HOME_ENV: &str = "ADVICE_GATE_HOME";
pub const CONFIG_ENV: &str = "ADVICE_GATE_CONFIG";

pub fn state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    dirs::home_dir()
        .map(|home| home.join(STATE_DIR_NAME))
        .ok_or(GateError::HomeDirNotFound)
}

pub fn default_config_path() -> Result<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    Ok(state_dir()?.join(CONFIG_FILE_NAME))
}

pub fn default_dedupe_log_path() -> Result<PathBuf> {
    Ok(state_dir()?.join(DEDUPE_LOG_NAME))
}

pub fn default_log_dir() -> Result<PathBuf> {
    Ok(state_dir()?.join(LOG_DIR_NAME))
}
