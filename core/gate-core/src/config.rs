//! Process-wide gate tunables.
//!
//! # Layers
//!
//! ```text
//! built-in defaults  <  config file section  <  ADVICE_GATE_* environment
//! ```
//!
//! The file is a JSON document; we read one namespaced section from it
//! (`advice_gate`, falling back to `gate` then `dedupe`):
//!
//! ```json
//! {
//!   "advice_gate": {
//!     "mode": "contextual",
//!     "cooldown_s": 300,
//!     "shown_advice_ttl_s": 120,
//!     "log_capacity": 2000
//!   }
//! }
//! ```
//!
//! Every load rebuilds the snapshot from the defaults up, so a key deleted from
//! the file reverts to its default on the next load.
//!
//! # Validation
//!
//! Every key is validated on its own. A bad value leaves that one field at its
//! prior value and adds a warning naming the key; the rest still apply. A file
//! that does not parse at all contributes nothing and produces exactly one
//! warning (and one log line). Unknown keys are ignored.
//!
//! # Snapshots
//!
//! Readers call [`ConfigAuthority::current`] and get an `Arc<GateConfig>` that
//! stays valid for as long as they hold it. Loads and reloads build a complete
//! new snapshot and swap it in with one store, so nobody ever sees a mix of old
//! and new fields.

use std::collections::BTreeMap;
use std::env;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use fs_err as fs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::GateError;
use crate::paths;
use crate::scope::DedupeMode;

pub const DEFAULT_COOLDOWN_S: f64 = 300.0;
pub const DEFAULT_SHOWN_ADVICE_TTL_S: f64 = 120.0;
pub const DEFAULT_LOG_CAPACITY: usize = 2000;

const MAX_WINDOW_S: f64 = 30.0 * 24.0 * 3600.0;
const MAX_LOG_CAPACITY: u64 = 1_000_000;

const SECTION_NAMES: [&str; 3] = ["advice_gate", "gate", "dedupe"];

const KEY_MODE: &str = "mode";
const KEY_COOLDOWN: &str = "cooldown_s";
const KEY_SHOWN_TTL: &str = "shown_advice_ttl_s";
const KEY_SHOWN_TTL_ALIAS: &str = "shown_ttl_s";
const KEY_LOG_CAPACITY: &str = "log_capacity";

const ENV_KEYS: [(&str, &str); 4] = [
    ("ADVICE_GATE_MODE", KEY_MODE),
    ("ADVICE_GATE_COOLDOWN_S", KEY_COOLDOWN),
    ("ADVICE_GATE_SHOWN_ADVICE_TTL_S", KEY_SHOWN_TTL),
    ("ADVICE_GATE_LOG_CAPACITY", KEY_LOG_CAPACITY),
];

/// One immutable set of tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateConfig {
    pub mode: DedupeMode,
    /// Minimum seconds between repeats of the same advice in the same scope.
    pub cooldown_s: f64,
    /// Length of the local per-tool suppression window opened on emission.
    pub shown_advice_ttl_s: f64,
    /// Line ceiling for the dedupe log.
    pub log_capacity: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            mode: DedupeMode::default(),
            cooldown_s: DEFAULT_COOLDOWN_S,
            shown_advice_ttl_s: DEFAULT_SHOWN_ADVICE_TTL_S,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// Which keys a load or reload used, skipped, or rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigReport {
    pub applied: Vec<String>,
    pub ignored: Vec<String>,
    /// Canonical names of keys whose value failed validation.
    #[serde(default)]
    pub rejected: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigReport {
    fn reject(&mut self, key: &str, message: String) {
        let key = canonical_key(key).to_string();
        if !self.rejected.contains(&key) {
            self.rejected.push(key);
        }
        self.warnings.push(message);
    }

    /// One log line per load or reload, however many values were rejected.
    fn log_rejections(&self, origin: &str) {
        if self.warnings.is_empty() {
            return;
        }
        warn!(
            origin,
            rejected = ?self.rejected,
            warnings = %self.warnings.join("; "),
            "Config values rejected; keeping previous values for those keys"
        );
    }

    fn was_applied(&self, key: &str) -> bool {
        self.applied.iter().any(|applied| canonical_key(applied) == key)
    }
}

/// What the config file contributed to a load.
enum FileSection {
    Absent,
    Values(Map<String, Value>),
    /// Unreadable or malformed; the whole file is treated as rejected.
    Unusable,
}

/// Where environment overrides come from.
#[derive(Debug, Clone, Default)]
pub enum EnvLayer {
    #[default]
    Process,
    Fixed(BTreeMap<String, String>),
    Disabled,
}

impl EnvLayer {
    fn lookup(&self, name: &str) -> Option<String> {
        match self {
            EnvLayer::Process => env::var(name).ok(),
            EnvLayer::Fixed(values) => values.get(name).cloned(),
            EnvLayer::Disabled => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigSource {
    pub file: Option<PathBuf>,
    pub env: EnvLayer,
}

impl ConfigSource {
    /// The default file location plus process environment.
    pub fn standard() -> Self {
        ConfigSource {
            file: paths::default_config_path().ok(),
            env: EnvLayer::Process,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        ConfigSource {
            file: Some(path.into()),
            env: EnvLayer::Disabled,
        }
    }

    pub fn with_env(mut self, env: EnvLayer) -> Self {
        self.env = env;
        self
    }

    /// Reads the namespaced section. Missing file or section → absent;
    /// unreadable or malformed → unusable + one warning.
    fn read_file_section(&self, report: &mut ConfigReport) -> FileSection {
        let Some(path) = self.file.as_ref() else {
            return FileSection::Absent;
        };

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return FileSection::Absent,
            Err(err) => {
                report
                    .warnings
                    .push(GateError::io("read config file", err).to_string());
                return FileSection::Unusable;
            }
        };

        let malformed = |details: String, report: &mut ConfigReport| {
            let err = GateError::ConfigMalformed {
                path: path.clone(),
                details,
            };
            report.warnings.push(err.to_string());
            FileSection::Unusable
        };

        let document: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => return malformed(err.to_string(), report),
        };
        let Value::Object(mut root) = document else {
            return malformed("top level is not an object".to_string(), report);
        };

        let Some(name) = SECTION_NAMES.iter().find(|name| root.contains_key(**name)) else {
            return FileSection::Absent;
        };
        match root.remove(*name) {
            Some(Value::Object(section)) => FileSection::Values(section),
            _ => malformed(format!("section {:?} is not an object", name), report),
        }
    }

    fn origin(&self) -> String {
        self.file
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "environment".to_string())
    }

    fn env_values(&self) -> Map<String, Value> {
        ENV_KEYS
            .iter()
            .filter_map(|(var, key)| {
                self.env
                    .lookup(var)
                    .map(|value| (key.to_string(), Value::String(value)))
            })
            .collect()
    }
}

/// Owner of the live [`GateConfig`] snapshot.
#[derive(Debug)]
pub struct ConfigAuthority {
    current: ArcSwap<GateConfig>,
    source: ConfigSource,
    // Serializes writers; readers never take it.
    update: Mutex<()>,
}

impl ConfigAuthority {
    pub fn new(source: ConfigSource) -> Self {
        Self::with_initial(source, GateConfig::default())
    }

    pub fn with_initial(source: ConfigSource, initial: GateConfig) -> Self {
        ConfigAuthority {
            current: ArcSwap::from_pointee(initial),
            source,
            update: Mutex::new(()),
        }
    }

    /// Builds an authority and performs the first load.
    pub fn load_from(source: ConfigSource) -> (Self, ConfigReport) {
        let authority = Self::new(source);
        let report = authority.load();
        (authority, report)
    }

    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    pub fn current(&self) -> Arc<GateConfig> {
        self.current.load_full()
    }

    /// Rebuilds the snapshot from defaults, the file and the environment, and
    /// swaps it in.
    ///
    /// Keys removed from the file fall back to their defaults. A rejected key
    /// keeps its value from the previous snapshot, and an unusable file keeps
    /// every previous value.
    pub fn load(&self) -> ConfigReport {
        let _writer = self.update.lock().unwrap_or_else(|e| e.into_inner());
        let mut report = ConfigReport::default();
        let prior = self.current.load_full();

        let after_file = match self.source.read_file_section(&mut report) {
            FileSection::Absent => GateConfig::default(),
            FileSection::Values(values) => {
                apply_values(&GateConfig::default(), &values, &mut report)
            }
            FileSection::Unusable => (*prior).clone(),
        };
        let env_values = self.source.env_values();
        let mut next = apply_values(&after_file, &env_values, &mut report);

        for key in &report.rejected {
            if !report.was_applied(key) {
                restore_field(&mut next, &prior, key);
            }
        }

        self.current.store(Arc::new(next));
        report.log_rejections(&self.source.origin());
        report
    }

    /// Applies `values` on top of the current snapshot and swaps it in.
    pub fn reload(&self, values: &Map<String, Value>) -> ConfigReport {
        let _writer = self.update.lock().unwrap_or_else(|e| e.into_inner());
        let mut report = ConfigReport::default();
        let next = apply_values(&self.current.load_full(), values, &mut report);
        self.current.store(Arc::new(next));
        report.log_rejections("apply_config");
        report
    }
}

static GLOBAL: Lazy<Arc<ConfigAuthority>> =
    Lazy::new(|| Arc::new(ConfigAuthority::load_from(ConfigSource::standard()).0));

/// The process-wide authority, loaded from the standard source on first use.
pub fn global() -> Arc<ConfigAuthority> {
    Arc::clone(&GLOBAL)
}

fn apply_values(base: &GateConfig, values: &Map<String, Value>, report: &mut ConfigReport) -> GateConfig {
    let mut next = base.clone();

    for (key, value) in values {
        match key.as_str() {
            KEY_MODE => match value.as_str().map(str::parse::<DedupeMode>) {
                Some(Ok(mode)) => {
                    next.mode = mode;
                    report.applied.push(key.clone());
                }
                Some(Err(err)) => report.reject(key, format!("{}: {}", key, err)),
                None => report.reject(key, format!("{}: expected a string, got {}", key, value)),
            },
            KEY_COOLDOWN => {
                if let Some(secs) = window_value(key, value, report) {
                    next.cooldown_s = secs;
                    report.applied.push(key.clone());
                }
            }
            KEY_SHOWN_TTL_ALIAS if values.contains_key(KEY_SHOWN_TTL) => {
                report.ignored.push(key.clone());
            }
            KEY_SHOWN_TTL | KEY_SHOWN_TTL_ALIAS => {
                if let Some(secs) = window_value(key, value, report) {
                    next.shown_advice_ttl_s = secs;
                    report.applied.push(key.clone());
                }
            }
            KEY_LOG_CAPACITY => match integer_value(value) {
                Some(n) if (1..=MAX_LOG_CAPACITY).contains(&n) => {
                    next.log_capacity = n as usize;
                    report.applied.push(key.clone());
                }
                Some(n) => report.reject(key, format!(
                    "{}: {} out of range 1..={}",
                    key, n, MAX_LOG_CAPACITY
                )),
                None => report.reject(key, format!("{}: expected a positive integer, got {}", key, value)),
            },
            _ => report.ignored.push(key.clone()),
        }
    }

    next
}

fn canonical_key(key: &str) -> &str {
    if key == KEY_SHOWN_TTL_ALIAS {
        KEY_SHOWN_TTL
    } else {
        key
    }
}

fn restore_field(next: &mut GateConfig, prior: &GateConfig, key: &str) {
    match key {
        KEY_MODE => next.mode = prior.mode,
        KEY_COOLDOWN => next.cooldown_s = prior.cooldown_s,
        KEY_SHOWN_TTL => next.shown_advice_ttl_s = prior.shown_advice_ttl_s,
        KEY_LOG_CAPACITY => next.log_capacity = prior.log_capacity,
        _ => {}
    }
}

fn window_value(key: &str, value: &Value, report: &mut ConfigReport) -> Option<f64> {
    match number_value(value) {
        Some(secs) if secs.is_finite() && (0.0..=MAX_WINDOW_S).contains(&secs) => Some(secs),
        Some(secs) => {
            report.reject(key, format!("{}: {} out of range 0..={}", key, secs, MAX_WINDOW_S));
            None
        }
        None => {
            report.reject(key, format!("{}: expected a number, got {}", key, value));
            None
        }
    }
}

fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn integer_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn missing_file_keeps_defaults_without_warnings() {
        let temp = tempdir().unwrap();
        let (authority, report) =
            ConfigAuthority::load_from(ConfigSource::file(temp.path().join("absent.json")));
        assert_eq!(*authority.current(), GateConfig::default());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn valid_file_section_applies() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"advice_gate": {"mode": "contextual", "cooldown_s": 90, "shown_advice_ttl_s": 15.5, "log_capacity": 50, "color": "blue"}, "other": {}}"#,
        )
        .unwrap();

        let (authority, report) = ConfigAuthority::load_from(ConfigSource::file(&path));
        let config = authority.current();
        assert_eq!(config.mode, DedupeMode::Contextual);
        assert_eq!(config.cooldown_s, 90.0);
        assert_eq!(config.shown_advice_ttl_s, 15.5);
        assert_eq!(config.log_capacity, 50);
        assert_eq!(report.ignored, vec!["color"]);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn fallback_section_name_is_read() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"dedupe": {"mode": "flat"}}"#).unwrap();

        let (authority, _) = ConfigAuthority::load_from(ConfigSource::file(&path));
        assert_eq!(authority.current().mode, DedupeMode::Flat);
    }

    #[test]
    fn bad_field_is_reported_and_others_apply() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"gate": {"mode": "flat", "cooldown_s": "soon", "log_capacity": 0, "shown_ttl_s": 45}}"#,
        )
        .unwrap();

        let (authority, report) = ConfigAuthority::load_from(ConfigSource::file(&path));
        let config = authority.current();
        assert_eq!(config.mode, DedupeMode::Flat);
        assert_eq!(config.shown_advice_ttl_s, 45.0);
        assert_eq!(config.cooldown_s, DEFAULT_COOLDOWN_S);
        assert_eq!(config.log_capacity, DEFAULT_LOG_CAPACITY);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings.iter().any(|w| w.starts_with("cooldown_s:")));
        assert!(report.warnings.iter().any(|w| w.starts_with("log_capacity:")));
        assert!(report.applied.contains(&"shown_ttl_s".to_string()));
    }

    #[test]
    fn corrupt_file_keeps_prior_values_with_single_warning() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        let prior = GateConfig {
            mode: DedupeMode::Contextual,
            cooldown_s: 12.0,
            shown_advice_ttl_s: 3.0,
            log_capacity: 77,
        };
        std::fs::write(&path, b"{\"advice_gate\": {\"mode\": \xff\xfe").unwrap();

        let authority = ConfigAuthority::with_initial(ConfigSource::file(&path), prior.clone());
        let report = authority.load();
        assert_eq!(*authority.current(), prior);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("malformed"));
    }

    #[test]
    fn non_object_section_is_malformed() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"advice_gate": [1, 2]}"#).unwrap();

        let (authority, report) = ConfigAuthority::load_from(ConfigSource::file(&path));
        assert_eq!(*authority.current(), GateConfig::default());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn env_overrides_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"advice_gate": {"mode": "flat", "cooldown_s": 10}}"#).unwrap();

        let env = BTreeMap::from([
            ("ADVICE_GATE_MODE".to_string(), "tree".to_string()),
            ("ADVICE_GATE_LOG_CAPACITY".to_string(), "250".to_string()),
        ]);
        let source = ConfigSource::file(&path).with_env(EnvLayer::Fixed(env));
        let (authority, report) = ConfigAuthority::load_from(source);

        let config = authority.current();
        assert_eq!(config.mode, DedupeMode::Tree);
        assert_eq!(config.cooldown_s, 10.0);
        assert_eq!(config.log_capacity, 250);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn removed_file_key_reverts_to_default_on_next_load() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"advice_gate": {"mode": "contextual", "cooldown_s": 30}}"#)
            .unwrap();
        let (authority, _) = ConfigAuthority::load_from(ConfigSource::file(&path));
        assert_eq!(authority.current().mode, DedupeMode::Contextual);

        std::fs::write(&path, r#"{"advice_gate": {"cooldown_s": 30}}"#).unwrap();
        authority.load();
        assert_eq!(authority.current().mode, DedupeMode::Tree);
        assert_eq!(authority.current().cooldown_s, 30.0);

        std::fs::remove_file(&path).unwrap();
        authority.load();
        assert_eq!(*authority.current(), GateConfig::default());
    }

    #[test]
    fn rejected_key_keeps_previous_snapshot_value() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"advice_gate": {"cooldown_s": 30, "log_capacity": 10}}"#)
            .unwrap();
        let (authority, _) = ConfigAuthority::load_from(ConfigSource::file(&path));

        std::fs::write(&path, r#"{"advice_gate": {"cooldown_s": "later", "log_capacity": 10}}"#)
            .unwrap();
        let report = authority.load();

        assert_eq!(report.rejected, vec!["cooldown_s"]);
        assert_eq!(authority.current().cooldown_s, 30.0);
        assert_eq!(authority.current().log_capacity, 10);
    }

    #[test]
    fn env_value_applies_over_rejected_file_value() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, r#"{"advice_gate": {"log_capacity": -5}}"#).unwrap();

        let env = BTreeMap::from([("ADVICE_GATE_LOG_CAPACITY".to_string(), "40".to_string())]);
        let source = ConfigSource::file(&path).with_env(EnvLayer::Fixed(env));
        let (authority, report) = ConfigAuthority::load_from(source);

        assert_eq!(report.rejected, vec!["log_capacity"]);
        assert_eq!(authority.current().log_capacity, 40);
    }

    #[test]
    fn reload_reports_applied_and_ignored() {
        let authority = ConfigAuthority::new(ConfigSource::default().with_env(EnvLayer::Disabled));
        let report = authority.reload(&object(json!({
            "cooldown_s": 42,
            "shown_ttl_s": 7,
            "unknown_knob": true,
        })));

        assert_eq!(report.applied, vec!["cooldown_s", "shown_ttl_s"]);
        assert_eq!(report.ignored, vec!["unknown_knob"]);
        assert_eq!(authority.current().cooldown_s, 42.0);
        assert_eq!(authority.current().shown_advice_ttl_s, 7.0);
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let authority = ConfigAuthority::new(ConfigSource::default());
        let report = authority.reload(&object(json!({
            "shown_advice_ttl_s": 20,
            "shown_ttl_s": 99,
        })));

        assert_eq!(authority.current().shown_advice_ttl_s, 20.0);
        assert_eq!(report.ignored, vec!["shown_ttl_s"]);
    }

    #[test]
    fn out_of_range_and_wrong_type_values_are_rejected() {
        let authority = ConfigAuthority::new(ConfigSource::default());
        let report = authority.reload(&object(json!({
            "cooldown_s": -1,
            "mode": 3,
            "log_capacity": 2.5,
        })));

        assert!(report.applied.is_empty());
        assert_eq!(report.warnings.len(), 3);
        assert_eq!(*authority.current(), GateConfig::default());
    }

    #[test]
    fn held_snapshot_is_unaffected_by_reload() {
        let authority = ConfigAuthority::new(ConfigSource::default());
        let before = authority.current();
        authority.reload(&object(json!({"cooldown_s": 1})));

        assert_eq!(before.cooldown_s, DEFAULT_COOLDOWN_S);
        assert_eq!(authority.current().cooldown_s, 1.0);
    }
}
