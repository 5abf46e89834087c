//! Cross-process "already shown" cache built on an append-only log.
//!
//! Every process that gates advice for a host shares one log file. A record
//! says "advice X was emitted in scope Y at time T". Lookups scan the log for a
//! matching record inside the cooldown window; emissions append a record under
//! the log lock.
//!
//! # Known Race
//!
//! The read path takes no lock. Two processes can both see "absent" for the
//! same advice and scope, both emit, and both append. The result is at most one
//! extra emission per contended window. This trades strict exactly-once
//! suppression for never blocking the host on reads, and is left as is.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::append_log::{AppendLog, AppendOutcome, Timestamped};
use crate::error::Result;
use crate::lock::LockOptions;
use crate::scope::ScopeKey;

/// One row in the dedupe log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupeRecord {
    pub ts: f64,
    pub tool: String,
    pub advice_id: String,
    pub scope_key: String,
}

impl Timestamped for DedupeRecord {
    fn timestamp(&self) -> f64 {
        self.ts
    }
}

#[derive(Debug, Clone)]
pub struct GlobalDedupeCache {
    log: AppendLog,
}

impl GlobalDedupeCache {
    /// Opens the cache over the log at `path`. Appends fail open on lock timeout.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        GlobalDedupeCache {
            log: AppendLog::new(path).fail_open(true),
        }
    }

    pub fn with_lock_options(mut self, options: LockOptions) -> Self {
        self.log = self.log.with_lock_options(options);
        self
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub fn log(&self) -> &AppendLog {
        &self.log
    }

    /// The most recent record for `advice_id` in `scope_key` no older than `cooldown`.
    pub fn recently_emitted(
        &self,
        tool_name: &str,
        advice_id: &str,
        now: f64,
        cooldown: f64,
        scope_key: &ScopeKey,
    ) -> Result<Option<DedupeRecord>> {
        let hits = self.log.read_recent(
            |record: &DedupeRecord| {
                record.advice_id == advice_id && record.scope_key == scope_key.as_str()
            },
            cooldown,
            now,
        )?;

        let latest = hits
            .into_iter()
            .max_by(|a, b| a.ts.total_cmp(&b.ts));
        if let Some(record) = &latest {
            debug!(
                tool = tool_name,
                advice_id,
                scope = %scope_key,
                age_s = now - record.ts,
                "Advice recently emitted in scope"
            );
        }
        Ok(latest)
    }

    /// Appends an emission record, capping the log at `capacity` lines.
    pub fn record_emission(
        &self,
        tool_name: &str,
        advice_id: &str,
        scope_key: &ScopeKey,
        now: f64,
        capacity: usize,
    ) -> Result<AppendOutcome> {
        let record = DedupeRecord {
            ts: now,
            tool: tool_name.to_string(),
            advice_id: advice_id.to_string(),
            scope_key: scope_key.as_str().to_string(),
        };
        self.log.append(&record, capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const T: f64 = 1_760_000_000.0;

    fn seeded(dir: &Path) -> GlobalDedupeCache {
        let path = dir.join("advice-dedupe.jsonl");
        std::fs::write(
            &path,
            format!(
                "{{\"ts\":{},\"tool\":\"Edit\",\"advice_id\":\"a1\",\"scope_key\":\"agent:X\"}}\n",
                T - 5.0
            ),
        )
        .unwrap();
        GlobalDedupeCache::new(path)
    }

    #[test]
    fn hit_within_cooldown_same_scope() {
        let temp = tempdir().unwrap();
        let cache = seeded(temp.path());

        let hit = cache
            .recently_emitted("Edit", "a1", T, 60.0, &ScopeKey::new("agent:X"))
            .unwrap()
            .expect("record within cooldown");
        assert_eq!(hit.ts, T - 5.0);
    }

    #[test]
    fn miss_for_other_scope() {
        let temp = tempdir().unwrap();
        let cache = seeded(temp.path());

        let miss = cache
            .recently_emitted("Edit", "a1", T, 60.0, &ScopeKey::new("agent:Y"))
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn miss_for_expired_window_or_other_advice() {
        let temp = tempdir().unwrap();
        let cache = seeded(temp.path());
        let scope = ScopeKey::new("agent:X");

        assert!(cache
            .recently_emitted("Edit", "a1", T + 120.0, 60.0, &scope)
            .unwrap()
            .is_none());
        assert!(cache
            .recently_emitted("Edit", "a2", T, 60.0, &scope)
            .unwrap()
            .is_none());
    }

    #[test]
    fn returns_most_recent_match() {
        let temp = tempdir().unwrap();
        let cache = GlobalDedupeCache::new(temp.path().join("log.jsonl"));
        let scope = ScopeKey::new("root");

        cache.record_emission("Bash", "a1", &scope, T - 30.0, 100).unwrap();
        cache.record_emission("Bash", "a1", &scope, T - 10.0, 100).unwrap();
        cache.record_emission("Bash", "a1", &scope, T - 20.0, 100).unwrap();

        let hit = cache
            .recently_emitted("Bash", "a1", T, 60.0, &scope)
            .unwrap()
            .unwrap();
        assert_eq!(hit.ts, T - 10.0);
    }

    #[test]
    fn recorded_emission_is_visible_to_another_handle() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("log.jsonl");
        let writer = GlobalDedupeCache::new(&path);
        let reader = GlobalDedupeCache::new(&path);
        let scope = ScopeKey::new("root:explore:debug");

        writer.record_emission("Read", "tip-7", &scope, T, 100).unwrap();

        let hit = reader
            .recently_emitted("Read", "tip-7", T + 1.0, 60.0, &scope)
            .unwrap()
            .unwrap();
        assert_eq!(hit.tool, "Read");
        assert_eq!(hit.scope_key, "root:explore:debug");
    }

    #[test]
    fn extra_fields_in_log_are_ignored() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("log.jsonl");
        std::fs::write(
            &path,
            format!(
                "{{\"ts\":{},\"tool\":\"Edit\",\"advice_id\":\"a1\",\"scope_key\":\"s\",\"source\":\"legacy\",\"text\":\"hi\"}}\n",
                T
            ),
        )
        .unwrap();

        let hit = GlobalDedupeCache::new(&path)
            .recently_emitted("Edit", "a1", T, 10.0, &ScopeKey::new("s"))
            .unwrap();
        assert!(hit.is_some());
    }
}
