//! Advice emission gate: the decision API advice producers call.
//!
//! ```text
//! tool event ──► on_tool_event ──► SessionState (ring + suppressions)
//!
//! candidate ──► should_suppress
//!                 ├─ config snapshot (one per call)
//!                 ├─ lineage → scope key
//!                 ├─ local (tool, scope) window?        → suppress
//!                 └─ global log hit within cooldown?    → suppress
//!
//! emitted  ──► record_emitted
//!                 ├─ append DedupeRecord (lock, fail-open)
//!                 └─ open local (tool, scope) window
//! ```
//!
//! Nothing here returns an error to the caller. Failures are logged and resolve
//! toward availability: a failed cache read means "not suppressed", a failed
//! append means the next repeat may be shown once more.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{ConfigAuthority, ConfigReport, GateConfig};
use crate::dedupe::GlobalDedupeCache;
use crate::error::{GateError, Result};
use crate::paths;
use crate::scope::{scope_key, ScopeKey, SessionLineage};
use crate::session::{SessionState, ToolEvent, DEFAULT_RING_CAPACITY};

/// Seconds since the Unix epoch with sub-second precision.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Optional dimensions attached to an advice candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdviceContext {
    #[serde(default)]
    pub intent_family: Option<String>,
    #[serde(default)]
    pub task_phase: Option<String>,
    /// Multiplier applied to local suppression windows at read time.
    #[serde(default)]
    pub cooldown_scale: Option<f64>,
}

/// Upper bound on [`AdviceContext::cooldown_scale`]; larger values are clamped.
pub const MAX_COOLDOWN_SCALE: f64 = 10.0;

impl AdviceContext {
    fn scale(&self) -> f64 {
        self.cooldown_scale
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(|s| s.min(MAX_COOLDOWN_SCALE))
            .unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuppressReason {
    LocalWindow,
    RecentlyEmitted { age_s: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub suppress: bool,
    pub scope_key: ScopeKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SuppressReason>,
}

type SharedSession = Arc<Mutex<SessionState>>;

pub struct AdviceGate {
    config: Arc<ConfigAuthority>,
    cache: GlobalDedupeCache,
    sessions: Mutex<HashMap<String, SharedSession>>,
    ring_capacity: usize,
}

impl AdviceGate {
    pub fn new(config: Arc<ConfigAuthority>, cache: GlobalDedupeCache) -> Self {
        AdviceGate {
            config,
            cache,
            sessions: Mutex::new(HashMap::new()),
            ring_capacity: DEFAULT_RING_CAPACITY,
        }
    }

    /// Process-wide config plus the dedupe log in the default location.
    pub fn standard() -> Result<Self> {
        let log_path = paths::default_dedupe_log_path()?;
        Ok(Self::new(
            crate::config::global(),
            GlobalDedupeCache::new(log_path),
        ))
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity.max(1);
        self
    }

    pub fn config(&self) -> Arc<GateConfig> {
        self.config.current()
    }

    pub fn authority(&self) -> &Arc<ConfigAuthority> {
        &self.config
    }

    pub fn cache(&self) -> &GlobalDedupeCache {
        &self.cache
    }

    pub fn on_tool_event(&self, event: ToolEvent) {
        let lineage = SessionLineage::parse(&event.session_id);
        let session = self.session(lineage);
        let mut state = session.lock().unwrap_or_else(|e| e.into_inner());
        state.record_tool_event(event);
    }

    pub fn should_suppress(
        &self,
        tool_name: &str,
        advice_id: &str,
        session_id: &str,
        now: f64,
        context: &AdviceContext,
    ) -> bool {
        self.decide(tool_name, advice_id, session_id, now, context)
            .suppress
    }

    /// Full decision including the scope key and the reason for suppression.
    pub fn decide(
        &self,
        tool_name: &str,
        advice_id: &str,
        session_id: &str,
        now: f64,
        context: &AdviceContext,
    ) -> Decision {
        let config = self.config.current();
        let lineage = SessionLineage::parse(session_id);
        let scope = self.scope_for(&lineage, &config, context);

        if let Some(session) = self.existing_session(&lineage) {
            let state = session.lock().unwrap_or_else(|e| e.into_inner());
            if state.is_tool_suppressed_in_scope(tool_name, &scope, context.scale(), now) {
                debug!(tool = tool_name, advice_id, scope = %scope, "Advice suppressed by local window");
                return Decision {
                    suppress: true,
                    scope_key: scope,
                    reason: Some(SuppressReason::LocalWindow),
                };
            }
        }

        match self
            .cache
            .recently_emitted(tool_name, advice_id, now, config.cooldown_s, &scope)
        {
            Ok(Some(record)) => Decision {
                suppress: true,
                scope_key: scope,
                reason: Some(SuppressReason::RecentlyEmitted {
                    age_s: (now - record.ts).max(0.0),
                }),
            },
            Ok(None) => Decision {
                suppress: false,
                scope_key: scope,
                reason: None,
            },
            Err(err) => {
                report_failure(&err, "read", tool_name, advice_id);
                Decision {
                    suppress: false,
                    scope_key: scope,
                    reason: None,
                }
            }
        }
    }

    /// Records that advice was shown. Returns the scope key it was recorded under.
    pub fn record_emitted(
        &self,
        tool_name: &str,
        advice_id: &str,
        session_id: &str,
        now: f64,
        context: &AdviceContext,
    ) -> ScopeKey {
        let config = self.config.current();
        let lineage = SessionLineage::parse(session_id);
        let scope = self.scope_for(&lineage, &config, context);

        match self
            .cache
            .record_emission(tool_name, advice_id, &scope, now, config.log_capacity)
        {
            Ok(outcome) if !outcome.locked => {
                debug!(tool = tool_name, advice_id, "Emission recorded without lock");
            }
            Ok(_) => {}
            Err(err) => report_failure(&err, "append", tool_name, advice_id),
        }

        let session = self.session(lineage);
        let mut state = session.lock().unwrap_or_else(|e| e.into_inner());
        state.prune_expired(now, MAX_COOLDOWN_SCALE);
        state.suppress_tool_advice_in_scope(tool_name, &scope, config.shown_advice_ttl_s, now);
        scope
    }

    pub fn resolve_recent_trace_id(
        &self,
        session_id: &str,
        tool_name: &str,
        max_age: f64,
        now: f64,
    ) -> Option<String> {
        let lineage = SessionLineage::parse(session_id);
        let session = self.existing_session(&lineage)?;
        let state = session.lock().unwrap_or_else(|e| e.into_inner());
        state
            .resolve_recent_trace_id(tool_name, max_age, now)
            .map(str::to_string)
    }

    pub fn apply_gate_config(&self, options: &Map<String, Value>) -> ConfigReport {
        self.config.reload(options)
    }

    /// Runs `f` against a session's state if one exists.
    pub fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&SessionState) -> T) -> Option<T> {
        let lineage = SessionLineage::parse(session_id);
        let session = self.existing_session(&lineage)?;
        let state = session.lock().unwrap_or_else(|e| e.into_inner());
        Some(f(&state))
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn scope_for(&self, lineage: &SessionLineage, config: &GateConfig, context: &AdviceContext) -> ScopeKey {
        scope_key(
            lineage,
            config.mode,
            context.intent_family.as_deref(),
            context.task_phase.as_deref(),
        )
    }

    fn existing_session(&self, lineage: &SessionLineage) -> Option<SharedSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&lineage.session_id)
            .cloned()
    }

    fn session(&self, lineage: SessionLineage) -> SharedSession {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = self.ring_capacity;
        Arc::clone(
            sessions
                .entry(lineage.session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionState::with_capacity(lineage, capacity)))),
        )
    }
}

/// Expected conditions (lock contention, malformed data) are routine and stay
/// at debug; anything else is a fault worth a warning.
fn report_failure(err: &GateError, operation: &'static str, tool_name: &str, advice_id: &str) {
    if err.is_recoverable() {
        debug!(error = %err, operation, tool = tool_name, advice_id, "Dedupe cache unavailable; failing open");
    } else {
        warn!(error = %err, operation, tool = tool_name, advice_id, "Dedupe cache failed; failing open");
    }
}
