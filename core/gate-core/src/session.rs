//! Per-session tool history and local suppression windows.
//!
//! A [`SessionState`] lives only in the process that owns the session. It is
//! created on the first event observed for a session and dropped with the
//! process; nothing here is shared or persisted.
//!
//! ## Event Handling
//!
//! ```text
//! pre-call  (unresolved)        → pushed into the ring
//! post-call (success|failure)   → pushed into the ring; the matching in-flight
//!                                 pre-call (same tool + trace id) is resolved
//! post-call failure             → clears every suppression for that tool
//! ```

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::scope::{ScopeKey, SessionLineage};

pub const DEFAULT_RING_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    Success,
    Failure,
    /// Pre-call not yet matched to its post-call.
    Unresolved,
}

impl ToolOutcome {
    pub fn is_resolved(self) -> bool {
        self != ToolOutcome::Unresolved
    }
}

/// One observed action by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub tool_name: String,
    /// Seconds since the Unix epoch.
    pub ts: f64,
    pub outcome: ToolOutcome,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// A temporary block on advice for one tool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub start: f64,
    pub duration: f64,
    pub until: f64,
}

impl SuppressionEntry {
    pub fn new(start: f64, duration: f64) -> Self {
        let duration = duration.max(0.0);
        SuppressionEntry {
            start,
            duration,
            until: start + duration,
        }
    }

    /// Suppressed iff `now < start + duration * scale`.
    pub fn is_active(&self, now: f64, scale: f64) -> bool {
        let scale = if scale.is_finite() { scale.max(0.0) } else { 1.0 };
        now < self.start + self.duration * scale
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SuppressionKey {
    tool: String,
    scope: Option<ScopeKey>,
}

impl SuppressionKey {
    fn tool_wide(tool: &str) -> Self {
        SuppressionKey {
            tool: tool.to_string(),
            scope: None,
        }
    }

    fn scoped(tool: &str, scope: &ScopeKey) -> Self {
        SuppressionKey {
            tool: tool.to_string(),
            scope: Some(scope.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    lineage: SessionLineage,
    capacity: usize,
    recent: VecDeque<ToolEvent>,
    suppressions: HashMap<SuppressionKey, SuppressionEntry>,
}

impl SessionState {
    pub fn new(lineage: SessionLineage) -> Self {
        Self::with_capacity(lineage, DEFAULT_RING_CAPACITY)
    }

    pub fn with_capacity(lineage: SessionLineage, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SessionState {
            lineage,
            capacity,
            recent: VecDeque::with_capacity(capacity),
            suppressions: HashMap::new(),
        }
    }

    pub fn lineage(&self) -> &SessionLineage {
        &self.lineage
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered events, oldest first.
    pub fn recent_events(&self) -> impl Iterator<Item = &ToolEvent> {
        self.recent.iter()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }

    pub fn record_tool_event(&mut self, event: ToolEvent) {
        if event.outcome.is_resolved() {
            if let Some(trace_id) = event.trace_id.as_deref() {
                if let Some(pending) = self.recent.iter_mut().rev().find(|e| {
                    e.outcome == ToolOutcome::Unresolved
                        && e.tool_name == event.tool_name
                        && e.trace_id.as_deref() == Some(trace_id)
                }) {
                    pending.outcome = event.outcome;
                }
            }

            if event.outcome == ToolOutcome::Failure {
                self.suppressions.retain(|key, _| key.tool != event.tool_name);
            }
        }

        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(event);
    }

    /// Trace id of the best buffered event for `tool_name` no older than `max_age`.
    ///
    /// An unresolved (in-flight) call wins over a resolved one even when the
    /// resolved one is newer. Within a status the highest `ts` wins, so events
    /// that arrive out of order still resolve by when they happened; equal
    /// timestamps go to the later arrival.
    pub fn resolve_recent_trace_id(&self, tool_name: &str, max_age: f64, now: f64) -> Option<&str> {
        let cutoff = now - max_age;
        self.recent
            .iter()
            .filter(|event| {
                event.tool_name == tool_name && event.ts >= cutoff && event.trace_id.is_some()
            })
            .max_by(|a, b| {
                let in_flight = |e: &ToolEvent| e.outcome == ToolOutcome::Unresolved;
                in_flight(a)
                    .cmp(&in_flight(b))
                    .then(a.ts.total_cmp(&b.ts))
            })
            .and_then(|event| event.trace_id.as_deref())
    }

    /// Creates or overwrites the tool-wide suppression with `start = now`.
    pub fn suppress_tool_advice(&mut self, tool_name: &str, duration: f64, now: f64) {
        self.suppressions.insert(
            SuppressionKey::tool_wide(tool_name),
            SuppressionEntry::new(now, duration),
        );
    }

    pub fn suppress_tool_advice_in_scope(
        &mut self,
        tool_name: &str,
        scope: &ScopeKey,
        duration: f64,
        now: f64,
    ) {
        self.suppressions.insert(
            SuppressionKey::scoped(tool_name, scope),
            SuppressionEntry::new(now, duration),
        );
    }

    pub fn is_tool_suppressed(&self, tool_name: &str, scale: f64, now: f64) -> bool {
        self.suppressions
            .get(&SuppressionKey::tool_wide(tool_name))
            .is_some_and(|entry| entry.is_active(now, scale))
    }

    /// True when either the tool-wide or the `(tool, scope)` window is active.
    pub fn is_tool_suppressed_in_scope(
        &self,
        tool_name: &str,
        scope: &ScopeKey,
        scale: f64,
        now: f64,
    ) -> bool {
        self.is_tool_suppressed(tool_name, scale, now)
            || self
                .suppressions
                .get(&SuppressionKey::scoped(tool_name, scope))
                .is_some_and(|entry| entry.is_active(now, scale))
    }

    pub fn suppression_for(&self, tool_name: &str) -> Option<&SuppressionEntry> {
        self.suppressions.get(&SuppressionKey::tool_wide(tool_name))
    }

    /// Number of suppression windows held, expired or not.
    pub fn suppression_count(&self) -> usize {
        self.suppressions.len()
    }

    /// Drops entries that are inactive even under `max_scale`, the largest
    /// scale any caller may ask with.
    pub fn prune_expired(&mut self, now: f64, max_scale: f64) -> usize {
        let before = self.suppressions.len();
        self.suppressions
            .retain(|_, entry| entry.is_active(now, max_scale.max(1.0)));
        before - self.suppressions.len()
    }
}
