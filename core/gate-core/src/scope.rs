//! Session lineage and dedupe scope keys.
//!
//! Session identities are colon-delimited, path-like strings. A sub-agent
//! spawned by a session gets an identity that embeds a `subagent` segment after
//! its root:
//!
//! ```text
//! sess-7f3a                          main session        tree key: sess-7f3a
//! sess-7f3a:subagent:explore-1       sub-agent, depth 2  tree key: sess-7f3a
//! sess-7f3a:subagent:a:subagent:b    nested, depth 4     tree key: sess-7f3a
//! ```
//!
//! The identity is parsed once into a [`SessionLineage`]; nothing downstream
//! looks at the raw string again.
//!
//! # Scope Modes
//!
//! | mode         | key                               |
//! |--------------|-----------------------------------|
//! | `flat`       | identity verbatim                 |
//! | `tree`       | tree key (siblings share)         |
//! | `contextual` | `tree_key:phase:intent_family`    |
//!
//! In contextual mode, if either dimension is missing the key falls back to the
//! tree key alone. Dimension values are escaped so a `:` inside a value can
//! never make two different inputs produce the same key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const SUBAGENT_MARKER: &str = "subagent";
const UNKNOWN_TREE_KEY: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Main,
    Subagent,
    Unknown,
}

/// Structured view of a session identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLineage {
    /// The identity as received (trimmed).
    pub session_id: String,
    pub session_kind: SessionKind,
    pub is_subagent: bool,
    /// Colon-delimited segments beyond the tree root.
    pub depth_hint: usize,
    pub tree_key: String,
}

impl SessionLineage {
    pub fn parse(session_id: &str) -> Self {
        session_lineage(session_id)
    }
}

/// Parses a session identity into its lineage.
pub fn session_lineage(session_id: &str) -> SessionLineage {
    let session_id = session_id.trim();
    if session_id.is_empty() {
        return SessionLineage {
            session_id: String::new(),
            session_kind: SessionKind::Unknown,
            is_subagent: false,
            depth_hint: 0,
            tree_key: UNKNOWN_TREE_KEY.to_string(),
        };
    }

    let segments: Vec<&str> = session_id.split(':').collect();
    let marker = segments
        .iter()
        .position(|segment| segment.eq_ignore_ascii_case(SUBAGENT_MARKER));

    match marker {
        // A leading marker has no root in front of it; treat the identity as its own tree.
        Some(0) | None => SessionLineage {
            session_id: session_id.to_string(),
            session_kind: if marker.is_some() {
                SessionKind::Subagent
            } else {
                SessionKind::Main
            },
            is_subagent: marker.is_some(),
            depth_hint: 0,
            tree_key: session_id.to_string(),
        },
        Some(index) => SessionLineage {
            session_id: session_id.to_string(),
            session_kind: SessionKind::Subagent,
            is_subagent: true,
            depth_hint: segments.len() - index,
            tree_key: segments[..index].join(":"),
        },
    }
}

/// How the dedupe space is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupeMode {
    Flat,
    #[default]
    Tree,
    Contextual,
}

impl DedupeMode {
    pub const ALL: [DedupeMode; 3] = [DedupeMode::Flat, DedupeMode::Tree, DedupeMode::Contextual];

    pub fn as_str(self) -> &'static str {
        match self {
            DedupeMode::Flat => "flat",
            DedupeMode::Tree => "tree",
            DedupeMode::Contextual => "contextual",
        }
    }
}

impl fmt::Display for DedupeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DedupeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        DedupeMode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("expected one of flat, tree, contextual; got {:?}", value))
    }
}

/// Partition identifier for dedupe and suppression decisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(value: impl Into<String>) -> Self {
        ScopeKey(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ScopeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Computes the scope key for a parsed lineage under `mode`.
pub fn scope_key(
    lineage: &SessionLineage,
    mode: DedupeMode,
    intent_family: Option<&str>,
    task_phase: Option<&str>,
) -> ScopeKey {
    match mode {
        DedupeMode::Flat if lineage.session_id.is_empty() => ScopeKey::new(UNKNOWN_TREE_KEY),
        DedupeMode::Flat => ScopeKey::new(lineage.session_id.clone()),
        DedupeMode::Tree => ScopeKey::new(lineage.tree_key.clone()),
        DedupeMode::Contextual => {
            let phase = non_empty(task_phase);
            let intent = non_empty(intent_family);
            match (phase, intent) {
                (Some(phase), Some(intent)) => ScopeKey::new(format!(
                    "{}:{}:{}",
                    lineage.tree_key,
                    escape_dimension(phase),
                    escape_dimension(intent)
                )),
                _ => ScopeKey::new(lineage.tree_key.clone()),
            }
        }
    }
}

/// Convenience form that parses `session_id` first.
pub fn scope_key_for(
    session_id: &str,
    mode: DedupeMode,
    intent_family: Option<&str>,
    task_phase: Option<&str>,
) -> ScopeKey {
    scope_key(&session_lineage(session_id), mode, intent_family, task_phase)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn escape_dimension(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
