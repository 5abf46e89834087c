//! Error types for gate-core operations.
//!
//! Callers at the decision boundary never surface these to the host. They exist
//! so the layers below can tell an expected, locally handled condition
//! (lock contention, malformed data) from an unexpected one (permission denied,
//! disk full) and propagate only the latter.

use std::path::PathBuf;

/// All errors that can occur in gate-core operations.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    // ─────────────────────────────────────────────────────────────────────
    // Contention
    // ─────────────────────────────────────────────────────────────────────
    #[error("Timed out after {waited_ms}ms waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // I/O
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl GateError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        GateError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        GateError::Json {
            context: context.into(),
            source,
        }
    }

    /// True for conditions the subsystem expects and recovers from on its own.
    ///
    /// Lock timeouts resolve by fail-open or retry; malformed config resolves to
    /// the prior snapshot. Everything else is a genuine fault.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GateError::LockTimeout { .. } | GateError::ConfigMalformed { .. }
        )
    }
}

/// Convenience type alias for Results using GateError.
pub type Result<T> = std::result::Result<T, GateError>;
