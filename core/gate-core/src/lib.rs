//! # gate-core
//!
//! Decides whether a piece of advice may be shown to a coding agent right now,
//! or must be held back because the same logical actor saw it recently.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. Decisions are local computation plus at
//!   most one unlocked file read.
//! - **Never fails the host**: The decision API logs and absorbs errors. The
//!   worst outcome is one duplicate or one withheld piece of advice.
//! - **Shared log, private state**: Processes share the dedupe log on disk;
//!   per-session state stays inside the owning process.
//!
//! ## Module Structure
//!
//! - [`lock`]: Marker-file locks with timeout and stale reclamation
//! - [`append_log`]: Capped JSON-lines log written under a lock
//! - [`session`]: Ring buffer of recent tool events and suppression windows
//! - [`scope`]: Session lineage parsing and dedupe scope keys
//! - [`dedupe`]: Cross-process "recently emitted" cache over the log
//! - [`config`]: Layered, hot-reloadable tunables
//! - [`gate`]: The decision API
//! - [`refresh`]: Background config refresh loop
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gate_core::{AdviceContext, AdviceGate};
//!
//! let gate = AdviceGate::standard()?;
//! let now = gate_core::unix_now();
//! if !gate.should_suppress("Edit", "tip-42", session_id, now, &AdviceContext::default()) {
//!     emit(advice_text);
//!     gate.record_emitted("Edit", "tip-42", session_id, now, &AdviceContext::default());
//! }
//! ```

pub mod append_log;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod gate;
pub mod lock;
pub mod paths;
pub mod refresh;
pub mod scope;
pub mod session;

pub use append_log::{AppendLog, AppendOutcome, Timestamped};
pub use config::{ConfigAuthority, ConfigReport, ConfigSource, EnvLayer, GateConfig};
pub use dedupe::{DedupeRecord, GlobalDedupeCache};
pub use error::{GateError, Result};
pub use gate::{unix_now, AdviceContext, AdviceGate, Decision, SuppressReason};
pub use lock::{with_lock, LockGuard, LockOptions, LockOutcome};
pub use refresh::RefreshLoop;
pub use scope::{scope_key, session_lineage, DedupeMode, ScopeKey, SessionKind, SessionLineage};
pub use session::{SessionState, SuppressionEntry, ToolEvent, ToolOutcome};
