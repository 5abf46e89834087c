//! Line protocol spoken by `gate-hook serve`.
//!
//! One JSON request per stdin line, one JSON response per stdout line, in the
//! same order. Requests carry an optional `id` that is echoed back.
//!
//! ```text
//! → {"method":"should_suppress","id":"7","params":{"tool_name":"Edit","advice_id":"a1","session_id":"s"}}
//! ← {"ok":true,"id":"7","data":{"suppress":false,"scope_key":"s"}}
//! ```

use gate_core::{AdviceContext, ToolEvent, ToolOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Default look-back for trace resolution when the request gives none.
pub const DEFAULT_TRACE_MAX_AGE_S: f64 = 120.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    ToolEvent,
    /// A raw host hook payload (`PreToolUse`, `PostToolUse`, ...).
    Hook,
    ShouldSuppress,
    RecordEmitted,
    ResolveTrace,
    ApplyConfig,
    GetConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Parameters for `should_suppress` and `record_emitted`.
#[derive(Debug, Clone, Deserialize)]
pub struct AdviceParams {
    pub tool_name: String,
    pub advice_id: String,
    pub session_id: String,
    /// Seconds since the Unix epoch; defaults to the time of handling.
    #[serde(default)]
    pub ts: Option<f64>,
    #[serde(flatten)]
    pub context: AdviceContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TraceParams {
    pub session_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub max_age_s: Option<f64>,
    #[serde(default)]
    pub ts: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolEventParams {
    pub tool_name: String,
    pub session_id: String,
    pub outcome: ToolOutcome,
    #[serde(default)]
    pub ts: Option<f64>,
    #[serde(default)]
    pub trace_id: Option<String>,
}

impl ToolEventParams {
    pub fn into_event(self, now: f64) -> ToolEvent {
        ToolEvent {
            tool_name: self.tool_name,
            ts: self.ts.unwrap_or(now),
            outcome: self.outcome,
            session_id: self.session_id,
            trace_id: self.trace_id,
        }
    }
}

/// The subset of a host hook payload the gate cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct HookInput {
    pub hook_event_name: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_use_id: Option<String>,
}

impl HookInput {
    /// Maps tool hooks onto tool events. Other hooks carry no tool activity.
    pub fn to_tool_event(&self, now: f64) -> Option<ToolEvent> {
        let outcome = match self.hook_event_name.as_str() {
            "PreToolUse" => ToolOutcome::Unresolved,
            "PostToolUse" => ToolOutcome::Success,
            "PostToolUseFailure" => ToolOutcome::Failure,
            _ => return None,
        };

        Some(ToolEvent {
            tool_name: self.tool_name.clone()?,
            ts: now,
            outcome,
            session_id: self.session_id.clone()?,
            trace_id: self.tool_use_id.clone(),
        })
    }
}
