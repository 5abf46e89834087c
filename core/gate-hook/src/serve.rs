//! Long-lived gate process for one host session tree.
//!
//! Reads requests from stdin until EOF, answering each on stdout. Session state
//! lives for as long as this process does, which is what makes local
//! suppression windows and trace resolution useful. A background loop re-reads
//! the config file while we run; EOF stops it cooperatively.
//!
//! ## Methods
//!
//! ```text
//! tool_event       → record a tool event           data: {"recorded": true}
//! hook             → host hook payload → tool event data: {"recorded": bool}
//! should_suppress  → decision                      data: {"suppress", "scope_key", "reason"?}
//! record_emitted   → append + open local window    data: {"scope_key"}
//! resolve_trace    → in-flight/most recent trace   data: {"trace_id": string|null}
//! apply_config     → hot reload tunables           data: {"applied", "ignored", "rejected", "warnings"}
//! get_config       → current snapshot              data: GateConfig
//! ```

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use gate_core::refresh::DEFAULT_REFRESH_INTERVAL;
use gate_core::{unix_now, AdviceGate, RefreshLoop};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{
    AdviceParams, ErrorInfo, HookInput, Method, Request, Response, ToolEventParams, TraceParams,
    DEFAULT_TRACE_MAX_AGE_S, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Gate unavailable: {0}")]
    Gate(#[from] gate_core::GateError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ServeSummary {
    pub handled: u64,
    pub rejected: u64,
}

pub fn run(refresh_secs: Option<u64>) -> Result<ServeSummary, ServeError> {
    let gate = Arc::new(AdviceGate::standard()?);
    let interval = refresh_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_REFRESH_INTERVAL);
    let refresh = RefreshLoop::spawn(Arc::clone(gate.authority()), interval);
    info!(
        log = %gate.cache().path().display(),
        refresh_secs = interval.as_secs(),
        "gate-hook serve started"
    );

    let stdin = io::stdin();
    let stdout = io::stdout();
    let result = serve(&gate, stdin.lock(), stdout.lock(), unix_now);

    let cycles = refresh.stop();
    debug!(cycles, "Config refresh loop stopped");
    result
}

/// Answers every line of `input` on `output` until EOF.
///
/// Only I/O failures on the streams themselves end the loop. A line that is not
/// a valid request, including one that is not UTF-8 or is too long, gets an
/// error response and the next line is read.
pub fn serve(
    gate: &AdviceGate,
    mut input: impl BufRead,
    mut output: impl Write,
    clock: impl Fn() -> f64,
) -> Result<ServeSummary, ServeError> {
    let mut summary = ServeSummary::default();
    let mut buf = Vec::with_capacity(1024);

    while let Some(line) = next_line(&mut input, &mut buf)? {
        let parsed = match line {
            Line::Request if buf.iter().all(u8::is_ascii_whitespace) => continue,
            Line::Request => parse_request(&buf),
            Line::TooLarge => Err(ErrorInfo::new(
                "request_too_large",
                "request exceeded maximum size",
            )),
        };

        let response = match parsed {
            Ok(request) => {
                debug!(method = ?request.method, id = ?request.id, "Gate request received");
                handle_request(gate, request, clock())
            }
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "Failed to read request");
                Response::error_with_info(None, err)
            }
        };

        if response.ok {
            summary.handled += 1;
        } else {
            summary.rejected += 1;
        }

        let payload = serde_json::to_string(&response)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        writeln!(output, "{}", payload)?;
        output.flush()?;
    }

    Ok(summary)
}

enum Line {
    /// `buf` holds one line without its terminator.
    Request,
    /// The line exceeded [`MAX_REQUEST_BYTES`] and was skipped.
    TooLarge,
}

/// Reads the next line into `buf`, buffering at most `MAX_REQUEST_BYTES + 1`
/// bytes of it. Returns `None` at EOF.
fn next_line(input: &mut impl BufRead, buf: &mut Vec<u8>) -> io::Result<Option<Line>> {
    buf.clear();
    let limit = MAX_REQUEST_BYTES as u64 + 1;
    if io::Read::take(&mut *input, limit).read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > MAX_REQUEST_BYTES {
        discard_rest_of_line(input)?;
        buf.clear();
        return Ok(Some(Line::TooLarge));
    }
    Ok(Some(Line::Request))
}

fn discard_rest_of_line(input: &mut impl BufRead) -> io::Result<()> {
    loop {
        let (consumed, done) = {
            let available = input.fill_buf()?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(end) => (end + 1, true),
                None => (available.len(), false),
            }
        };
        input.consume(consumed);
        if done {
            return Ok(());
        }
    }
}

fn parse_request(line: &[u8]) -> Result<Request, ErrorInfo> {
    let request: Request = serde_json::from_slice(line)
        .map_err(|err| ErrorInfo::new("invalid_json", err.to_string()))?;
    if request.protocol_version != PROTOCOL_VERSION {
        return Err(ErrorInfo::new(
            "protocol_mismatch",
            format!(
                "expected protocol_version {}, got {}",
                PROTOCOL_VERSION, request.protocol_version
            ),
        ));
    }
    Ok(request)
}

pub fn handle_request(gate: &AdviceGate, request: Request, now: f64) -> Response {
    let id = request.id;
    let result = match request.method {
        Method::ToolEvent => params::<ToolEventParams>(request.params).map(|params| {
            gate.on_tool_event(params.into_event(now));
            json!({ "recorded": true })
        }),
        Method::Hook => params::<HookInput>(request.params).map(|input| {
            let event = input.to_tool_event(now);
            let recorded = event.is_some();
            if let Some(event) = event {
                gate.on_tool_event(event);
            }
            json!({ "recorded": recorded })
        }),
        Method::ShouldSuppress => params::<AdviceParams>(request.params).and_then(|params| {
            let decision = gate.decide(
                &params.tool_name,
                &params.advice_id,
                &params.session_id,
                params.ts.unwrap_or(now),
                &params.context,
            );
            to_value(&decision)
        }),
        Method::RecordEmitted => params::<AdviceParams>(request.params).map(|params| {
            let scope = gate.record_emitted(
                &params.tool_name,
                &params.advice_id,
                &params.session_id,
                params.ts.unwrap_or(now),
                &params.context,
            );
            json!({ "scope_key": scope })
        }),
        Method::ResolveTrace => params::<TraceParams>(request.params).map(|params| {
            let trace_id = gate.resolve_recent_trace_id(
                &params.session_id,
                &params.tool_name,
                params.max_age_s.unwrap_or(DEFAULT_TRACE_MAX_AGE_S),
                params.ts.unwrap_or(now),
            );
            json!({ "trace_id": trace_id })
        }),
        Method::ApplyConfig => params::<serde_json::Map<String, Value>>(request.params)
            .and_then(|options| to_value(&gate.apply_gate_config(&options))),
        Method::GetConfig => to_value(&*gate.config()),
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(err) => Response::error_with_info(id, err),
    }
}

fn params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("missing_params", "params are required"))?;
    serde_json::from_value(params).map_err(|err| ErrorInfo::new("invalid_params", err.to_string()))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ErrorInfo> {
    serde_json::to_value(value).map_err(|err| ErrorInfo::new("serialize_failed", err.to_string()))
}
