//! Wire protocol between the orchestrator and the chat surface.
//!
//! The loop event stream is a closed set of variants, delivered in emission
//! order over a single channel. The surface folds them with the pure reducer
//! in [`crate::loop_state`]; nothing downstream ever inspects raw backend
//! event shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, ErrorPayload};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEndStatus {
    Completed,
    Failed,
    Aborted,
}

/// Events emitted to the chat surface while a run executes.
///
/// Every event carries the request id of the run it belongs to so a late
/// event from a superseded run can be discarded by the reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LoopEvent {
    RunStart {
        request_id: String,
    },
    ThinkingStart {
        request_id: String,
    },
    ThinkingDelta {
        request_id: String,
        delta: String,
    },
    ThinkingEnd {
        request_id: String,
    },
    ToolExecutionStart {
        request_id: String,
        tool_call_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
    ToolExecutionEnd {
        request_id: String,
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
    },
    RunEnd {
        request_id: String,
        status: RunEndStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
}

impl LoopEvent {
    /// Request id this event belongs to.
    pub fn request_id(&self) -> &str {
        match self {
            LoopEvent::RunStart { request_id }
            | LoopEvent::ThinkingStart { request_id }
            | LoopEvent::ThinkingDelta { request_id, .. }
            | LoopEvent::ThinkingEnd { request_id }
            | LoopEvent::ToolExecutionStart { request_id, .. }
            | LoopEvent::ToolExecutionEnd { request_id, .. }
            | LoopEvent::RunEnd { request_id, .. } => request_id,
        }
    }
}

/// Prompt submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub text: String,
}

/// Prompt submission result in wire form.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SubmitResponse {
    Ok { ok: bool, text: String },
    Err { ok: bool, error: ErrorPayload },
}

impl SubmitResponse {
    /// Build the wire response from an orchestrator result.
    pub fn from_result(result: Result<String, AgentError>) -> Self {
        match result {
            Ok(text) => SubmitResponse::Ok { ok: true, text },
            Err(err) => SubmitResponse::Err {
                ok: false,
                error: err.payload(),
            },
        }
    }
}

/// Validate a submitted prompt before any orchestration work happens.
pub fn validate_prompt(text: &str) -> Result<(), AgentError> {
    if text.trim().is_empty() {
        return Err(AgentError::EmptyPrompt);
    }
    Ok(())
}
