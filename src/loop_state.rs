//! Pure reducer folding the loop event stream into visible run state.
//!
//! The chat surface keeps one [`LoopState`] and feeds every received event
//! through [`reduce`]. A `run_start` adopts the new request id
//! unconditionally; every other event is ignored unless it belongs to the
//! current request, which is what keeps a stale event from a superseded run
//! out of the newer run's state.

use crate::protocol::{LoopEvent, RunEndStatus};

/// Visual status of the orchestrated loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVisualStatus {
    Idle,
    Running,
    Completed,
    Failed,
}

/// One currently executing tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTool {
    pub tool_call_id: String,
    pub tool_name: String,
}

/// Run state as the surface displays it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    pub request_id: Option<String>,
    pub status: LoopVisualStatus,
    pub active_tools: Vec<ActiveTool>,
    pub last_error: Option<String>,
}

impl LoopState {
    /// State before any run has started.
    pub fn initial() -> Self {
        Self {
            request_id: None,
            status: LoopVisualStatus::Idle,
            active_tools: Vec::new(),
            last_error: None,
        }
    }

    fn is_current(&self, request_id: &str) -> bool {
        match &self.request_id {
            None => true,
            Some(current) => current == request_id,
        }
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::initial()
    }
}

/// Fold one event into the state. Pure; never mutates its input.
pub fn reduce(state: &LoopState, event: &LoopEvent) -> LoopState {
    match event {
        LoopEvent::RunStart { request_id } => LoopState {
            request_id: Some(request_id.clone()),
            status: LoopVisualStatus::Running,
            active_tools: Vec::new(),
            last_error: None,
        },

        LoopEvent::ThinkingStart { request_id }
        | LoopEvent::ThinkingDelta { request_id, .. }
        | LoopEvent::ThinkingEnd { request_id } => {
            if !state.is_current(request_id) {
                return state.clone();
            }
            LoopState {
                request_id: Some(request_id.clone()),
                status: LoopVisualStatus::Running,
                ..state.clone()
            }
        }

        LoopEvent::ToolExecutionStart {
            request_id,
            tool_call_id,
            tool_name,
            ..
        } => {
            if !state.is_current(request_id) {
                return state.clone();
            }
            let mut active_tools = state.active_tools.clone();
            // Idempotent by call id: a re-delivered start never duplicates.
            if !active_tools.iter().any(|t| &t.tool_call_id == tool_call_id) {
                active_tools.push(ActiveTool {
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                });
            }
            LoopState {
                request_id: Some(request_id.clone()),
                status: LoopVisualStatus::Running,
                active_tools,
                last_error: state.last_error.clone(),
            }
        }

        LoopEvent::ToolExecutionEnd {
            request_id,
            tool_call_id,
            ..
        } => {
            if !state.is_current(request_id) {
                return state.clone();
            }
            let active_tools = state
                .active_tools
                .iter()
                .filter(|t| &t.tool_call_id != tool_call_id)
                .cloned()
                .collect();
            LoopState {
                request_id: Some(request_id.clone()),
                status: LoopVisualStatus::Running,
                active_tools,
                last_error: state.last_error.clone(),
            }
        }

        LoopEvent::RunEnd {
            request_id,
            status,
            error_message,
        } => {
            if !state.is_current(request_id) {
                return state.clone();
            }
            LoopState {
                request_id: Some(request_id.clone()),
                status: if *status == RunEndStatus::Completed {
                    LoopVisualStatus::Completed
                } else {
                    LoopVisualStatus::Failed
                },
                active_tools: Vec::new(),
                last_error: error_message.clone(),
            }
        }
    }
}
