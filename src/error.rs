//! Error taxonomy for the orchestrator boundary.
//!
//! Every failure is captured before it reaches the chat surface and turned
//! into a structured payload with a stable code and a retryable flag. No
//! error type here ever crosses the boundary as a raw panic or exception.

use serde::Serialize;
use thiserror::Error;

/// Failures the orchestrator reports to the chat surface.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A run is already in flight; concurrency violation, never a backend fault.
    #[error("別のリクエストを処理中です。完了後に再試行してください。")]
    Busy,

    /// The submitted payload was malformed.
    #[error("{message}")]
    InvalidRequest { message: String },

    /// The prompt text was empty after trimming.
    #[error("text が空です")]
    EmptyPrompt,

    /// Credential absent or rejected; retryable after re-authentication.
    #[error("{message}")]
    AuthRequired { message: String },

    /// Provider configuration is missing or incomplete.
    #[error("{message}")]
    ProviderConfigRequired { message: String },

    /// Pre-flight proxy probe failed; environment problem, not retryable as-is.
    #[error("プロキシ接続の事前確認に失敗しました: {message}")]
    ProxyConnectionFailed { message: String },

    /// Any exception out of the backend session, message preserved.
    #[error("{message}")]
    ExecutionFailed {
        message: String,
        details: Option<String>,
    },
}

impl AgentError {
    /// Wrap an arbitrary backend failure with the generic retryable code.
    pub fn execution(err: impl std::fmt::Display) -> Self {
        AgentError::ExecutionFailed {
            message: err.to_string(),
            details: None,
        }
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Busy => "AGENT_BUSY",
            AgentError::InvalidRequest { .. } => "INVALID_REQUEST",
            AgentError::EmptyPrompt => "EMPTY_PROMPT",
            AgentError::AuthRequired { .. } => "AUTH_REQUIRED",
            AgentError::ProviderConfigRequired { .. } => "PROVIDER_CONFIG_REQUIRED",
            AgentError::ProxyConnectionFailed { .. } => "PROXY_CONNECTION_FAILED",
            AgentError::ExecutionFailed { .. } => "AGENT_EXECUTION_FAILED",
        }
    }

    /// Whether the caller may retry without operator intervention.
    pub fn retryable(&self) -> bool {
        match self {
            AgentError::Busy
            | AgentError::AuthRequired { .. }
            | AgentError::ProviderConfigRequired { .. }
            | AgentError::ExecutionFailed { .. } => true,
            AgentError::InvalidRequest { .. }
            | AgentError::EmptyPrompt
            | AgentError::ProxyConnectionFailed { .. } => false,
        }
    }

    /// Serialize into the wire payload shape.
    pub fn payload(&self) -> ErrorPayload {
        let details = match self {
            AgentError::ExecutionFailed { details, .. } => details.clone(),
            _ => None,
        };
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            details,
            retryable: self.retryable(),
        }
    }
}

/// Wire form of an orchestrator failure.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub retryable: bool,
}
