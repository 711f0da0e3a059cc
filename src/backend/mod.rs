//! Backend session boundary.
//!
//! The backend is an opaque, long-running conversational agent reached
//! through an injected [`SessionFactory`]. Its native event stream is
//! loosely shaped upstream; this module closes it into the tagged
//! [`SessionEvent`] union so nothing downstream ever inspects raw shapes.
//! Fields the backend may omit stay `Option` here — the normalizer is the
//! single place that decides what incomplete events mean.

pub mod cache;
pub mod mock;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::providers::ModelSpec;

/// Failure from the backend session or its factory.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub details: Option<String>,
}

impl BackendError {
    /// A failure with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    /// Attach backend-side detail (stack, response body).
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Inputs that determine a session's identity.
#[derive(Clone)]
pub struct SessionOptions {
    /// Credential for the session, if the provider needs one.
    pub api_key: Option<SecretString>,
    /// Model identity; `None` means the backend's default model.
    pub model: Option<ModelSpec>,
    /// Working directory the session operates in.
    pub cwd: PathBuf,
}

/// Role of a backend message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

/// One block of assistant message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    #[serde(other)]
    Unknown,
}

/// Assistant message content: the backend sends either a bare string or an
/// array of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

/// A complete backend message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub role: Option<MessageRole>,
    #[serde(default)]
    pub content: MessageContent,
}

/// Flatten message content into plain text.
///
/// Text and thinking blocks both contribute; unknown blocks are skipped.
pub fn extract_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => {
            let mut out = String::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => out.push_str(text),
                    ContentBlock::Thinking { thinking } => out.push_str(thinking),
                    ContentBlock::Unknown => {}
                }
            }
            out
        }
    }
}

/// Streaming sub-event inside a `message_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantStreamEvent {
    TextDelta {
        #[serde(default)]
        delta: Option<String>,
    },
    TextEnd {
        #[serde(default)]
        content: Option<String>,
    },
    Done {
        #[serde(default)]
        message: Option<AssistantMessage>,
    },
    #[serde(other)]
    Unknown,
}

/// Closed union of the backend's native events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    ThinkingStart,
    ThinkingDelta {
        #[serde(default)]
        delta: Option<String>,
    },
    /// End of a thinking block, optionally carrying the aggregate text.
    ThinkingEnd {
        #[serde(default)]
        content: Option<String>,
    },
    ToolExecutionStart {
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        args: Option<Value>,
    },
    ToolExecutionEnd {
        #[serde(default)]
        tool_call_id: Option<String>,
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        is_error: Option<bool>,
    },
    MessageUpdate {
        #[serde(default, rename = "assistantMessageEvent")]
        event: Option<AssistantStreamEvent>,
    },
    MessageEnd {
        #[serde(default)]
        message: Option<AssistantMessage>,
    },
    #[serde(other)]
    Unknown,
}

/// Listener invoked for every backend event during a prompt call.
pub type EventListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// RAII subscription handle; unsubscribes when dropped.
///
/// Dropping the handle is the guaranteed-cleanup path: the normalizer keeps
/// it alive across the prompt call and releases it on every exit, thrown
/// errors included.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap an unsubscribe action.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// One live backend session.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Run one prompt to completion. Events arrive through subscribed
    /// listeners while this call is outstanding.
    async fn prompt(&self, text: &str) -> Result<(), BackendError>;

    /// Register a listener for native events.
    fn subscribe(&self, listener: EventListener) -> Subscription;
}

/// Creates backend sessions on demand.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Construct a session for the given identity inputs.
    async fn create(&self, options: &SessionOptions) -> Result<Arc<dyn AgentSession>, BackendError>;
}
