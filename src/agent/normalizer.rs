//! Normalizes the backend's native event stream for one prompt call.
//!
//! Subscribed for exactly the duration of the call (the subscription guard
//! drops on every exit path), the normalizer forwards protocol events to an
//! optional sink and accumulates the assistant's reply. Two quirks of the
//! backend are flattened here:
//!
//! - thinking text arrives either as incremental deltas or as one aggregate
//!   block on end-of-thinking; exactly one representation is forwarded,
//! - reply text arrives as deltas, a `text_end` block, or a final `done`
//!   message; the final message always wins over accumulated deltas so a
//!   mid-stream correction never leaves a garbled answer.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use crate::backend::{
    AssistantStreamEvent, EventListener, MessageRole, SessionEvent, extract_text,
};
use crate::protocol::LoopEvent;

/// Receives normalized protocol events.
pub type LoopEventSink = Arc<dyn Fn(LoopEvent) + Send + Sync>;

/// Notice used when the backend produced no reply text at all.
pub const EMPTY_REPLY_NOTICE: &str = "エージェント応答は空でした。";

#[derive(Default)]
struct NormalizerState {
    /// Whether the current thinking block produced any incremental delta.
    thinking_delta_seen: bool,
    /// Reply text accumulated from streaming deltas.
    stream_output: String,
    /// Reply text from a terminal block; takes precedence over deltas.
    final_output: Option<String>,
}

/// Translates native session events into protocol events for one request.
pub struct EventNormalizer {
    request_id: String,
    sink: Option<LoopEventSink>,
    state: Mutex<NormalizerState>,
}

impl EventNormalizer {
    /// Create a normalizer for one prompt call.
    pub fn new(request_id: impl Into<String>, sink: Option<LoopEventSink>) -> Arc<Self> {
        Arc::new(Self {
            request_id: request_id.into(),
            sink,
            state: Mutex::new(NormalizerState::default()),
        })
    }

    /// Listener to hand to [`crate::backend::AgentSession::subscribe`].
    ///
    /// The backend event source is outside this crate's control, so a panic
    /// in handling must never cross the callback boundary: it is swallowed
    /// and logged.
    pub fn listener(self: &Arc<Self>) -> EventListener {
        let normalizer = Arc::clone(self);
        Arc::new(move |event: &SessionEvent| {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                normalizer.handle_event(event);
            }));
            if outcome.is_err() {
                tracing::error!(request_id = %normalizer.request_id, "event normalization panicked");
            }
        })
    }

    /// Resolve the reply text after the prompt call returns.
    pub fn output(&self) -> String {
        let state = self.state.lock().expect("normalizer state lock");
        let output = match &state.final_output {
            Some(final_output) if !final_output.trim().is_empty() => final_output.clone(),
            _ => state.stream_output.clone(),
        };
        if output.trim().is_empty() {
            EMPTY_REPLY_NOTICE.to_string()
        } else {
            output
        }
    }

    fn forward(&self, event: LoopEvent) {
        if let Some(sink) = &self.sink {
            sink(event);
        }
    }

    fn handle_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::ThinkingStart => {
                self.state.lock().expect("normalizer state lock").thinking_delta_seen = false;
                self.forward(LoopEvent::ThinkingStart {
                    request_id: self.request_id.clone(),
                });
            }

            SessionEvent::ThinkingDelta { delta: Some(delta) } if !delta.is_empty() => {
                self.state.lock().expect("normalizer state lock").thinking_delta_seen = true;
                self.forward(LoopEvent::ThinkingDelta {
                    request_id: self.request_id.clone(),
                    delta: delta.clone(),
                });
            }
            SessionEvent::ThinkingDelta { .. } => {}

            SessionEvent::ThinkingEnd { content } => {
                let delta_seen = self
                    .state
                    .lock()
                    .expect("normalizer state lock")
                    .thinking_delta_seen;
                // Synthesize one delta from the aggregate block only when no
                // incremental delta covered this block.
                if !delta_seen {
                    if let Some(content) = content {
                        if !content.is_empty() {
                            self.forward(LoopEvent::ThinkingDelta {
                                request_id: self.request_id.clone(),
                                delta: content.clone(),
                            });
                        }
                    }
                }
                self.forward(LoopEvent::ThinkingEnd {
                    request_id: self.request_id.clone(),
                });
            }

            SessionEvent::ToolExecutionStart {
                tool_call_id: Some(tool_call_id),
                tool_name: Some(tool_name),
                args,
            } => {
                self.forward(LoopEvent::ToolExecutionStart {
                    request_id: self.request_id.clone(),
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    args: args.clone(),
                });
            }
            SessionEvent::ToolExecutionStart { .. } => {}

            SessionEvent::ToolExecutionEnd {
                tool_call_id: Some(tool_call_id),
                tool_name: Some(tool_name),
                is_error,
            } => {
                self.forward(LoopEvent::ToolExecutionEnd {
                    request_id: self.request_id.clone(),
                    tool_call_id: tool_call_id.clone(),
                    tool_name: tool_name.clone(),
                    is_error: *is_error == Some(true),
                });
            }
            SessionEvent::ToolExecutionEnd { .. } => {}

            SessionEvent::MessageUpdate { event: Some(stream) } => match stream {
                AssistantStreamEvent::TextDelta { delta: Some(delta) } => {
                    let mut state = self.state.lock().expect("normalizer state lock");
                    state.stream_output.push_str(delta);
                }
                AssistantStreamEvent::TextEnd {
                    content: Some(content),
                } => {
                    let mut state = self.state.lock().expect("normalizer state lock");
                    if state.stream_output.is_empty() {
                        state.final_output = Some(content.clone());
                    }
                }
                AssistantStreamEvent::Done { message } => {
                    let text = message
                        .as_ref()
                        .map(|m| extract_text(&m.content))
                        .unwrap_or_default();
                    let mut state = self.state.lock().expect("normalizer state lock");
                    // The final message corrects whatever streamed before it.
                    state.final_output = Some(text);
                }
                _ => {}
            },
            SessionEvent::MessageUpdate { event: None } => {}

            SessionEvent::MessageEnd {
                message: Some(message),
            } => {
                if message.role == Some(MessageRole::Assistant) {
                    let text = extract_text(&message.content);
                    if !text.is_empty() {
                        let mut state = self.state.lock().expect("normalizer state lock");
                        state.final_output = Some(text);
                    }
                }
            }
            SessionEvent::MessageEnd { message: None } => {}

            SessionEvent::Unknown => {}
        }
    }
}

/// Convenience for tests and embedders: capture forwarded events in memory.
pub fn capturing_sink() -> (LoopEventSink, Arc<Mutex<Vec<LoopEvent>>>) {
    let captured: Arc<Mutex<Vec<LoopEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_target = Arc::clone(&captured);
    let sink: LoopEventSink = Arc::new(move |event| {
        sink_target.lock().expect("capture lock").push(event);
    });
    (sink, captured)
}
