//! Scriptable in-process session for tests and mock mode.
//!
//! Plays a fixed event script (or a simple echo) into subscribed listeners
//! when prompted, and records every prompt it receives so tests can assert
//! what actually reached the backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{
    AgentSession, AssistantStreamEvent, BackendError, EventListener, SessionEvent, SessionFactory,
    SessionOptions, Subscription,
};

type ListenerMap = Arc<Mutex<HashMap<u64, EventListener>>>;

enum Behavior {
    /// Reply with "[mock] {prompt}" as a streamed text delta.
    Echo,
    /// Emit the same fixed event script on every prompt.
    Scripted(Vec<SessionEvent>),
    /// Fail the prompt call after emitting nothing.
    Failing(String),
}

/// In-process stand-in for a backend session.
pub struct MockSession {
    listeners: ListenerMap,
    next_listener_id: AtomicU64,
    behavior: Behavior,
    prompts: Mutex<Vec<String>>,
}

impl MockSession {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(0),
            behavior,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Echo the prompt back as a streamed reply.
    pub fn echo() -> Self {
        Self::with_behavior(Behavior::Echo)
    }

    /// Emit exactly `events` on each prompt call.
    pub fn scripted(events: Vec<SessionEvent>) -> Self {
        Self::with_behavior(Behavior::Scripted(events))
    }

    /// Fail every prompt call with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_behavior(Behavior::Failing(message.into()))
    }

    /// Prompts received so far, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("mock prompts lock").clone()
    }

    fn emit(&self, event: &SessionEvent) {
        let listeners: Vec<EventListener> = {
            let map = self.listeners.lock().expect("mock listeners lock");
            map.values().cloned().collect()
        };
        for listener in listeners {
            listener(event);
        }
    }
}

#[async_trait]
impl AgentSession for MockSession {
    async fn prompt(&self, text: &str) -> Result<(), BackendError> {
        self.prompts
            .lock()
            .expect("mock prompts lock")
            .push(text.to_string());

        match &self.behavior {
            Behavior::Echo => {
                self.emit(&SessionEvent::MessageUpdate {
                    event: Some(AssistantStreamEvent::TextDelta {
                        delta: Some(format!("[mock] {text}")),
                    }),
                });
                Ok(())
            }
            Behavior::Scripted(events) => {
                for event in events {
                    self.emit(event);
                }
                Ok(())
            }
            Behavior::Failing(message) => Err(BackendError::new(message.clone())),
        }
    }

    fn subscribe(&self, listener: EventListener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .expect("mock listeners lock")
            .insert(id, listener);

        let listeners = Arc::clone(&self.listeners);
        Subscription::new(move || {
            listeners.lock().expect("mock listeners lock").remove(&id);
        })
    }
}

/// Factory handing out echoing mock sessions.
pub struct MockSessionFactory;

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn create(
        &self,
        _options: &SessionOptions,
    ) -> Result<Arc<dyn AgentSession>, BackendError> {
        Ok(Arc::new(MockSession::echo()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_echo_streams_reply_to_listener() {
        let session = MockSession::echo();
        let seen: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = session.subscribe(Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));

        session.prompt("hello").await.unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            SessionEvent::MessageUpdate {
                event: Some(AssistantStreamEvent::TextDelta {
                    delta: Some("[mock] hello".into()),
                })
            }
        );
        assert_eq!(session.prompts(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_delivery() {
        let session = MockSession::echo();
        let seen: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = session.subscribe(Arc::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        drop(sub);

        session.prompt("hello").await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_session_surfaces_error() {
        let session = MockSession::failing("sdk boom");
        let err = session.prompt("x").await.unwrap_err();
        assert_eq!(err.message, "sdk boom");
    }
}
