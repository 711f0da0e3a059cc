//! Session cache keyed by identity signature.
//!
//! A session is expensive to stand up, so it is memoized until any
//! identity-relevant input changes: credential, provider, model id, base
//! endpoint, or working directory. A factory failure leaves the previous
//! cache entry untouched rather than storing a poisoned slot.

use std::path::PathBuf;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tokio::sync::Mutex;

use crate::backend::{AgentSession, BackendError, SessionFactory, SessionOptions};

/// Derived signature over a session's identity inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionSignature {
    api_key: Option<String>,
    provider: String,
    model: String,
    base_url: String,
    cwd: PathBuf,
}

impl SessionSignature {
    pub(crate) fn of(options: &SessionOptions) -> Self {
        Self {
            api_key: options
                .api_key
                .as_ref()
                .map(|key| key.expose_secret().to_string()),
            provider: options
                .model
                .as_ref()
                .map(|m| m.provider.clone())
                .unwrap_or_else(|| "anthropic".to_string()),
            model: options
                .model
                .as_ref()
                .map(|m| m.id.clone())
                .unwrap_or_else(|| "default".to_string()),
            base_url: options
                .model
                .as_ref()
                .map(|m| m.base_url.clone())
                .unwrap_or_default(),
            cwd: options.cwd.clone(),
        }
    }
}

struct CachedSession {
    signature: SessionSignature,
    session: Arc<dyn AgentSession>,
}

/// Lazily creates and memoizes the backend session.
pub struct SessionCache {
    factory: Arc<dyn SessionFactory>,
    slot: Mutex<Option<CachedSession>>,
}

impl SessionCache {
    /// Create a cache around the injected factory.
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached session if its signature matches, otherwise create
    /// and cache a new one. The slot is only replaced after the factory
    /// succeeds.
    pub async fn ensure(
        &self,
        options: &SessionOptions,
    ) -> Result<Arc<dyn AgentSession>, BackendError> {
        let signature = SessionSignature::of(options);

        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.signature == signature {
                return Ok(Arc::clone(&cached.session));
            }
        }

        let session = self.factory.create(options).await?;
        *slot = Some(CachedSession {
            signature,
            session: Arc::clone(&session),
        });
        Ok(session)
    }
}
