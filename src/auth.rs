//! Credential provider seam.
//!
//! OAuth flows and token persistence live in the auth surface; the
//! orchestrator only asks two questions per run: what phase is the
//! credential in, and what API key should the session use.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of the user credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Unauthenticated,
    AuthInProgress,
    AwaitingCode,
    Authenticated,
    AuthFailed,
}

/// Read access to the user credential.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current credential phase.
    fn phase(&self) -> AuthPhase;

    /// API key for the active credential, if one is available.
    async fn api_key(&self) -> Option<SecretString>;
}

/// Fixed credential, for the CLI front-end and tests.
pub struct StaticAuth {
    phase: AuthPhase,
    api_key: Option<SecretString>,
}

impl StaticAuth {
    /// An authenticated credential with the given key.
    pub fn authenticated(api_key: impl Into<String>) -> Self {
        Self {
            phase: AuthPhase::Authenticated,
            api_key: Some(SecretString::from(api_key.into())),
        }
    }

    /// An unauthenticated credential.
    pub fn unauthenticated() -> Self {
        Self {
            phase: AuthPhase::Unauthenticated,
            api_key: None,
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    fn phase(&self) -> AuthPhase {
        self.phase
    }

    async fn api_key(&self) -> Option<SecretString> {
        self.api_key.clone()
    }
}
