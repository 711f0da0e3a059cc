//! The orchestrator core.
//!
//! One `AgentRuntime` owns one logical backend session and everything
//! stateful around it: the single-flight run guard, the session cache, the
//! conversation history ring, and the heartbeat proposal state. Prompts are
//! processed strictly serially; the heartbeat's own backend calls take the
//! same guard, so a user prompt submitted during a tick's internal call is
//! rejected as busy rather than interleaved.
//!
//! All failures are captured here and returned as structured results; no
//! error type escapes to the chat surface as a panic.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use uuid::Uuid;

use crate::agent::capability::{CapabilityProposal, wants_browser_skill, wants_skill_creator};
use crate::agent::heartbeat::{
    self, HeartbeatOutcome, ProposalState, SkipReason, is_approval, is_rejection,
};
use crate::agent::history::{ConversationRing, ConversationTurn, DEFAULT_HISTORY_CAPACITY};
use crate::agent::normalizer::{EventNormalizer, LoopEventSink};
use crate::auth::{AuthPhase, AuthProvider};
use crate::backend::cache::SessionCache;
use crate::backend::{SessionFactory, SessionOptions};
use crate::error::AgentError;
use crate::events::LoopEventBroadcaster;
use crate::protocol::{LoopEvent, RunEndStatus, validate_prompt};
use crate::providers::{
    ActiveProvider, ProviderSettings, SettingsProvider, build_custom_model,
    is_custom_provider_ready, resolve_custom_api_key,
};
use crate::proxy::{ScopedProxyEnv, run_proxy_precheck};

/// Tunables for one orchestrator instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Working directory backend sessions operate in.
    pub workspace_dir: PathBuf,
    /// Plain-http URL probed before each run; `None` disables the precheck.
    pub proxy_probe_url: Option<String>,
    /// Minimum age of the latest turn before the heartbeat may propose.
    pub proposal_delay: Duration,
    /// Conversation history ring capacity.
    pub history_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("."),
            proxy_probe_url: None,
            proposal_delay: Duration::from_secs(60),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Collaborators an orchestrator needs injected.
pub struct RuntimeDeps {
    pub factory: Arc<dyn SessionFactory>,
    pub auth: Arc<dyn AuthProvider>,
    pub settings: Arc<dyn SettingsProvider>,
    /// Capability names known at startup.
    pub known_capabilities: Vec<String>,
    pub config: RuntimeConfig,
}

/// Clears the in-flight flag on every exit path.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Session orchestrator between the chat surface and the backend.
pub struct AgentRuntime {
    sessions: SessionCache,
    auth: Arc<dyn AuthProvider>,
    settings: Arc<dyn SettingsProvider>,
    broadcaster: Arc<LoopEventBroadcaster>,
    config: RuntimeConfig,
    in_flight: AtomicBool,
    history: Mutex<ConversationRing>,
    proposals: Mutex<ProposalState>,
}

impl AgentRuntime {
    /// Build a runtime from its collaborators.
    pub fn new(deps: RuntimeDeps) -> Self {
        Self {
            sessions: SessionCache::new(deps.factory),
            auth: deps.auth,
            settings: deps.settings,
            broadcaster: Arc::new(LoopEventBroadcaster::new()),
            history: Mutex::new(ConversationRing::new(deps.config.history_capacity)),
            proposals: Mutex::new(ProposalState::seeded(deps.known_capabilities)),
            config: deps.config,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Stream of loop events, for a surface to fold with the reducer.
    pub fn events(&self) -> impl Stream<Item = LoopEvent> + Send + 'static + use<> {
        self.broadcaster.subscribe()
    }

    /// Whether a run is currently in flight.
    pub fn run_active(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn try_begin_run(&self) -> Result<RunGuard<'_>, AgentError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| AgentError::Busy)?;
        Ok(RunGuard {
            flag: &self.in_flight,
        })
    }

    /// Submit one user prompt.
    ///
    /// A pending capability proposal intercepts the message first; explicit
    /// `/`-prefixed invocations bypass the interception. Everything else
    /// runs through the single-flight guard and the backend session.
    pub async fn submit_prompt(&self, text: &str) -> Result<String, AgentError> {
        validate_prompt(text)?;

        let settings = self.settings.settings();
        tracing::info!(
            text_len = text.len(),
            provider = ?settings.active_provider,
            "agent_prompt_received"
        );

        if let Some(reply) = self.intercept_pending_proposal(text).await? {
            return Ok(reply);
        }

        self.run_user_prompt(text, &settings).await
    }

    async fn run_user_prompt(
        &self,
        text: &str,
        settings: &ProviderSettings,
    ) -> Result<String, AgentError> {
        // Busy rejection happens before any other side effect: no session,
        // no proxy scope, no event emission.
        let guard = self.try_begin_run()?;

        let request_id = Uuid::new_v4().to_string();
        self.broadcaster.emit(LoopEvent::RunStart {
            request_id: request_id.clone(),
        });

        let prompt = self.prompt_with_skill_hint(text);
        let result = self
            .prompt_backend(&prompt, settings, Some(&request_id))
            .await;

        match &result {
            Ok(reply) => {
                self.broadcaster.emit(LoopEvent::RunEnd {
                    request_id: request_id.clone(),
                    status: RunEndStatus::Completed,
                    error_message: None,
                });
                self.append_turn(text, reply);
                tracing::info!(%request_id, reply_len = reply.len(), "agent_prompt_completed");
            }
            Err(err) => {
                self.broadcaster.emit(LoopEvent::RunEnd {
                    request_id: request_id.clone(),
                    status: RunEndStatus::Failed,
                    error_message: Some(err.to_string()),
                });
                tracing::error!(%request_id, code = err.code(), "agent_prompt_failed");
            }
        }

        drop(guard);
        result
    }

    /// Resolve the session identity for the active provider.
    async fn resolve_session_options(
        &self,
        settings: &ProviderSettings,
    ) -> Result<SessionOptions, AgentError> {
        match settings.active_provider {
            ActiveProvider::CustomOpenaiCompletions => {
                if !is_custom_provider_ready(settings) {
                    return Err(AgentError::ProviderConfigRequired {
                        message: "Custom Provider を使うには name と baseUrl の設定が必要です。"
                            .to_string(),
                    });
                }
                let model = build_custom_model(settings);
                let api_key = resolve_custom_api_key(settings, &model);
                Ok(SessionOptions {
                    api_key: Some(api_key),
                    model: Some(model),
                    cwd: self.config.workspace_dir.clone(),
                })
            }
            ActiveProvider::Claude => {
                if self.auth.phase() != AuthPhase::Authenticated {
                    return Err(AgentError::AuthRequired {
                        message: "Claude を利用するには OAuth 認証が必要です。".to_string(),
                    });
                }
                let api_key = self.auth.api_key().await.ok_or_else(|| AgentError::AuthRequired {
                    message: "認証情報を取得できませんでした。再認証してください。".to_string(),
                })?;
                Ok(SessionOptions {
                    api_key: Some(api_key),
                    model: None,
                    cwd: self.config.workspace_dir.clone(),
                })
            }
        }
    }

    /// One backend call: configuration, pre-flight probe, scoped proxy
    /// environment, cached session, normalized event stream.
    ///
    /// Callers must hold the run guard. `request_id` is `Some` for
    /// user-visible runs; internal heartbeat calls pass `None` and emit no
    /// loop events.
    async fn prompt_backend(
        &self,
        text: &str,
        settings: &ProviderSettings,
        request_id: Option<&str>,
    ) -> Result<String, AgentError> {
        let options = self.resolve_session_options(settings).await?;

        if let Some(probe_url) = &self.config.proxy_probe_url {
            run_proxy_precheck(probe_url, &settings.network_proxy)
                .await
                .map_err(|err| AgentError::ProxyConnectionFailed {
                    message: err.message,
                })?;
        }

        // The scope covers the whole call, event delivery included.
        let _proxy_scope = ScopedProxyEnv::apply(&settings.network_proxy);

        let session = self
            .sessions
            .ensure(&options)
            .await
            .map_err(|err| AgentError::ExecutionFailed {
                message: err.message,
                details: err.details,
            })?;

        let sink: Option<LoopEventSink> = request_id.map(|_| {
            let broadcaster = Arc::clone(&self.broadcaster);
            Arc::new(move |event: LoopEvent| broadcaster.emit(event)) as LoopEventSink
        });
        let normalizer = EventNormalizer::new(request_id.unwrap_or("internal"), sink);

        let prompt_result = {
            let _subscription = session.subscribe(normalizer.listener());
            session.prompt(text).await
            // Subscription drops here on success and failure alike.
        };
        prompt_result.map_err(|err| AgentError::ExecutionFailed {
            message: err.message,
            details: err.details,
        })?;

        Ok(normalizer.output())
    }

    /// Prefix the prompt with a skill invocation when the request clearly
    /// calls for an installed capability. Explicit invocations pass through.
    fn prompt_with_skill_hint(&self, text: &str) -> String {
        if text.trim_start().starts_with("/skill:") {
            return text.to_string();
        }

        let proposals = self.proposals.lock().expect("proposal state lock");
        if proposals.known.contains_name("skill-creator") && wants_skill_creator(text) {
            return format!("/skill:skill-creator\n\n{text}");
        }
        if proposals.known.contains_name("agent-browser") && wants_browser_skill(text) {
            return format!("/skill:agent-browser\n\n{text}");
        }
        text.to_string()
    }

    fn append_turn(&self, user_text: &str, assistant_text: &str) {
        self.history
            .lock()
            .expect("history lock")
            .push(ConversationTurn {
                user_text: user_text.to_string(),
                assistant_text: assistant_text.to_string(),
                completed_at: Utc::now(),
            });
    }

    /// Handle a message while a proposal is pending (or just resolved).
    ///
    /// Returns `Ok(Some(reply))` when the message was consumed by the
    /// approval machine and must not reach normal prompt handling.
    async fn intercept_pending_proposal(
        &self,
        text: &str,
    ) -> Result<Option<String>, AgentError> {
        let trimmed = text.trim();
        // Explicit direct invocation always wins over a pending proposal.
        if trimmed.starts_with('/') {
            return Ok(None);
        }

        let pending = {
            let state = self.proposals.lock().expect("proposal state lock");
            state.pending.clone()
        };

        let Some(proposal) = pending else {
            // A repeated approval right after a creation gets a duplicate
            // acknowledgement instead of reaching the backend; any other
            // message ends that grace period.
            let absorbed = {
                let mut state = self.proposals.lock().expect("proposal state lock");
                if is_approval(trimmed) {
                    state.last_created.take().map(|(name, _)| name)
                } else {
                    state.last_created = None;
                    None
                }
            };
            if let Some(name) = absorbed {
                let reply = heartbeat::duplicate_ack_text(&name);
                self.append_turn(text, &reply);
                tracing::info!(skill = %name, "repeated approval absorbed as duplicate");
                return Ok(Some(reply));
            }
            return Ok(None);
        };

        // Rejection first: "いいえ" must never read as an approval.
        if is_rejection(trimmed) {
            {
                let mut state = self.proposals.lock().expect("proposal state lock");
                state.suppress(proposal.fingerprint.clone());
                state.pending = None;
            }
            let reply = heartbeat::rejection_ack_text().to_string();
            self.append_turn(text, &reply);
            tracing::info!(skill = %proposal.name, "proposal rejected");
            return Ok(Some(reply));
        }

        if is_approval(trimmed) {
            // State may have changed since proposing; re-check duplicates.
            let duplicate = {
                let state = self.proposals.lock().expect("proposal state lock");
                state.duplicate_of(&proposal)
            };
            if duplicate.is_some() {
                {
                    let mut state = self.proposals.lock().expect("proposal state lock");
                    state.suppress(proposal.fingerprint.clone());
                    state.pending = None;
                }
                let reply = heartbeat::duplicate_ack_text(&proposal.name);
                self.append_turn(text, &reply);
                tracing::info!(skill = %proposal.name, "approved proposal was already known");
                return Ok(Some(reply));
            }

            let settings = self.settings.settings();
            let guard = self.try_begin_run()?;
            let creation = self
                .prompt_backend(&heartbeat::creation_prompt(&proposal), &settings, None)
                .await;
            drop(guard);

            return match creation {
                Ok(_) => {
                    {
                        let mut state = self.proposals.lock().expect("proposal state lock");
                        state
                            .known
                            .register(proposal.name.clone(), proposal.fingerprint.clone());
                        state.pending = None;
                        state.last_created =
                            Some((proposal.name.clone(), proposal.fingerprint.clone()));
                    }
                    let reply = heartbeat::creation_confirmation_text(&proposal.name);
                    self.append_turn(text, &reply);
                    tracing::info!(skill = %proposal.name, "capability created");
                    Ok(Some(reply))
                }
                Err(err) => {
                    // The proposal stays pending so the user can retry.
                    tracing::error!(skill = %proposal.name, code = err.code(), "capability creation failed");
                    Err(err)
                }
            };
        }

        // Neither approval nor rejection: re-display and keep waiting. The
        // message is not otherwise processed.
        let reply = heartbeat::reprompt_text(&proposal);
        self.append_turn(text, &reply);
        Ok(Some(reply))
    }

    /// One heartbeat tick of the proposal engine.
    ///
    /// Never surfaces an error: anything that goes wrong downgrades to a
    /// skipped outcome with a reason.
    pub async fn heartbeat_tick(&self) -> HeartbeatOutcome {
        if self.run_active() {
            return HeartbeatOutcome::Skipped {
                reason: SkipReason::RunActive,
            };
        }
        if self
            .proposals
            .lock()
            .expect("proposal state lock")
            .pending
            .is_some()
        {
            return HeartbeatOutcome::Skipped {
                reason: SkipReason::ProposalPending,
            };
        }

        let Some(turn) = self.history.lock().expect("history lock").latest().cloned() else {
            return HeartbeatOutcome::Skipped {
                reason: SkipReason::NoHistory,
            };
        };

        let min_age = chrono::Duration::from_std(self.config.proposal_delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        if Utc::now().signed_duration_since(turn.completed_at) < min_age {
            return HeartbeatOutcome::Skipped {
                reason: SkipReason::RecentTurn,
            };
        }

        if !heartbeat::looks_closed_loop(&turn.user_text) {
            return HeartbeatOutcome::Skipped {
                reason: SkipReason::NotClosedLoop,
            };
        }

        let Some(proposal) = CapabilityProposal::from_summary(&turn.assistant_text, Utc::now())
        else {
            return HeartbeatOutcome::Skipped {
                reason: SkipReason::EmptySummary,
            };
        };

        {
            let mut state = self.proposals.lock().expect("proposal state lock");
            if let Some(reason) = state.duplicate_of(&proposal) {
                state.suppress(proposal.fingerprint.clone());
                tracing::debug!(skill = %proposal.name, ?reason, "duplicate candidate suppressed");
                return HeartbeatOutcome::Skipped {
                    reason: SkipReason::DuplicateCandidate,
                };
            }
        }

        // Surface the proposal through one internal backend call; it creates
        // nothing. The run guard keeps user prompts out while it is live.
        let settings = self.settings.settings();
        let surfacing = match self.try_begin_run() {
            Ok(guard) => {
                let result = self
                    .prompt_backend(&heartbeat::surface_prompt(&proposal), &settings, None)
                    .await;
                drop(guard);
                result
            }
            Err(_) => {
                return HeartbeatOutcome::Skipped {
                    reason: SkipReason::RunActive,
                };
            }
        };
        if let Err(err) = surfacing {
            tracing::warn!(code = err.code(), "proposal surfacing call failed");
            return HeartbeatOutcome::Skipped {
                reason: SkipReason::BackendUnavailable,
            };
        }

        let confirmation = heartbeat::proposal_confirmation_text(&proposal);
        let skill_name = proposal.name.clone();
        {
            let mut state = self.proposals.lock().expect("proposal state lock");
            state.last_created = None;
            state.pending = Some(proposal);
        }
        tracing::info!(%skill_name, "capability proposed");
        HeartbeatOutcome::Proposed {
            skill_name,
            confirmation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use secrecy::ExposeSecret;
    use tokio::sync::Notify;

    use crate::auth::StaticAuth;
    use crate::backend::mock::MockSession;
    use crate::backend::{
        AgentSession, AssistantMessage, AssistantStreamEvent, BackendError, ContentBlock,
        EventListener, MessageContent, MessageRole, SessionEvent, Subscription,
    };
    use crate::providers::{CustomProviderSettings, StaticSettings};
    use crate::proxy::{ENV_TEST_LOCK, proxy_env_snapshot};

    struct FixedFactory {
        session: Arc<dyn AgentSession>,
        created: AtomicUsize,
        last_options: Mutex<Option<SessionOptions>>,
    }

    impl FixedFactory {
        fn new(session: Arc<dyn AgentSession>) -> Arc<Self> {
            Arc::new(Self {
                session,
                created: AtomicUsize::new(0),
                last_options: Mutex::new(None),
            })
        }

        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionFactory for FixedFactory {
        async fn create(
            &self,
            options: &SessionOptions,
        ) -> Result<Arc<dyn AgentSession>, BackendError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            *self.last_options.lock().unwrap() = Some(options.clone());
            Ok(Arc::clone(&self.session))
        }
    }

    /// Session whose prompt call blocks until released, for busy-path tests.
    struct GatedSession {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl AgentSession for GatedSession {
        async fn prompt(&self, _text: &str) -> Result<(), BackendError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }

        fn subscribe(&self, _listener: EventListener) -> Subscription {
            Subscription::new(|| {})
        }
    }

    /// Session that records the proxy environment observed mid-call.
    struct EnvProbeSession {
        seen_https_proxy: Mutex<Option<String>>,
        fail: bool,
    }

    #[async_trait]
    impl AgentSession for EnvProbeSession {
        async fn prompt(&self, _text: &str) -> Result<(), BackendError> {
            *self.seen_https_proxy.lock().unwrap() = std::env::var("HTTPS_PROXY").ok();
            if self.fail {
                return Err(BackendError::new("sdk boom"));
            }
            Ok(())
        }

        fn subscribe(&self, _listener: EventListener) -> Subscription {
            Subscription::new(|| {})
        }
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            proposal_delay: Duration::ZERO,
            ..RuntimeConfig::default()
        }
    }

    fn build_runtime(
        session: Arc<dyn AgentSession>,
        settings: ProviderSettings,
        auth: StaticAuth,
        known: Vec<String>,
        config: RuntimeConfig,
    ) -> (Arc<AgentRuntime>, Arc<FixedFactory>) {
        let factory = FixedFactory::new(session);
        let runtime = Arc::new(AgentRuntime::new(RuntimeDeps {
            factory: Arc::clone(&factory) as Arc<dyn SessionFactory>,
            auth: Arc::new(auth),
            settings: Arc::new(StaticSettings(settings)),
            known_capabilities: known,
            config,
        }));
        (runtime, factory)
    }

    fn default_runtime(session: Arc<dyn AgentSession>) -> (Arc<AgentRuntime>, Arc<FixedFactory>) {
        build_runtime(
            session,
            ProviderSettings::default(),
            StaticAuth::authenticated("oauth-api-key"),
            Vec::new(),
            fast_config(),
        )
    }

    fn closed_turn(assistant_text: &str) -> ConversationTurn {
        ConversationTurn {
            user_text: "ありがとう、解決しました".to_string(),
            assistant_text: assistant_text.to_string(),
            completed_at: Utc::now() - chrono::Duration::seconds(120),
        }
    }

    fn push_turn(runtime: &AgentRuntime, turn: ConversationTurn) {
        runtime.history.lock().unwrap().push(turn);
    }

    async fn next_events(
        stream: &mut (impl Stream<Item = LoopEvent> + Unpin),
        n: usize,
    ) -> Vec<LoopEvent> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(stream.next().await.expect("expected another loop event"));
        }
        out
    }

    async fn assert_no_more_events(stream: &mut (impl Stream<Item = LoopEvent> + Unpin)) {
        let outcome = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(outcome.is_err(), "unexpected extra event: {outcome:?}");
    }

    fn creation_calls(session: &MockSession) -> usize {
        session
            .prompts()
            .iter()
            .filter(|p| p.starts_with("/skill:skill-creator"))
            .count()
    }

    // ==================== single-flight ====================

    #[tokio::test]
    async fn test_second_prompt_is_busy_with_no_side_effects() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let session = Arc::new(GatedSession {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        let (runtime, factory) = default_runtime(session);
        let mut events = Box::pin(runtime.events());

        let first = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.submit_prompt("first").await })
        };
        started.notified().await;

        let err = runtime.submit_prompt("second").await.unwrap_err();
        assert_eq!(err.code(), "AGENT_BUSY");
        assert!(err.retryable());
        // The rejected prompt created no session and left the first run alone.
        assert_eq!(factory.created(), 1);

        release.notify_one();
        first.await.unwrap().unwrap();

        let seen = next_events(&mut events, 2).await;
        assert!(matches!(seen[0], LoopEvent::RunStart { .. }));
        assert!(matches!(
            seen[1],
            LoopEvent::RunEnd {
                status: RunEndStatus::Completed,
                ..
            }
        ));
        // The busy rejection emitted nothing.
        assert_no_more_events(&mut events).await;
    }

    // ==================== run lifecycle ====================

    #[tokio::test]
    async fn test_run_emits_normalized_events_in_order() {
        let session = Arc::new(MockSession::scripted(vec![
            SessionEvent::ThinkingStart,
            SessionEvent::ThinkingEnd {
                content: Some("X".into()),
            },
            SessionEvent::ToolExecutionStart {
                tool_call_id: Some("call-1".into()),
                tool_name: Some("bash".into()),
                args: None,
            },
            SessionEvent::ToolExecutionEnd {
                tool_call_id: Some("call-1".into()),
                tool_name: Some("bash".into()),
                is_error: Some(false),
            },
            SessionEvent::MessageUpdate {
                event: Some(AssistantStreamEvent::TextDelta {
                    delta: Some("partial".into()),
                }),
            },
            SessionEvent::MessageUpdate {
                event: Some(AssistantStreamEvent::Done {
                    message: Some(AssistantMessage {
                        role: Some(MessageRole::Assistant),
                        content: MessageContent::Blocks(vec![ContentBlock::Text {
                            text: "final".into(),
                        }]),
                    }),
                }),
            },
        ]));
        let (runtime, _factory) = default_runtime(session);
        let mut events = Box::pin(runtime.events());

        let reply = runtime.submit_prompt("test").await.unwrap();
        assert_eq!(reply, "final");

        let seen = next_events(&mut events, 7).await;
        let request_id = seen[0].request_id().to_string();
        assert!(matches!(seen[0], LoopEvent::RunStart { .. }));
        assert!(matches!(seen[1], LoopEvent::ThinkingStart { .. }));
        assert_eq!(
            seen[2],
            LoopEvent::ThinkingDelta {
                request_id: request_id.clone(),
                delta: "X".into(),
            }
        );
        assert!(matches!(seen[3], LoopEvent::ThinkingEnd { .. }));
        assert!(matches!(seen[4], LoopEvent::ToolExecutionStart { .. }));
        assert!(matches!(
            seen[5],
            LoopEvent::ToolExecutionEnd { is_error: false, .. }
        ));
        assert_eq!(
            seen[6],
            LoopEvent::RunEnd {
                request_id: request_id.clone(),
                status: RunEndStatus::Completed,
                error_message: None,
            }
        );
        // Every event belongs to the same run.
        assert!(seen.iter().all(|e| e.request_id() == request_id));

        // The stream round-trips through the client-side reducer.
        let state = seen.iter().fold(
            crate::loop_state::LoopState::initial(),
            |state, event| crate::loop_state::reduce(&state, event),
        );
        assert_eq!(state.status, crate::loop_state::LoopVisualStatus::Completed);
        assert!(state.active_tools.is_empty());
        assert_eq!(state.request_id.as_deref(), Some(request_id.as_str()));

        // The completed turn landed in history exactly once.
        let history = runtime.history.lock().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.latest().unwrap().assistant_text, "final");
    }

    #[tokio::test]
    async fn test_backend_failure_becomes_structured_result() {
        let session = Arc::new(MockSession::failing("sdk boom"));
        let (runtime, _factory) = default_runtime(session);
        let mut events = Box::pin(runtime.events());

        let err = runtime.submit_prompt("test").await.unwrap_err();
        assert_eq!(err.code(), "AGENT_EXECUTION_FAILED");
        assert!(err.retryable());

        let seen = next_events(&mut events, 2).await;
        match &seen[1] {
            LoopEvent::RunEnd {
                status,
                error_message,
                ..
            } => {
                assert_eq!(*status, RunEndStatus::Failed);
                assert_eq!(error_message.as_deref(), Some("sdk boom"));
            }
            other => panic!("expected run_end, got {other:?}"),
        }

        // Failed runs never append history.
        assert!(runtime.history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected() {
        let (runtime, factory) = default_runtime(Arc::new(MockSession::echo()));
        let err = runtime.submit_prompt("   \n").await.unwrap_err();
        assert_eq!(err.code(), "EMPTY_PROMPT");
        assert_eq!(factory.created(), 0);
    }

    // ==================== provider and auth resolution ====================

    #[tokio::test]
    async fn test_unauthenticated_returns_auth_required_without_session() {
        let (runtime, factory) = build_runtime(
            Arc::new(MockSession::echo()),
            ProviderSettings::default(),
            StaticAuth::unauthenticated(),
            Vec::new(),
            fast_config(),
        );
        let err = runtime.submit_prompt("test").await.unwrap_err();
        assert_eq!(err.code(), "AUTH_REQUIRED");
        assert!(err.retryable());
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_custom_provider_is_rejected() {
        let settings = ProviderSettings {
            active_provider: ActiveProvider::CustomOpenaiCompletions,
            ..ProviderSettings::default()
        };
        let (runtime, factory) = build_runtime(
            Arc::new(MockSession::echo()),
            settings,
            StaticAuth::authenticated("unused"),
            Vec::new(),
            fast_config(),
        );
        let err = runtime.submit_prompt("test").await.unwrap_err();
        assert_eq!(err.code(), "PROVIDER_CONFIG_REQUIRED");
        assert_eq!(factory.created(), 0);
    }

    #[tokio::test]
    async fn test_custom_provider_model_reaches_factory() {
        let settings = ProviderSettings {
            active_provider: ActiveProvider::CustomOpenaiCompletions,
            custom_provider: CustomProviderSettings {
                name: "my-custom".into(),
                base_url: "https://example.com/v1".into(),
                api_key: "custom-key".into(),
                model_id: "gpt-4o-mini".into(),
            },
            ..ProviderSettings::default()
        };
        let (runtime, factory) = build_runtime(
            Arc::new(MockSession::echo()),
            settings,
            StaticAuth::unauthenticated(),
            Vec::new(),
            fast_config(),
        );

        let reply = runtime.submit_prompt("test").await.unwrap();
        assert_eq!(reply, "[mock] test");

        let options = factory.last_options.lock().unwrap().clone().unwrap();
        let model = options.model.unwrap();
        assert_eq!(model.id, "gpt-4o-mini");
        assert_eq!(model.provider, "custom-openai-completions");
        assert_eq!(model.base_url, "https://example.com/v1");
        assert_eq!(options.api_key.unwrap().expose_secret(), "custom-key");
    }

    // ==================== proxy scoping ====================

    #[tokio::test]
    async fn test_proxy_env_scoped_and_restored_on_success_and_failure() {
        let _env = ENV_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before = proxy_env_snapshot();

        let settings = ProviderSettings {
            network_proxy: crate::providers::NetworkProxySettings {
                http_proxy: "http://scoped:3128".into(),
                https_proxy: "http://scoped:3129".into(),
                no_proxy: "localhost".into(),
            },
            ..ProviderSettings::default()
        };

        // Success path: the scoped value is visible inside the backend call.
        let session = Arc::new(EnvProbeSession {
            seen_https_proxy: Mutex::new(None),
            fail: false,
        });
        let (runtime, _factory) = build_runtime(
            Arc::clone(&session) as Arc<dyn AgentSession>,
            settings.clone(),
            StaticAuth::authenticated("k"),
            Vec::new(),
            fast_config(),
        );
        runtime.submit_prompt("test").await.unwrap();
        assert_eq!(
            session.seen_https_proxy.lock().unwrap().as_deref(),
            Some("http://scoped:3129")
        );
        assert_eq!(proxy_env_snapshot(), before);

        // Failure path restores just the same.
        let failing = Arc::new(EnvProbeSession {
            seen_https_proxy: Mutex::new(None),
            fail: true,
        });
        let (runtime, _factory) = build_runtime(
            Arc::clone(&failing) as Arc<dyn AgentSession>,
            settings,
            StaticAuth::authenticated("k"),
            Vec::new(),
            fast_config(),
        );
        runtime.submit_prompt("test").await.unwrap_err();
        assert_eq!(proxy_env_snapshot(), before);
    }

    // ==================== skill hints ====================

    #[tokio::test]
    async fn test_browser_requests_get_skill_prefix_when_installed() {
        let session = Arc::new(MockSession::echo());
        let (runtime, _factory) = build_runtime(
            Arc::clone(&session) as Arc<dyn AgentSession>,
            ProviderSettings::default(),
            StaticAuth::authenticated("k"),
            vec!["agent-browser".to_string()],
            fast_config(),
        );

        runtime.submit_prompt("ブラウザで動作確認して").await.unwrap();
        let prompts = session.prompts();
        assert!(prompts[0].starts_with("/skill:agent-browser"));
    }

    #[tokio::test]
    async fn test_no_skill_prefix_without_installed_skill() {
        let session = Arc::new(MockSession::echo());
        let (runtime, _factory) = default_runtime(Arc::clone(&session) as Arc<dyn AgentSession>);

        runtime.submit_prompt("ブラウザで動作確認して").await.unwrap();
        assert_eq!(session.prompts(), vec!["ブラウザで動作確認して".to_string()]);
    }

    // ==================== heartbeat ticks ====================

    #[tokio::test]
    async fn test_tick_skips_without_history() {
        let (runtime, _factory) = default_runtime(Arc::new(MockSession::echo()));
        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::NoHistory
            }
        );
    }

    #[tokio::test]
    async fn test_tick_skips_recent_turn() {
        let config = RuntimeConfig {
            proposal_delay: Duration::from_secs(3600),
            ..RuntimeConfig::default()
        };
        let (runtime, _factory) = build_runtime(
            Arc::new(MockSession::echo()),
            ProviderSettings::default(),
            StaticAuth::authenticated("k"),
            Vec::new(),
            config,
        );
        push_turn(
            &runtime,
            ConversationTurn {
                completed_at: Utc::now(),
                ..closed_turn("Fetched the page title")
            },
        );
        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::RecentTurn
            }
        );
    }

    #[tokio::test]
    async fn test_tick_skips_open_loop_turn() {
        let (runtime, _factory) = default_runtime(Arc::new(MockSession::echo()));
        push_turn(
            &runtime,
            ConversationTurn {
                user_text: "open the settings page".to_string(),
                ..closed_turn("opened it")
            },
        );
        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::NotClosedLoop
            }
        );
    }

    #[tokio::test]
    async fn test_tick_skips_empty_summary() {
        let (runtime, _factory) = default_runtime(Arc::new(MockSession::echo()));
        push_turn(&runtime, closed_turn("!!! ... ---"));
        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::EmptySummary
            }
        );
    }

    #[tokio::test]
    async fn test_tick_skips_while_run_active() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let session = Arc::new(GatedSession {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });
        let (runtime, _factory) = default_runtime(session);
        push_turn(&runtime, closed_turn("Fetched the page title"));

        let pending = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move { runtime.submit_prompt("slow request").await })
        };
        started.notified().await;

        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::RunActive
            }
        );

        release.notify_one();
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tick_proposes_once_then_reports_pending() {
        let session = Arc::new(MockSession::echo());
        let (runtime, _factory) = default_runtime(Arc::clone(&session) as Arc<dyn AgentSession>);
        push_turn(&runtime, closed_turn("Fetched the page title: Example Domain"));

        let outcome = runtime.heartbeat_tick().await;
        let HeartbeatOutcome::Proposed {
            skill_name,
            confirmation,
        } = outcome
        else {
            panic!("expected a proposal, got {outcome:?}");
        };
        assert!(confirmation.contains(&skill_name));
        assert!(confirmation.contains("はい"));
        assert!(confirmation.contains("いいえ"));
        // The surfacing call reached the backend but created nothing.
        assert_eq!(session.prompts().len(), 1);
        assert_eq!(creation_calls(&session), 0);

        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::ProposalPending
            }
        );
    }

    #[tokio::test]
    async fn test_tick_surfacing_failure_downgrades_to_skip() {
        let session = Arc::new(MockSession::failing("sdk down"));
        let (runtime, _factory) = default_runtime(session);
        push_turn(&runtime, closed_turn("Fetched the page title"));

        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::BackendUnavailable
            }
        );
        // Nothing is pending; a later tick may retry.
        assert!(runtime.proposals.lock().unwrap().pending.is_none());
    }

    // ==================== approval machine ====================

    async fn propose(runtime: &Arc<AgentRuntime>, summary: &str) -> String {
        push_turn(runtime, closed_turn(summary));
        match runtime.heartbeat_tick().await {
            HeartbeatOutcome::Proposed { skill_name, .. } => skill_name,
            other => panic!("expected proposal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_suppresses_fingerprint() {
        let session = Arc::new(MockSession::echo());
        let (runtime, _factory) = default_runtime(Arc::clone(&session) as Arc<dyn AgentSession>);
        propose(&runtime, "Fetched the page title: Example Domain").await;

        let backend_calls_before = session.prompts().len();
        let reply = runtime.submit_prompt("いいえ").await.unwrap();
        assert_eq!(reply, "承知しました。スキルは作成しません。");
        // Rejection never touches the backend.
        assert_eq!(session.prompts().len(), backend_calls_before);
        assert!(runtime.proposals.lock().unwrap().pending.is_none());

        // The same content is never proposed again.
        push_turn(&runtime, closed_turn("Fetched the page title: Example Domain"));
        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::DuplicateCandidate
            }
        );
    }

    #[tokio::test]
    async fn test_ambiguous_reply_reprompts_and_keeps_proposal() {
        let session = Arc::new(MockSession::echo());
        let (runtime, _factory) = default_runtime(Arc::clone(&session) as Arc<dyn AgentSession>);
        let skill_name = propose(&runtime, "Fetched the page title: Example Domain").await;

        let backend_calls_before = session.prompts().len();
        let reply = runtime.submit_prompt("それって何？").await.unwrap();
        assert!(reply.contains(&skill_name));
        assert!(reply.contains("保留中"));
        // The ambiguous message is not otherwise processed.
        assert_eq!(session.prompts().len(), backend_calls_before);
        assert!(runtime.proposals.lock().unwrap().pending.is_some());
    }

    #[tokio::test]
    async fn test_slash_command_bypasses_interception() {
        let session = Arc::new(MockSession::echo());
        let (runtime, _factory) = default_runtime(Arc::clone(&session) as Arc<dyn AgentSession>);
        let _ = propose(&runtime, "Fetched the page title: Example Domain").await;

        let reply = runtime.submit_prompt("/skill:agent-browser check it").await.unwrap();
        assert_eq!(reply, "[mock] /skill:agent-browser check it");
        // The proposal is still live afterwards.
        assert!(runtime.proposals.lock().unwrap().pending.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_dedup_never_creates_twice() {
        let session = Arc::new(MockSession::echo());
        let (runtime, _factory) = default_runtime(Arc::clone(&session) as Arc<dyn AgentSession>);
        let skill_name = propose(&runtime, "Fetched the page title: Example Domain").await;

        let reply = runtime.submit_prompt("はい").await.unwrap();
        assert!(reply.contains("作成しました"));
        assert_eq!(creation_calls(&session), 1);
        assert!(
            runtime
                .proposals
                .lock()
                .unwrap()
                .known
                .contains_name(&skill_name)
        );

        // A later tick deriving the same fingerprint is suppressed without
        // prompting or creating.
        push_turn(&runtime, closed_turn("Fetched the page title: Example Domain"));
        assert_eq!(
            runtime.heartbeat_tick().await,
            HeartbeatOutcome::Skipped {
                reason: SkipReason::DuplicateCandidate
            }
        );
        assert_eq!(creation_calls(&session), 1);
    }

    // ==================== end-to-end scenario ====================

    #[tokio::test]
    async fn test_capture_scenario_in_japanese() {
        let session = Arc::new(MockSession::echo());
        let (runtime, _factory) = default_runtime(Arc::clone(&session) as Arc<dyn AgentSession>);

        let reply = runtime
            .submit_prompt("Open https://example.com and return the title")
            .await
            .unwrap();
        assert_eq!(reply, "[mock] Open https://example.com and return the title");

        let reply = runtime.submit_prompt("次は何をすればいい？").await.unwrap();
        assert!(reply.starts_with("[mock]"));

        // Past the delay threshold, the tick proposes from the latest turn.
        let outcome = runtime.heartbeat_tick().await;
        let HeartbeatOutcome::Proposed {
            skill_name,
            confirmation,
        } = outcome
        else {
            panic!("expected proposal, got {outcome:?}");
        };
        assert!(confirmation.contains(&skill_name));
        assert!(confirmation.contains("はい"));
        assert!(confirmation.contains("いいえ"));

        // Approval creates the capability and registers it.
        let reply = runtime.submit_prompt("はい").await.unwrap();
        assert!(reply.contains("作成しました"));
        assert_eq!(creation_calls(&session), 1);
        assert!(
            runtime
                .proposals
                .lock()
                .unwrap()
                .known
                .contains_name(&skill_name)
        );

        // A repeated approval is absorbed; no second creation call happens.
        let reply = runtime.submit_prompt("はい").await.unwrap();
        assert!(reply.contains("既に登録済み"));
        assert_eq!(creation_calls(&session), 1);
    }
}
