//! Heartbeat-driven capability capture.
//!
//! A periodic tick inspects the most recent completed turn and, when it
//! looks like a closed, reusable interaction, derives a capability proposal
//! for it. The proposal is held (at most one at a time) until the user's
//! next message resolves it: approval creates the capability, rejection
//! suppresses its fingerprint, anything else re-prompts. Duplicate
//! detection runs both before proposing and before creating, so the same
//! underlying content is proposed at most once and never created twice.
//!
//! Tick preconditions, checked in order: no run in flight, no proposal
//! already pending, history non-empty, latest turn old enough, user text
//! matching the closed-loop heuristic, non-empty normalized summary.
//! Failures inside a tick never surface to the user; they downgrade to a
//! skipped outcome with a reason.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::agent::capability::{
    CapabilityProposal, DuplicateReason, KnownCapabilities, detect_duplicate,
};
use crate::agent::runtime::AgentRuntime;

/// Configuration for the heartbeat runner.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ticks.
    pub interval: Duration,
    /// Whether the heartbeat loop runs at all.
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    /// Create a config with a specific interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Disable the heartbeat.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Why a tick proposed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RunActive,
    ProposalPending,
    NoHistory,
    RecentTurn,
    NotClosedLoop,
    EmptySummary,
    DuplicateCandidate,
    BackendUnavailable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RunActive => "run_active",
            SkipReason::ProposalPending => "proposal_pending",
            SkipReason::NoHistory => "no_history",
            SkipReason::RecentTurn => "recent_turn",
            SkipReason::NotClosedLoop => "not_closed_loop",
            SkipReason::EmptySummary => "empty_summary",
            SkipReason::DuplicateCandidate => "duplicate_candidate",
            SkipReason::BackendUnavailable => "backend_unavailable",
        }
    }
}

/// Local result of one heartbeat tick; never sent over the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatOutcome {
    Skipped {
        reason: SkipReason,
    },
    Proposed {
        skill_name: String,
        /// Text shown to the user, naming the skill and asking はい/いいえ.
        confirmation: String,
    },
}

/// Proposal-engine state, owned by the orchestrator behind one lock.
///
/// The structure enforces the machine's cardinality: `pending` is an
/// `Option`, so a second live proposal cannot exist.
#[derive(Default)]
pub struct ProposalState {
    pub(crate) pending: Option<CapabilityProposal>,
    pub(crate) suppressed: HashSet<String>,
    pub(crate) known: KnownCapabilities,
    /// The capability created by the most recent approval. Absorbs an
    /// immediately repeated approval with a duplicate acknowledgement;
    /// cleared by any other message.
    pub(crate) last_created: Option<(String, String)>,
}

impl ProposalState {
    /// Seed with the capability names known at startup.
    pub fn seeded(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            known: KnownCapabilities::seed(names),
            ..Self::default()
        }
    }

    pub(crate) fn duplicate_of(&self, proposal: &CapabilityProposal) -> Option<DuplicateReason> {
        detect_duplicate(proposal, &self.known, &self.suppressed)
    }

    pub(crate) fn suppress(&mut self, fingerprint: impl Into<String>) {
        self.suppressed.insert(fingerprint.into());
    }
}

const CLOSED_LOOP_EN: [&str; 8] = [
    "thanks",
    "thank you",
    "solved",
    "that worked",
    "works now",
    "done",
    "perfect",
    "what's next",
];

const CLOSED_LOOP_JA: [&str; 10] = [
    "ありがとう",
    "助かった",
    "助かりました",
    "解決",
    "できた",
    "できました",
    "完了",
    "動きました",
    "次は何",
    "ばっちり",
];

/// Best-effort heuristic for "this interaction closed successfully".
///
/// Keyword containment only; false positives and negatives are accepted
/// noise, not bugs to engineer away.
pub fn looks_closed_loop(user_text: &str) -> bool {
    let lowered = user_text.to_lowercase();
    CLOSED_LOOP_EN.iter().any(|kw| lowered.contains(kw))
        || CLOSED_LOOP_JA.iter().any(|kw| user_text.contains(kw))
}

const REJECTION_PREFIXES: [&str; 8] = [
    "いいえ",
    "いらない",
    "不要",
    "やめ",
    "キャンセル",
    "cancel",
    "stop",
    "no ",
];

/// Whether a reply to a pending proposal reads as a rejection.
///
/// Check this before [`is_approval`]: "いいえ" must not fall through to the
/// approval prefixes.
pub fn is_rejection(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    lowered == "no" || REJECTION_PREFIXES.iter().any(|kw| lowered.starts_with(kw))
}

const APPROVAL_PREFIXES: [&str; 9] = [
    "はい",
    "ええ",
    "うん",
    "お願い",
    "おねがい",
    "作成して",
    "いいよ",
    "yes",
    "sure",
];

/// Whether a reply to a pending proposal reads as an approval.
pub fn is_approval(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    lowered == "ok" || lowered == "y" || APPROVAL_PREFIXES.iter().any(|kw| lowered.starts_with(kw))
}

/// Confirmation shown when a proposal is first surfaced.
pub(crate) fn proposal_confirmation_text(proposal: &CapabilityProposal) -> String {
    format!(
        "スキル「{}」を作成しますか？ 内容: {}。よろしければ「はい」、不要なら「いいえ」と入力してください。",
        proposal.name, proposal.description
    )
}

/// Re-prompt shown when a reply was neither approval nor rejection.
pub(crate) fn reprompt_text(proposal: &CapabilityProposal) -> String {
    format!(
        "スキル「{}」の提案が保留中です。内容: {}。作成する場合は「はい」、取りやめる場合は「いいえ」と入力してください。",
        proposal.name, proposal.description
    )
}

/// Acknowledgement after a successful creation.
pub(crate) fn creation_confirmation_text(name: &str) -> String {
    format!("スキル「{name}」を作成しました。次回から同じ手順を再利用できます。")
}

/// Acknowledgement when the capability already exists.
pub(crate) fn duplicate_ack_text(name: &str) -> String {
    format!("スキル「{name}」は既に登録済みのため、新しく作成しませんでした。")
}

/// Acknowledgement after a rejection.
pub(crate) fn rejection_ack_text() -> &'static str {
    "承知しました。スキルは作成しません。"
}

/// Internal backend prompt that surfaces the proposal without creating it.
pub(crate) fn surface_prompt(proposal: &CapabilityProposal) -> String {
    format!(
        "直前の会話から再利用できそうな手順を検出しました。スキル名: {}。概要: {}。\
         この内容をユーザーに提案する準備をしてください。作成はまだ行わないでください。",
        proposal.name, proposal.summary
    )
}

/// Internal backend prompt that actually creates the capability.
pub(crate) fn creation_prompt(proposal: &CapabilityProposal) -> String {
    format!(
        "/skill:skill-creator\n\n次の手順をスキル「{}」として保存してください。概要: {}",
        proposal.name, proposal.summary
    )
}

/// Drives periodic heartbeat ticks against the orchestrator.
pub struct HeartbeatRunner {
    config: HeartbeatConfig,
    runtime: Arc<AgentRuntime>,
    notify_tx: Option<tokio::sync::mpsc::Sender<String>>,
}

impl HeartbeatRunner {
    /// Create a new runner.
    pub fn new(config: HeartbeatConfig, runtime: Arc<AgentRuntime>) -> Self {
        Self {
            config,
            runtime,
            notify_tx: None,
        }
    }

    /// Channel that receives the confirmation text of each new proposal.
    pub fn with_notify_channel(mut self, tx: tokio::sync::mpsc::Sender<String>) -> Self {
        self.notify_tx = Some(tx);
        self
    }

    /// Run the heartbeat loop. Runs forever once started.
    pub async fn run(&self) {
        if !self.config.enabled {
            tracing::info!("heartbeat disabled, not starting loop");
            return;
        }

        tracing::info!(interval = ?self.config.interval, "heartbeat loop started");

        let mut interval = tokio::time::interval(self.config.interval);
        // Don't run immediately on startup
        interval.tick().await;

        loop {
            interval.tick().await;
            match self.runtime.heartbeat_tick().await {
                HeartbeatOutcome::Skipped { reason } => {
                    tracing::debug!(reason = reason.as_str(), "heartbeat tick skipped");
                }
                HeartbeatOutcome::Proposed {
                    skill_name,
                    confirmation,
                } => {
                    tracing::info!(%skill_name, "heartbeat proposed a capability");
                    if let Some(tx) = &self.notify_tx {
                        if let Err(err) = tx.send(confirmation).await {
                            tracing::error!("failed to deliver proposal notification: {err}");
                        }
                    }
                }
            }
        }
    }
}

/// Spawn the heartbeat runner as a background task.
pub fn spawn_heartbeat(
    config: HeartbeatConfig,
    runtime: Arc<AgentRuntime>,
    notify_tx: Option<tokio::sync::mpsc::Sender<String>>,
) -> tokio::task::JoinHandle<()> {
    let mut runner = HeartbeatRunner::new(config, runtime);
    if let Some(tx) = notify_tx {
        runner = runner.with_notify_channel(tx);
    }
    tokio::spawn(async move {
        runner.run().await;
    })
}
