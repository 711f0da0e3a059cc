//! Core orchestration logic.
//!
//! The agent runtime owns:
//! - Single-flight prompt execution against the backend session
//! - Event normalization onto the loop protocol
//! - The bounded conversation history ring
//! - Heartbeat-driven capability proposals with explicit approval

pub mod capability;
pub mod heartbeat;
pub mod history;
pub mod normalizer;
pub mod runtime;

pub use capability::{CapabilityProposal, KnownCapabilities};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatOutcome, HeartbeatRunner, SkipReason, spawn_heartbeat,
};
pub use history::{ConversationRing, ConversationTurn};
pub use normalizer::EventNormalizer;
pub use runtime::{AgentRuntime, RuntimeConfig, RuntimeDeps};
