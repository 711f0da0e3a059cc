//! Process configuration from the environment.
//!
//! Every knob has a `SWITCHBOARD_*` environment key and a CLI flag; `.env`
//! files are honored when present. Provider settings configured here feed
//! the static settings provider the CLI front-end uses — an embedding
//! application would supply its own [`crate::providers::SettingsProvider`].

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::agent::{HeartbeatConfig, RuntimeConfig};
use crate::providers::{
    ActiveProvider, CustomProviderSettings, NetworkProxySettings, ProviderSettings,
};

#[derive(Debug, Clone, Parser)]
#[command(name = "switchboard", about = "Session orchestrator for a conversational agent backend")]
pub struct Config {
    /// Seconds between heartbeat ticks.
    #[arg(long, env = "SWITCHBOARD_HEARTBEAT_INTERVAL_SECS", default_value_t = 120)]
    pub heartbeat_interval_secs: u64,

    /// Disable the heartbeat loop entirely.
    #[arg(long, env = "SWITCHBOARD_HEARTBEAT_DISABLED", default_value_t = false)]
    pub heartbeat_disabled: bool,

    /// Minimum age (seconds) of the latest turn before a proposal.
    #[arg(long, env = "SWITCHBOARD_PROPOSAL_DELAY_SECS", default_value_t = 60)]
    pub proposal_delay_secs: u64,

    /// Conversation history ring capacity.
    #[arg(long, env = "SWITCHBOARD_HISTORY_CAPACITY", default_value_t = 24)]
    pub history_capacity: usize,

    /// Working directory for backend sessions. Defaults to
    /// `~/.switchboard/workspace`.
    #[arg(long, env = "SWITCHBOARD_WORKSPACE_DIR")]
    pub workspace_dir: Option<PathBuf>,

    /// Plain-http URL probed through the proxy before each run.
    #[arg(long, env = "SWITCHBOARD_PROXY_TEST_URL")]
    pub proxy_test_url: Option<String>,

    /// HTTP proxy applied for the duration of each run.
    #[arg(long, env = "SWITCHBOARD_HTTP_PROXY", default_value = "")]
    pub http_proxy: String,

    /// HTTPS proxy applied for the duration of each run.
    #[arg(long, env = "SWITCHBOARD_HTTPS_PROXY", default_value = "")]
    pub https_proxy: String,

    /// Comma-separated NO_PROXY entries.
    #[arg(long, env = "SWITCHBOARD_NO_PROXY", default_value = "")]
    pub no_proxy: String,

    /// API key for the default provider.
    #[arg(long, env = "SWITCHBOARD_API_KEY")]
    pub api_key: Option<String>,
}

impl Config {
    /// Resolved working directory for backend sessions.
    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".switchboard")
                .join("workspace")
        })
    }

    /// Runtime tunables derived from this config.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            workspace_dir: self.workspace_dir(),
            proxy_probe_url: self.proxy_test_url.clone(),
            proposal_delay: Duration::from_secs(self.proposal_delay_secs),
            history_capacity: self.history_capacity,
        }
    }

    /// Heartbeat tunables derived from this config.
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        let config = HeartbeatConfig::default()
            .with_interval(Duration::from_secs(self.heartbeat_interval_secs));
        if self.heartbeat_disabled {
            config.disabled()
        } else {
            config
        }
    }

    /// Provider settings for the static settings provider.
    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            active_provider: ActiveProvider::Claude,
            custom_provider: CustomProviderSettings::default(),
            network_proxy: NetworkProxySettings {
                http_proxy: self.http_proxy.clone(),
                https_proxy: self.https_proxy.clone(),
                no_proxy: self.no_proxy.clone(),
            },
        }
    }
}
