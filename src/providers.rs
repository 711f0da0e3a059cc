//! Provider settings injected by the settings surface.
//!
//! Persistence and editing of these values belong to the settings surface;
//! the orchestrator only reads a snapshot per run. The custom provider is
//! any OpenAI-completions compatible endpoint, with a convenience fixup for
//! local Ollama instances that are routinely configured without the `/v1`
//! path suffix.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Which backend provider serves prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActiveProvider {
    Claude,
    CustomOpenaiCompletions,
}

/// Settings for a custom OpenAI-completions compatible provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProviderSettings {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model_id: String,
}

/// Proxy configuration applied for the duration of one run.
///
/// Empty strings mean "unset": the corresponding environment key is removed
/// while the scope is active.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProxySettings {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

/// Snapshot of the provider configuration for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub active_provider: ActiveProvider,
    pub custom_provider: CustomProviderSettings,
    pub network_proxy: NetworkProxySettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            active_provider: ActiveProvider::Claude,
            custom_provider: CustomProviderSettings::default(),
            network_proxy: NetworkProxySettings::default(),
        }
    }
}

/// Read access to the active provider configuration.
pub trait SettingsProvider: Send + Sync {
    /// Snapshot the current settings.
    fn settings(&self) -> ProviderSettings;
}

/// Fixed settings, for the CLI front-end and tests.
pub struct StaticSettings(pub ProviderSettings);

impl SettingsProvider for StaticSettings {
    fn settings(&self) -> ProviderSettings {
        self.0.clone()
    }
}

/// Model identity resolved for a backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub base_url: String,
}

/// Whether the custom provider has the fields a session needs.
pub fn is_custom_provider_ready(settings: &ProviderSettings) -> bool {
    let custom = &settings.custom_provider;
    !custom.name.trim().is_empty() && !custom.base_url.trim().is_empty()
}

/// Build the model identity for the configured custom provider.
pub fn build_custom_model(settings: &ProviderSettings) -> ModelSpec {
    let custom = &settings.custom_provider;
    let model_id = match custom.model_id.trim() {
        "" => "gpt-4.1-mini",
        id => id,
    };
    let provider_name = match custom.name.trim() {
        "" => "custom-provider",
        name => name,
    };

    ModelSpec {
        id: model_id.to_string(),
        name: provider_name.to_string(),
        provider: "custom-openai-completions".to_string(),
        base_url: normalize_base_url(custom.base_url.trim()),
    }
}

/// Resolve the API key for a custom-provider session.
///
/// Falls back to the placeholder keys local endpoints expect: "ollama" for a
/// local Ollama base URL, "not-required" otherwise.
pub fn resolve_custom_api_key(settings: &ProviderSettings, model: &ModelSpec) -> SecretString {
    let configured = settings.custom_provider.api_key.trim();
    if !configured.is_empty() {
        return SecretString::from(configured.to_string());
    }
    if is_local_ollama_url(&model.base_url) {
        SecretString::from("ollama")
    } else {
        SecretString::from("not-required")
    }
}

/// True for a base URL pointing at a local Ollama instance.
pub fn is_local_ollama_url(base_url: &str) -> bool {
    match reqwest::Url::parse(base_url) {
        Ok(parsed) => {
            let local = matches!(parsed.host_str(), Some("127.0.0.1") | Some("localhost"));
            local && parsed.port() == Some(11434)
        }
        Err(_) => false,
    }
}

/// Append `/v1` to a bare local Ollama base URL; leave anything else alone.
fn normalize_base_url(base_url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(base_url) else {
        return base_url.to_string();
    };
    let bare_path = matches!(parsed.path(), "" | "/");
    if is_local_ollama_url(base_url) && bare_path {
        parsed.set_path("/v1");
        return parsed.to_string().trim_end_matches('/').to_string();
    }
    base_url.to_string()
}
