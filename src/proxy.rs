//! Scoped proxy environment and pre-flight connectivity probe.
//!
//! Process-wide proxy environment variables are the one globally mutable
//! resource this crate touches. The scope guard snapshots the six
//! conventional keys, overwrites them for the duration of one run, and
//! restores the exact previous state (including absence) when dropped.
//! Because at most one run is in flight, scopes never overlap.

use std::ffi::OsString;

use crate::providers::NetworkProxySettings;

/// The six conventional proxy environment keys.
const PROXY_ENV_KEYS: [&str; 6] = [
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "NO_PROXY",
    "no_proxy",
];

/// Capability object holding the proxy environment scope.
///
/// Restores the captured values on drop, on every exit path. Hold it across
/// the entire backend call, including event delivery.
pub struct ScopedProxyEnv {
    previous: Vec<(&'static str, Option<OsString>)>,
}

impl ScopedProxyEnv {
    /// Snapshot the current proxy environment and overwrite it from `settings`.
    ///
    /// An empty configured value removes the key for the scope's duration.
    pub fn apply(settings: &NetworkProxySettings) -> Self {
        let entries: [(&'static str, &str); 6] = [
            ("HTTP_PROXY", settings.http_proxy.trim()),
            ("http_proxy", settings.http_proxy.trim()),
            ("HTTPS_PROXY", settings.https_proxy.trim()),
            ("https_proxy", settings.https_proxy.trim()),
            ("NO_PROXY", settings.no_proxy.trim()),
            ("no_proxy", settings.no_proxy.trim()),
        ];

        let mut previous = Vec::with_capacity(PROXY_ENV_KEYS.len());
        for (key, value) in entries {
            previous.push((key, std::env::var_os(key)));
            // SAFETY: env mutation is process-global; the single-flight guard
            // ensures no other run mutates or reads these keys concurrently.
            unsafe {
                if value.is_empty() {
                    std::env::remove_var(key);
                } else {
                    std::env::set_var(key, value);
                }
            }
        }

        Self { previous }
    }
}

impl Drop for ScopedProxyEnv {
    fn drop(&mut self) {
        for (key, value) in self.previous.drain(..) {
            // SAFETY: same discipline as in `apply`.
            unsafe {
                match value {
                    Some(value) => std::env::set_var(key, value),
                    None => std::env::remove_var(key),
                }
            }
        }
    }
}

/// Split a NO_PROXY value into normalized entries.
fn no_proxy_entries(no_proxy: &str) -> impl Iterator<Item = String> + '_ {
    no_proxy
        .split(',')
        .map(|entry| entry.trim().to_lowercase())
        .filter(|entry| !entry.is_empty())
}

/// Whether `hostname` is excluded from proxying by the NO_PROXY value.
///
/// Entries match exactly, or by domain suffix when they start with a dot;
/// `*` excludes everything.
pub fn bypasses_proxy(hostname: &str, no_proxy: &str) -> bool {
    let host = hostname.trim().to_lowercase();
    if host.is_empty() {
        return false;
    }
    no_proxy_entries(no_proxy).any(|entry| {
        if entry == "*" {
            true
        } else if entry.starts_with('.') {
            host.ends_with(&entry)
        } else {
            host == entry
        }
    })
}

/// Resolve the proxy URL to use for a target, if any.
pub fn resolve_proxy_for_target(target: &reqwest::Url, settings: &NetworkProxySettings) -> Option<String> {
    let host = target.host_str().unwrap_or_default();
    if bypasses_proxy(host, &settings.no_proxy) {
        return None;
    }
    let candidate = match target.scheme() {
        "https" => {
            let https = settings.https_proxy.trim();
            if https.is_empty() {
                settings.http_proxy.trim()
            } else {
                https
            }
        }
        "http" => settings.http_proxy.trim(),
        _ => "",
    };
    if candidate.is_empty() {
        None
    } else {
        Some(candidate.to_string())
    }
}

/// Pre-flight probe failure.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProxyProbeError {
    pub message: String,
}

impl ProxyProbeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Probe the configured probe URL through the run's proxy configuration.
///
/// Only plain-http probe URLs are supported; any non-2xx status or transport
/// error fails the probe. Runs before the backend session is touched.
pub async fn run_proxy_precheck(
    probe_url: &str,
    settings: &NetworkProxySettings,
) -> Result<(), ProxyProbeError> {
    let target = reqwest::Url::parse(probe_url)
        .map_err(|e| ProxyProbeError::new(format!("probe URL is invalid: {e}")))?;
    if target.scheme() != "http" {
        return Err(ProxyProbeError::new("プロキシ事前確認は http URL のみサポートします"));
    }

    let mut builder = reqwest::Client::builder().timeout(std::time::Duration::from_secs(10));
    builder = match resolve_proxy_for_target(&target, settings) {
        Some(proxy_url) => {
            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| ProxyProbeError::new(format!("proxy URL is invalid: {e}")))?;
            builder.proxy(proxy)
        }
        None => builder.no_proxy(),
    };
    let client = builder
        .build()
        .map_err(|e| ProxyProbeError::new(format!("probe client build failed: {e}")))?;

    let response = client
        .get(target)
        .send()
        .await
        .map_err(|e| ProxyProbeError::new(format!("proxy precheck failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProxyProbeError::new(format!(
        "proxy precheck failed: status={} body={}",
        status.as_u16(),
        body.trim()
    )))
}

/// Lock shared by every test that touches the process environment.
#[cfg(test)]
pub(crate) static ENV_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Snapshot the six proxy keys, for byte-for-byte restoration assertions.
#[cfg(test)]
pub(crate) fn proxy_env_snapshot() -> Vec<(&'static str, Option<OsString>)> {
    PROXY_ENV_KEYS
        .iter()
        .map(|key| (*key, std::env::var_os(key)))
        .collect()
}
