use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "https://aiplatform.googleapis.com";
pub const DEFAULT_LOCATION: &str = "global";
pub const DEFAULT_PROBE_MODEL: &str = "gemini-2.6-pro";

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("no vertex express keys configured")]
    NoBackendKeys,
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Shared secret callers must present. `None` disables caller auth.
    pub proxy_api_key: Option<String>,
    /// Backend Vertex Express keys, in rotation order.
    pub backend_keys: Vec<String>,
    pub base_url: String,
    pub location: String,
    /// Model used by the project id probe.
    pub probe_model: String,
    pub call_timeout: Duration,
    pub stream_idle_timeout: Duration,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy_api_key: Option<String>,
    pub backend_keys: Option<Vec<String>>,
    pub base_url: Option<String>,
    pub location: Option<String>,
    pub probe_model: Option<String>,
    pub call_timeout: Option<Duration>,
    pub stream_idle_timeout: Option<Duration>,
    pub proxy: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.proxy_api_key.is_some() {
            self.proxy_api_key = other.proxy_api_key;
        }
        if other.backend_keys.is_some() {
            self.backend_keys = other.backend_keys;
        }
        if other.base_url.is_some() {
            self.base_url = other.base_url;
        }
        if other.location.is_some() {
            self.location = other.location;
        }
        if other.probe_model.is_some() {
            self.probe_model = other.probe_model;
        }
        if other.call_timeout.is_some() {
            self.call_timeout = other.call_timeout;
        }
        if other.stream_idle_timeout.is_some() {
            self.stream_idle_timeout = other.stream_idle_timeout;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let backend_keys = self
            .backend_keys
            .ok_or(GlobalConfigError::MissingField("backend_keys"))?;
        if backend_keys.is_empty() {
            return Err(GlobalConfigError::NoBackendKeys);
        }
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(7860),
            proxy_api_key: self.proxy_api_key.filter(|key| !key.is_empty()),
            backend_keys,
            base_url: self
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            location: self
                .location
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            probe_model: self
                .probe_model
                .unwrap_or_else(|| DEFAULT_PROBE_MODEL.to_string()),
            call_timeout: self.call_timeout.unwrap_or(Duration::from_secs(120)),
            stream_idle_timeout: self
                .stream_idle_timeout
                .unwrap_or(Duration::from_secs(300)),
            proxy: self.proxy.filter(|proxy| !proxy.trim().is_empty()),
        })
    }
}

/// Splits a delimiter-separated key list, dropping blank entries.
pub fn split_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}
