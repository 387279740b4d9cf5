use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_STORAGE_KEY: &str = "albert-chat-session-id";

/// Backend connection settings. An empty endpoint means no backend is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            preset: None,
            title: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            storage_key: default_storage_key(),
        }
    }
}

impl ServiceConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
        .normalized()
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self.normalized()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self.normalized()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_storage_key(mut self, storage_key: impl Into<String>) -> Self {
        self.storage_key = storage_key.into();
        self.normalized()
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoint.is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn normalized(mut self) -> Self {
        self.endpoint = normalize_endpoint(&self.endpoint);
        self.preset = non_blank(self.preset);
        self.title = non_blank(self.title);
        self.storage_key = if self.storage_key.trim().is_empty() {
            default_storage_key()
        } else {
            self.storage_key.trim().to_string()
        };
        self
    }
}

/// Strips surrounding whitespace and trailing slashes so paths can be appended verbatim.
pub fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_loses_trailing_slashes() {
        let config = ServiceConfig::new("  https://example.test/albert/chat///  ");
        assert_eq!(config.endpoint, "https://example.test/albert/chat");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn blank_optional_fields_are_dropped() {
        let config = ServiceConfig::new("http://x")
            .with_preset("  ")
            .with_title(" Support ")
            .with_storage_key("");

        assert_eq!(config.preset, None);
        assert_eq!(config.title.as_deref(), Some("Support"));
        assert_eq!(config.storage_key, DEFAULT_STORAGE_KEY);
    }
}
