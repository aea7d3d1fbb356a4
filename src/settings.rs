use std::collections::BTreeMap;
use std::time::Duration;

use crate::transport::DEFAULT_TIMEOUT;

pub const VERIFY_SSL_KEY: &str = "verify_ssl";
pub const HTTP_TIMEOUT_KEY: &str = "http_timeout";
pub const HTTP_RETRIES_KEY: &str = "http_retries";
pub const PROXY_SERVER_KEY: &str = "proxy_server";

const DEFAULT_ATTEMPTS: u32 = 1;

/// Read-only source of user settings.
pub trait Settings: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_bool(&self, key: &str) -> Option<bool> {
        let value = self.get(key)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key)?.trim().parse().ok()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MapSettings {
    values: BTreeMap<String, String>,
}

impl MapSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl Settings for MapSettings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Session defaults taken from user settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub verify_ssl: bool,
    pub timeout: Duration,
    pub attempts: u32,
    pub proxy_server: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            verify_ssl: true,
            timeout: DEFAULT_TIMEOUT,
            attempts: DEFAULT_ATTEMPTS,
            proxy_server: None,
        }
    }
}

impl SessionConfig {
    /// Missing or malformed values fall back to the defaults.
    pub fn from_settings(settings: &dyn Settings) -> Self {
        let defaults = Self::default();
        Self {
            verify_ssl: settings
                .get_bool(VERIFY_SSL_KEY)
                .unwrap_or(defaults.verify_ssl),
            timeout: settings
                .get_u64(HTTP_TIMEOUT_KEY)
                .filter(|seconds| *seconds > 0)
                .map_or(defaults.timeout, Duration::from_secs),
            attempts: settings
                .get_u64(HTTP_RETRIES_KEY)
                .and_then(|attempts| u32::try_from(attempts).ok())
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.attempts),
            proxy_server: settings
                .get(PROXY_SERVER_KEY)
                .map(|proxy| proxy.trim().to_owned())
                .filter(|proxy| !proxy.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_settings_give_defaults() {
        assert_eq!(
            SessionConfig::from_settings(&MapSettings::new()),
            SessionConfig::default()
        );
    }

    #[test]
    fn values_are_parsed_leniently() {
        let settings = MapSettings::new()
            .with(VERIFY_SSL_KEY, "False")
            .with(HTTP_TIMEOUT_KEY, "12")
            .with(HTTP_RETRIES_KEY, "3")
            .with(PROXY_SERVER_KEY, " http://proxy.local:3128 ");
        let config = SessionConfig::from_settings(&settings);
        assert!(!config.verify_ssl);
        assert_eq!(config.timeout, Duration::from_secs(12));
        assert_eq!(config.attempts, 3);
        assert_eq!(config.proxy_server.as_deref(), Some("http://proxy.local:3128"));
    }

    #[test]
    fn malformed_values_fall_back() {
        let settings = MapSettings::new()
            .with(VERIFY_SSL_KEY, "maybe")
            .with(HTTP_TIMEOUT_KEY, "0")
            .with(HTTP_RETRIES_KEY, "-1")
            .with(PROXY_SERVER_KEY, "");
        assert_eq!(
            SessionConfig::from_settings(&settings),
            SessionConfig::default()
        );
    }
}
