//! Channel configuration: endpoint, connect timeout, and reconnect policy.

use std::time::Duration;

use crate::types::Error;

pub(crate) const DEFAULT_URL: &str = "ws://localhost:8000/ws";
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub(crate) const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub const ENV_URL: &str = "REALTIME_WS_URL";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "REALTIME_MAX_RECONNECT_ATTEMPTS";
pub const ENV_RECONNECT_DELAY_MS: &str = "REALTIME_RECONNECT_DELAY_MS";

/// How the delay grows between automatic reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Same delay before every attempt.
    #[default]
    Fixed,
    /// Delay doubles per attempt, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

/// Rules for re-establishing the connection after an unplanned close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Automatic attempts before giving up. Zero disables reconnects.
    pub max_attempts: u32,
    /// Base delay before each attempt.
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            delay: DEFAULT_RECONNECT_DELAY,
            backoff: Backoff::Fixed,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let exp = attempt.saturating_sub(1).min(30);
                self.delay.saturating_mul(1u32 << exp).min(max_delay)
            }
        }
    }
}

/// Configuration for a [`RealtimeChannel`](crate::RealtimeChannel).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// WebSocket endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Upper bound on a single open attempt.
    pub connect_timeout: Duration,
    /// A single outbound frame that takes longer than this to write counts
    /// as a lost connection.
    pub write_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ChannelConfig {
    /// Config with default timing for the given endpoint.
    pub fn new(url: impl Into<String>) -> Result<Self, Error> {
        let url = url.into();
        validate_url(&url)?;
        Ok(Self {
            url,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        })
    }

    /// Build from `REALTIME_WS_URL`, `REALTIME_MAX_RECONNECT_ATTEMPTS` and
    /// `REALTIME_RECONNECT_DELAY_MS`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let url = lookup(ENV_URL).unwrap_or_else(|| DEFAULT_URL.to_string());
        let mut config = Self::new(url)?;
        if let Some(raw) = lookup(ENV_MAX_RECONNECT_ATTEMPTS) {
            config.reconnect.max_attempts = raw.trim().parse().map_err(|e| {
                Error::Config(format!("{ENV_MAX_RECONNECT_ATTEMPTS}={raw:?}: {e}"))
            })?;
        }
        if let Some(raw) = lookup(ENV_RECONNECT_DELAY_MS) {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("{ENV_RECONNECT_DELAY_MS}={raw:?}: {e}")))?;
            config.reconnect.delay = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

fn validate_url(raw: &str) -> Result<(), Error> {
    let parsed = url::Url::parse(raw)?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(Error::Config(format!(
            "unsupported URL scheme {other:?} in {raw} (expected ws or wss)"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_env_empty() {
        let config = ChannelConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.write_timeout, DEFAULT_WRITE_TIMEOUT);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.delay, Duration::from_secs(3));
        assert_eq!(config.reconnect.backoff, Backoff::Fixed);
    }

    #[test]
    fn env_overrides() {
        let config = ChannelConfig::from_lookup(lookup_from(&[
            (ENV_URL, "wss://api.example.com/ws"),
            (ENV_MAX_RECONNECT_ATTEMPTS, "8"),
            (ENV_RECONNECT_DELAY_MS, " 250 "),
        ]))
        .unwrap();
        assert_eq!(config.url, "wss://api.example.com/ws");
        assert_eq!(config.reconnect.max_attempts, 8);
        assert_eq!(config.reconnect.delay, Duration::from_millis(250));
    }

    #[test]
    fn bad_numeric_env_is_config_error() {
        let result =
            ChannelConfig::from_lookup(lookup_from(&[(ENV_MAX_RECONNECT_ATTEMPTS, "many")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = ChannelConfig::from_lookup(lookup_from(&[(ENV_RECONNECT_DELAY_MS, "-1")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            ChannelConfig::new("http://localhost:8000/ws"),
            Err(Error::Config(_))
        ));
        assert!(matches!(ChannelConfig::new("not a url"), Err(Error::Url(_))));
        assert!(ChannelConfig::new("ws://127.0.0.1:9/ws").is_ok());
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for(5), Duration::from_secs(3));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            delay: Duration::from_secs(1),
            backoff: Backoff::Exponential {
                max_delay: Duration::from_secs(15),
            },
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(15));
        assert_eq!(policy.delay_for(40), Duration::from_secs(15));
    }
}
