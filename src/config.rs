//! Socket configuration.
//!
//! Defaults follow the conventions of the reference Phoenix JavaScript client
//! and can be overridden through builder setters, a JSON config file
//! ([`SocketConfig::load`]) or environment variables
//! ([`SocketConfig::apply_env_overrides`]).

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PhoenixError, Result};

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default push/join/leave reply timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol version announced in the `vsn` query parameter.
pub const PROTOCOL_VSN: &str = "2.0.0";

/// Transport path segment appended to the endpoint.
const WEBSOCKET_PATH: &str = "websocket";

/// Capped retry schedule.
///
/// Attempt `n` (1-based) waits `steps[n - 1]`; attempts past the end of the
/// schedule reuse the last step. An optional jitter adds a uniformly random
/// extra delay in `[0, jitter)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Ascending delays, one per attempt.
    #[serde(with = "duration_ms_vec")]
    pub steps: Vec<Duration>,
    /// Upper bound of random extra delay.
    #[serde(default, with = "duration_ms")]
    pub jitter: Duration,
}

impl Backoff {
    /// Build a schedule from millisecond steps.
    pub fn from_millis(steps: &[u64]) -> Self {
        Self {
            steps: steps.iter().copied().map(Duration::from_millis).collect(),
            jitter: Duration::ZERO,
        }
    }

    /// A schedule that always waits `delay`.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            steps: vec![delay],
            jitter: Duration::ZERO,
        }
    }

    /// Set the jitter bound.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) as usize - 1).min(self.steps.len().saturating_sub(1));
        let base = self.steps.get(index).copied().unwrap_or(Duration::ZERO);
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rand::random::<u64>() % self.jitter.as_millis().max(1) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }

    /// Default reconnect schedule: 10, 50, 100, 150, 200, 250, 500, 1000, 2000 ms, then 5 s.
    pub fn default_reconnect() -> Self {
        Self::from_millis(&[10, 50, 100, 150, 200, 250, 500, 1000, 2000, 5000])
    }

    /// Default rejoin schedule: 1 s, 2 s, 5 s, then 10 s.
    pub fn default_rejoin() -> Self {
        Self::from_millis(&[1000, 2000, 5000, 10_000])
    }

    /// Reject schedules that would retry without pausing.
    ///
    /// The last step is reused for every later attempt, so it must be non-zero.
    fn validate(&self, name: &str) -> Result<()> {
        match self.steps.last() {
            None => Err(PhoenixError::Config(format!("{name}: steps must not be empty"))),
            Some(last) if last.is_zero() => Err(PhoenixError::Config(format!(
                "{name}: final step must be greater than zero"
            ))),
            Some(_) => Ok(()),
        }
    }
}

/// Configuration for a [`Socket`](crate::Socket).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Socket endpoint, e.g. `ws://localhost:4000/socket`.
    pub endpoint: String,
    /// Connection parameters sent as query pairs (authentication tokens etc.).
    #[serde(default)]
    pub params: Vec<(String, String)>,
    /// Interval between heartbeats.
    #[serde(default = "default_heartbeat", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Default reply timeout for joins, pushes and leaves.
    #[serde(default = "default_timeout", with = "duration_ms")]
    pub timeout: Duration,
    /// Reconnect schedule after a failed connect or a dropped connection.
    #[serde(default = "Backoff::default_reconnect")]
    pub reconnect_after: Backoff,
    /// Rejoin schedule for errored channels.
    #[serde(default = "Backoff::default_rejoin")]
    pub rejoin_after: Backoff,
}

fn default_heartbeat() -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl SocketConfig {
    /// Configuration with default timings for `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: Vec::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            reconnect_after: Backoff::default_reconnect(),
            rejoin_after: Backoff::default_rejoin(),
        }
    }

    /// Add a connection parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the default reply timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the reconnect schedule.
    #[must_use]
    pub fn reconnect_after(mut self, backoff: Backoff) -> Self {
        self.reconnect_after = backoff;
        self
    }

    /// Set the rejoin schedule.
    #[must_use]
    pub fn rejoin_after(mut self, backoff: Backoff) -> Self {
        self.rejoin_after = backoff;
        self
    }

    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))
            .map_err(|e| PhoenixError::Config(format!("{e:#}")))?;
        let mut config: Self = serde_json::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check timings: intervals must be non-zero and backoff schedules must pause.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(PhoenixError::Config(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(PhoenixError::Config("timeout must be greater than zero".to_string()));
        }
        self.reconnect_after.validate("reconnect_after")?;
        self.rejoin_after.validate("rejoin_after")
    }

    /// Apply `PHX_ENDPOINT`, `PHX_HEARTBEAT_INTERVAL_MS` and `PHX_TIMEOUT_MS`.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("PHX_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(ms) = env_millis("PHX_HEARTBEAT_INTERVAL_MS") {
            self.heartbeat_interval = ms;
        }
        if let Some(ms) = env_millis("PHX_TIMEOUT_MS") {
            self.timeout = ms;
        }
    }

    /// Full transport URL: `ws(s)` scheme, `/websocket` suffix, params and `vsn`.
    pub fn endpoint_url(&self) -> Result<Url> {
        let endpoint = http_to_ws_scheme(&self.endpoint);
        let mut url = Url::parse(&endpoint)
            .map_err(|e| PhoenixError::Config(format!("invalid endpoint '{endpoint}': {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PhoenixError::Config(format!(
                "unsupported endpoint scheme '{}'",
                url.scheme()
            )));
        }

        let already_suffixed = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .is_some_and(|last| last == WEBSOCKET_PATH);
        if !already_suffixed {
            let path = format!("{}/{}", url.path().trim_end_matches('/'), WEBSOCKET_PATH);
            url.set_path(&path);
        }

        {
            let mut query = url.query_pairs_mut();
            for (key, value) in &self.params {
                query.append_pair(key, value);
            }
            query.append_pair("vsn", PROTOCOL_VSN);
        }
        Ok(url)
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            log::warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod duration_ms_vec {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(steps: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        steps
            .iter()
            .map(|d| d.as_millis() as u64)
            .collect::<Vec<_>>()
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Vec::<u64>::deserialize(d).map(|v| v.into_iter().map(Duration::from_millis).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_backoff_saturates() {
        let backoff = Backoff::from_millis(&[10, 50, 100]);
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
        assert_eq!(backoff.delay(2), Duration::from_millis(50));
        assert_eq!(backoff.delay(3), Duration::from_millis(100));
        assert_eq!(backoff.delay(4), Duration::from_millis(100));
        assert_eq!(backoff.delay(1000), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_attempt_zero_is_first_step() {
        assert_eq!(
            Backoff::default_reconnect().delay(0),
            Duration::from_millis(10)
        );
    }

    #[test]
    fn test_backoff_default_reconnect_caps_at_five_seconds() {
        assert_eq!(
            Backoff::default_reconnect().delay(50),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let backoff = Backoff::fixed(Duration::from_millis(100)).with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let d = backoff.delay(1);
            assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(150));
        }
    }

    #[test]
    fn test_endpoint_url_appends_websocket_and_params() {
        let config = SocketConfig::new("ws://localhost:4000/socket").param("token", "abc 123");
        let url = config.endpoint_url().unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:4000/socket/websocket?token=abc+123&vsn=2.0.0"
        );
    }

    #[test]
    fn test_endpoint_url_keeps_existing_suffix() {
        let url = SocketConfig::new("wss://example.com/socket/websocket")
            .endpoint_url()
            .unwrap();
        assert_eq!(url.as_str(), "wss://example.com/socket/websocket?vsn=2.0.0");
    }

    #[test]
    fn test_endpoint_url_maps_http_scheme() {
        let url = SocketConfig::new("https://example.com/socket/")
            .endpoint_url()
            .unwrap();
        assert_eq!(url.as_str(), "wss://example.com/socket/websocket?vsn=2.0.0");
    }

    #[test]
    fn test_endpoint_url_rejects_garbage() {
        assert!(matches!(
            SocketConfig::new("not a url").endpoint_url(),
            Err(PhoenixError::Config(_))
        ));
        assert!(matches!(
            SocketConfig::new("ftp://example.com").endpoint_url(),
            Err(PhoenixError::Config(_))
        ));
    }

    #[test]
    fn test_http_to_ws_scheme_passthrough() {
        assert_eq!(http_to_ws_scheme("ws://localhost:3000"), "ws://localhost:3000");
        assert_eq!(http_to_ws_scheme("http://localhost:3000"), "ws://localhost:3000");
    }

    #[test]
    fn test_load_from_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoint": "ws://localhost:4000/socket", "params": [["token", "t"]], "heartbeat_interval": 5000}}"#
        )
        .unwrap();

        let config = SocketConfig::load(file.path()).unwrap();
        assert_eq!(config.params, vec![("token".to_string(), "t".to_string())]);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.rejoin_after, Backoff::default_rejoin());
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = SocketConfig::load(Path::new("/nonexistent/phx.json")).unwrap_err();
        assert!(matches!(err, PhoenixError::Config(_)));
    }

    #[test]
    fn test_load_rejects_empty_backoff_steps() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoint": "ws://localhost:4000/socket", "reconnect_after": {{"steps": []}}}}"#
        )
        .unwrap();

        let err = SocketConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, PhoenixError::Config(ref msg) if msg.contains("reconnect_after")));
    }

    #[test]
    fn test_load_rejects_zero_heartbeat_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"endpoint": "ws://localhost:4000/socket", "heartbeat_interval": 0}}"#
        )
        .unwrap();

        let err = SocketConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, PhoenixError::Config(ref msg) if msg.contains("heartbeat_interval")));
    }

    #[test]
    fn test_validate_rejects_zero_final_step() {
        let config = SocketConfig::new("ws://localhost:4000/socket")
            .rejoin_after(Backoff::from_millis(&[100, 0]));
        assert!(matches!(config.validate(), Err(PhoenixError::Config(_))));
        assert!(SocketConfig::new("ws://localhost:4000/socket").validate().is_ok());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = SocketConfig::new("ws://localhost:4000/socket")
            .timeout(Duration::from_millis(1500))
            .rejoin_after(Backoff::fixed(Duration::from_secs(3)));
        let json = serde_json::to_string(&config).unwrap();
        let back: SocketConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
