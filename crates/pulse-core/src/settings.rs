//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`PulseSettings::default()`]
//! 2. If `~/.pulse/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `PULSE_*` environment variable overrides (highest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseSettings {
    pub stream: StreamSettings,
    pub agents: AgentSettings,
    pub relay: RelaySettings,
    pub logging: LoggingSettings,
}

impl Default for PulseSettings {
    fn default() -> Self {
        Self {
            stream: StreamSettings::default(),
            agents: AgentSettings::default(),
            relay: RelaySettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Activity stream connection and retention.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// WebSocket endpoint; the session id is appended as a query parameter.
    pub endpoint: String,
    /// Maximum number of events (and thinking events) kept per session.
    pub retention_cap: usize,
    pub reconnect: ReconnectSettings,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:9092/ws/activity".into(),
            retention_cap: 200,
            reconnect: ReconnectSettings::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
    /// `None` retries for as long as the session stays subscribed.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Remote agent invocation endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// How many successful outputs to keep in the recent-outputs list.
    pub recent_outputs: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            request_timeout_secs: 300,
            recent_outputs: 10,
        }
    }
}

/// Development relay server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub max_send_queue: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9092,
            heartbeat_interval_secs: 15,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub log_to_sqlite: bool,
    pub log_db_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_to_sqlite: false,
            log_db_path: None,
        }
    }
}

/// `~/.pulse`, falling back to `/tmp/.pulse` without a home directory.
pub fn pulse_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".pulse")
}

pub fn settings_path() -> PathBuf {
    pulse_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<PulseSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<PulseSettings> {
    let defaults = serde_json::to_value(PulseSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: PulseSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Recursive merge: objects merge per key, everything else is replaced by
/// `source`, and nulls in `source` leave `target` alone.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PULSE_*` overrides. Values that fail to parse or fall outside
/// their range are ignored with a warning.
pub fn apply_env_overrides(settings: &mut PulseSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

fn apply_overrides(settings: &mut PulseSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let parsed = |name: &str, parse: &dyn Fn(&str) -> Option<u64>| {
        let raw = read(name)?;
        let value = parse(&raw);
        if value.is_none() {
            tracing::warn!(key = name, value = %raw, "invalid env var, ignoring");
        }
        value
    };

    if let Some(v) = read("PULSE_STREAM_URL") {
        settings.stream.endpoint = v;
    }
    if let Some(n) = parsed("PULSE_RETENTION_CAP", &|v| parse_u64_range(v, 1, 100_000)) {
        settings.stream.retention_cap = n as usize;
    }
    if let Some(v) = read("PULSE_AGENT_URL") {
        settings.agents.base_url = v;
    }
    if let Some(n) = parsed("PULSE_AGENT_TIMEOUT_SECS", &|v| parse_u64_range(v, 1, 3_600)) {
        settings.agents.request_timeout_secs = n;
    }
    if let Some(v) = read("PULSE_RELAY_HOST") {
        settings.relay.host = v;
    }
    if let Some(n) = parsed("PULSE_RELAY_PORT", &|v| parse_u16_range(v, 0, 65535).map(u64::from)) {
        settings.relay.port = n as u16;
    }
    if let Some(v) = read("PULSE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(b) = parsed("PULSE_LOG_SQLITE", &|v| parse_bool(v).map(u64::from)) {
        settings.logging.log_to_sqlite = b == 1;
    }
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn temp_settings(content: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("pulse-test-settings-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_file_yields_defaults() {
        let path = std::env::temp_dir().join("pulse-definitely-missing/settings.json");
        let mut expected = PulseSettings::default();
        apply_env_overrides(&mut expected);
        assert_eq!(load_settings_from_path(&path).unwrap(), expected);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let path = temp_settings(
            r#"{"stream":{"retentionCap":50,"reconnect":{"maxDelayMs":5000}},
                "relay":{"port":7000}}"#,
        );
        let settings = load_settings_from_path(&path).unwrap();

        assert_eq!(settings.stream.retention_cap, 50);
        assert_eq!(settings.stream.reconnect.max_delay_ms, 5000);
        assert_eq!(settings.stream.reconnect.initial_delay_ms, 500);
        assert_eq!(settings.relay.port, 7000);
        assert_eq!(settings.relay.host, "127.0.0.1");
    }

    #[test]
    fn invalid_json_is_an_error() {
        let path = temp_settings("{not json");
        let err = load_settings_from_path(&path).unwrap_err();
        assert!(matches!(err, SettingsError::Json(_)));
    }

    #[test]
    fn deep_merge_skips_nulls_and_replaces_scalars() {
        let merged = deep_merge(
            json!({"a": {"b": 1, "c": 2}, "d": [1, 2]}),
            json!({"a": {"b": null, "c": 3}, "d": [9]}),
        );
        assert_eq!(merged, json!({"a": {"b": 1, "c": 3}, "d": [9]}));
    }

    #[test]
    fn env_overrides_apply_with_range_checks() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PULSE_STREAM_URL", "ws://example.test/ws"),
            ("PULSE_RETENTION_CAP", "0"),
            ("PULSE_RELAY_PORT", "9999"),
            ("PULSE_LOG_SQLITE", "yes"),
            ("PULSE_AGENT_TIMEOUT_SECS", "abc"),
        ]);
        let mut settings = PulseSettings::default();
        apply_overrides(&mut settings, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(settings.stream.endpoint, "ws://example.test/ws");
        assert_eq!(settings.stream.retention_cap, 200);
        assert_eq!(settings.relay.port, 9999);
        assert!(settings.logging.log_to_sqlite);
        assert_eq!(settings.agents.request_timeout_secs, 300);
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut settings = PulseSettings::default();
        apply_overrides(&mut settings, |name| {
            (name == "PULSE_AGENT_URL").then(String::new)
        });
        assert_eq!(settings.agents.base_url, "http://127.0.0.1:8000");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u16_range("80", 1, 100), Some(80));
        assert_eq!(parse_u16_range("180", 1, 100), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }

    #[test]
    fn reconnect_durations() {
        let r = ReconnectSettings::default();
        assert_eq!(r.initial_delay(), Duration::from_millis(500));
        assert_eq!(r.max_delay(), Duration::from_secs(30));
        assert!(r.max_attempts.is_none());
    }
}
