//! Process configuration, read from environment variables.

use chrono_tz::Tz;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3002;
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Africa::Douala;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_KEEP_COUNT: usize = 10_000;
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;
pub const DEFAULT_REPLAY_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret for HMAC-SHA256 verification. `None` accepts every
    /// delivery as valid and logs a configuration warning.
    pub secret: Option<String>,
    /// Reject deliveries whose signature is missing or invalid with 401.
    pub strict_mode: bool,
    pub retention_days: u32,
    pub keep_count: usize,
    pub host: String,
    pub port: u16,
    /// Display timezone for "today", hourly buckets and humanized timestamps.
    pub timezone: Tz,
    /// Directory for the delivery log. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub dedup_capacity: usize,
    pub replay_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            secret: None,
            strict_mode: false,
            retention_days: DEFAULT_RETENTION_DAYS,
            keep_count: DEFAULT_KEEP_COUNT,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            timezone: DEFAULT_TIMEZONE,
            data_dir: None,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            replay_timeout: Duration::from_secs(DEFAULT_REPLAY_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unparseable values keep
    /// their default and log a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.secret = lookup("WEBHOOK_SECRET")
            .or_else(|| lookup("GENUKA_WEBHOOK_SECRET"))
            .filter(|s| !s.is_empty());

        if let Some(val) = lookup("REJECT_INVALID_SIGNATURES") {
            config.strict_mode = matches!(val.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }

        parse_into(&lookup, "RETENTION_DAYS", &mut config.retention_days);
        parse_into(&lookup, "KEEP_COUNT", &mut config.keep_count);
        parse_into(&lookup, "PORT", &mut config.port);
        parse_into(&lookup, "DEDUP_CAPACITY", &mut config.dedup_capacity);

        if let Some(host) = lookup("HOST").filter(|h| !h.is_empty()) {
            config.host = host;
        }

        if let Some(name) = lookup("TIMEZONE") {
            match Tz::from_str(name.trim()) {
                Ok(tz) => config.timezone = tz,
                Err(_) => tracing::warn!(timezone = %name, "unknown timezone, using default"),
            }
        }

        config.data_dir = lookup("DATA_DIR").filter(|d| !d.is_empty()).map(PathBuf::from);

        let mut secs = DEFAULT_REPLAY_TIMEOUT_SECS;
        parse_into(&lookup, "REPLAY_TIMEOUT_SECS", &mut secs);
        config.replay_timeout = Duration::from_secs(secs);

        let mut secs = DEFAULT_HEARTBEAT_INTERVAL_SECS;
        parse_into(&lookup, "HEARTBEAT_INTERVAL_SECS", &mut secs);
        config.heartbeat_interval = Duration::from_secs(secs.max(1));

        let mut secs = DEFAULT_CLEANUP_INTERVAL_SECS;
        parse_into(&lookup, "CLEANUP_INTERVAL_SECS", &mut secs);
        config.cleanup_interval = Duration::from_secs(secs.max(1));

        config
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable config value"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_environment_empty() {
        let config = config_from(&[]);
        assert_eq!(config.port, 3002);
        assert!(config.secret.is_none());
        assert!(!config.strict_mode);
        assert_eq!(config.timezone, chrono_tz::Africa::Douala);
        assert_eq!(config.dedup_capacity, 1000);
        assert_eq!(config.replay_timeout, Duration::from_secs(10));
    }

    #[test]
    fn reads_secret_with_fallback_name() {
        let config = config_from(&[("GENUKA_WEBHOOK_SECRET", "s3cret")]);
        assert_eq!(config.secret.as_deref(), Some("s3cret"));

        let config = config_from(&[("WEBHOOK_SECRET", "primary"), ("GENUKA_WEBHOOK_SECRET", "other")]);
        assert_eq!(config.secret.as_deref(), Some("primary"));
    }

    #[test]
    fn strict_mode_is_opt_in() {
        assert!(config_from(&[("REJECT_INVALID_SIGNATURES", "true")]).strict_mode);
        assert!(config_from(&[("REJECT_INVALID_SIGNATURES", "1")]).strict_mode);
        assert!(!config_from(&[("REJECT_INVALID_SIGNATURES", "false")]).strict_mode);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let config = config_from(&[("PORT", "not-a-port"), ("TIMEZONE", "Mars/Olympus")]);
        assert_eq!(config.port, 3002);
        assert_eq!(config.timezone, chrono_tz::Africa::Douala);
    }

    #[test]
    fn parses_numeric_and_path_values() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("RETENTION_DAYS", "7"),
            ("KEEP_COUNT", "500"),
            ("DATA_DIR", "/var/lib/webhooks"),
            ("TIMEZONE", "Europe/Paris"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.keep_count, 500);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/webhooks")));
        assert_eq!(config.timezone, chrono_tz::Europe::Paris);
    }
}
