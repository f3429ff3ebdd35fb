// Observer tuning knobs, loaded from `pika_inbound_config.json` in the data dir.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Deserialize;

const CONFIG_FILE: &str = "pika_inbound_config.json";

pub const DEFAULT_MAX_BATCH_SIZE: usize = 30;
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
pub const DECRYPT_QUEUE: &str = "__PUSH_DECRYPT_JOB__";

/// Timeouts that depend on whether the service is reached through a
/// censorship-circumvention path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverTimeouts {
    /// How long a batch read may block before we treat it as an idle timeout.
    pub read_timeout: Duration,
    /// How long a keep-alive lease can hold the socket open.
    pub keep_alive_max_age: Duration,
    /// How long the socket may stay up after the app is backgrounded.
    pub max_background_time: Duration,
}

impl ObserverTimeouts {
    pub const fn censored() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            keep_alive_max_age: Duration::from_secs(2 * 60),
            max_background_time: Duration::from_secs(10),
        }
    }

    pub const fn uncensored() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            keep_alive_max_age: Duration::from_secs(5 * 60),
            max_background_time: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverConfig {
    pub uncensored: ObserverTimeouts,
    pub censored: ObserverTimeouts,
    pub max_batch_size: usize,
    pub backoff_cap: Duration,
    pub decrypt_queue: String,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            uncensored: ObserverTimeouts::uncensored(),
            censored: ObserverTimeouts::censored(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            decrypt_queue: DECRYPT_QUEUE.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TimeoutsFile {
    read_timeout_ms: Option<u64>,
    keep_alive_max_age_ms: Option<u64>,
    max_background_time_ms: Option<u64>,
}

impl TimeoutsFile {
    fn apply(&self, base: ObserverTimeouts) -> ObserverTimeouts {
        ObserverTimeouts {
            read_timeout: self
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(base.read_timeout),
            keep_alive_max_age: self
                .keep_alive_max_age_ms
                .map(Duration::from_millis)
                .unwrap_or(base.keep_alive_max_age),
            max_background_time: self
                .max_background_time_ms
                .map(Duration::from_millis)
                .unwrap_or(base.max_background_time),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    uncensored: TimeoutsFile,
    censored: TimeoutsFile,
    max_batch_size: Option<usize>,
    backoff_cap_ms: Option<u64>,
    decrypt_queue: Option<String>,
}

impl ObserverConfig {
    pub fn timeouts(&self, censored: bool) -> ObserverTimeouts {
        if censored {
            self.censored
        } else {
            self.uncensored
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: ConfigFile = serde_json::from_str(json).context("parse observer config")?;
        let defaults = Self::default();
        let config = Self {
            uncensored: file.uncensored.apply(defaults.uncensored),
            censored: file.censored.apply(defaults.censored),
            max_batch_size: file.max_batch_size.unwrap_or(defaults.max_batch_size),
            backoff_cap: file
                .backoff_cap_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
            decrypt_queue: file
                .decrypt_queue
                .filter(|q| !q.trim().is_empty())
                .unwrap_or(defaults.decrypt_queue),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reads `pika_inbound_config.json` from `data_dir` (defaults when absent),
    /// then applies `PIKA_INBOUND_*` env overrides.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            Self::from_json(&raw).with_context(|| format!("invalid {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `PIKA_INBOUND_MAX_BATCH_SIZE` and `PIKA_INBOUND_BACKOFF_CAP_MS`
    /// as returned by `lookup`, then re-validates.
    fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(v) = parse_env::<usize>("PIKA_INBOUND_MAX_BATCH_SIZE", &lookup)? {
            self.max_batch_size = v;
        }
        if let Some(v) = parse_env::<u64>("PIKA_INBOUND_BACKOFF_CAP_MS", &lookup)? {
            self.backoff_cap = Duration::from_millis(v);
        }
        self.validate()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_batch_size == 0 {
            return Err(anyhow!("max_batch_size must be at least 1"));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(
    name: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Option<T>> {
    match lookup(name) {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("invalid {name}: `{v}`")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn censored_and_uncensored_defaults() {
        let config = ObserverConfig::default();
        let c = config.timeouts(true);
        assert_eq!(c.read_timeout, Duration::from_secs(30));
        assert_eq!(c.keep_alive_max_age, Duration::from_secs(120));
        assert_eq!(c.max_background_time, Duration::from_secs(10));

        let u = config.timeouts(false);
        assert_eq!(u.read_timeout, Duration::from_secs(60));
        assert_eq!(u.keep_alive_max_age, Duration::from_secs(300));
        assert_eq!(u.max_background_time, Duration::from_secs(120));

        assert_eq!(config.max_batch_size, 30);
        assert_eq!(config.backoff_cap, Duration::from_secs(30));
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let config = ObserverConfig::from_json(
            r#"{"censored": {"read_timeout_ms": 5000}, "max_batch_size": 10}"#,
        )
        .unwrap();
        assert_eq!(config.censored.read_timeout, Duration::from_secs(5));
        assert_eq!(
            config.censored.keep_alive_max_age,
            ObserverTimeouts::censored().keep_alive_max_age
        );
        assert_eq!(config.uncensored, ObserverTimeouts::uncensored());
        assert_eq!(config.max_batch_size, 10);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = ObserverConfig::from_json(r#"{"max_batch_size": 0}"#).unwrap_err();
        assert!(err.to_string().contains("max_batch_size"), "{err}");
    }

    #[test]
    fn load_without_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ObserverConfig::load(dir.path()).unwrap();
        assert_eq!(config.uncensored, ObserverTimeouts::uncensored());
    }

    #[test]
    fn load_reports_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{not json").unwrap();
        let err = ObserverConfig::load(dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains(CONFIG_FILE), "{err:#}");
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn env_overrides_batch_size_and_backoff_cap() {
        let mut config = ObserverConfig::default();
        config
            .apply_env_overrides(env(&[
                ("PIKA_INBOUND_MAX_BATCH_SIZE", " 7 "),
                ("PIKA_INBOUND_BACKOFF_CAP_MS", "1500"),
            ]))
            .unwrap();
        assert_eq!(config.max_batch_size, 7);
        assert_eq!(config.backoff_cap, Duration::from_millis(1500));

        // Blank values are ignored.
        config
            .apply_env_overrides(env(&[("PIKA_INBOUND_MAX_BATCH_SIZE", "  ")]))
            .unwrap();
        assert_eq!(config.max_batch_size, 7);
    }

    #[test]
    fn env_override_errors() {
        let mut config = ObserverConfig::default();
        let err = config
            .apply_env_overrides(env(&[("PIKA_INBOUND_BACKOFF_CAP_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("PIKA_INBOUND_BACKOFF_CAP_MS"), "{err}");
        assert_eq!(config.backoff_cap, DEFAULT_BACKOFF_CAP);

        let err = config
            .apply_env_overrides(env(&[("PIKA_INBOUND_MAX_BATCH_SIZE", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("max_batch_size"), "{err}");
    }
}
