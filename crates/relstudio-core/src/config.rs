use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Scheduler and runner settings shared by every worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub janitor_interval_ms: u64,
    /// A `running` evaluation older than this is considered orphaned.
    pub stale_after_ms: u64,
    pub startup_jitter_ms: u64,
    pub store_timeout_ms: u64,
    pub persist_retries: u32,
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            janitor_interval_ms: 60_000,
            stale_after_ms: 3_600_000,
            startup_jitter_ms: 1_000,
            store_timeout_ms: 30_000,
            persist_retries: 2,
            log_level: "info".to_string(),
        }
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(v) = env::var(key) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(_) => tracing::warn!(event = "config.bad_env", key, value = %v),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Environment variables win over whatever was loaded before.
    pub fn apply_env(&mut self) {
        env_override("RELSTUDIO_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        env_override("RELSTUDIO_JANITOR_INTERVAL_MS", &mut self.janitor_interval_ms);
        env_override("RELSTUDIO_STALE_AFTER_MS", &mut self.stale_after_ms);
        env_override("RELSTUDIO_STARTUP_JITTER_MS", &mut self.startup_jitter_ms);
        env_override("RELSTUDIO_STORE_TIMEOUT_MS", &mut self.store_timeout_ms);
        env_override("RELSTUDIO_PERSIST_RETRIES", &mut self.persist_retries);
        if let Ok(v) = env::var("RELSTUDIO_LOG") {
            self.log_level = v;
        }
    }

    pub fn load(path: &Path, strict: bool) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&raw, strict)
            .map_err(|ConfigError(msg)| ConfigError(format!("{} (file: {})", msg, path.display())))
    }

    pub fn from_yaml_str(raw: &str, strict: bool) -> Result<Self, ConfigError> {
        let mut ignored = Vec::new();
        let de = serde_yaml::Deserializer::from_str(raw);
        let cfg: WorkerConfig = serde_ignored::deserialize(de, |path| {
            ignored.push(path.to_string());
        })
        .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;

        if !ignored.is_empty() {
            if strict {
                return Err(ConfigError(format!(
                    "unknown fields in strict mode: {:?}",
                    ignored
                )));
            }
            tracing::warn!(event = "config.ignored_keys", keys = ?ignored);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError("poll_interval_ms must be > 0".into()));
        }
        if self.janitor_interval_ms == 0 {
            return Err(ConfigError("janitor_interval_ms must be > 0".into()));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError("store_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
