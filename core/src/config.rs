//! Engine configuration
//!
//! Loaded from `$HOME/.messaging-engine/config.toml`, following the layout
//! `core/src/config/manager.rs` used for its `ConfigManager`: defaults,
//! create-if-missing, validate on load.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{EngineError, Result};

/// All tunables named by the engine's design as "configuration inputs".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum outbound messages per local day before the Rate Limiter
    /// starts rejecting sends.
    pub daily_cap: u32,
    /// Percentage of `daily_cap` at which `RateLimitWarning` fires.
    pub warn_pct: u8,
    /// Dispatcher pacing lower bound between consecutive sends, in ms.
    pub min_delay_ms: u64,
    /// Dispatcher pacing upper bound between consecutive sends, in ms.
    pub max_delay_ms: u64,
    /// Connection Manager reconnect backoff starting point, in ms.
    pub backoff_base_ms: u64,
    /// Connection Manager reconnect backoff ceiling, in ms.
    pub backoff_max_ms: u64,
    /// Jitter fraction applied to each backoff, 0.0-1.0.
    pub backoff_jitter: f64,
    /// How long the Connection Manager keeps retrying before giving up, in
    /// seconds.
    pub max_retry_window_secs: u64,
    /// How long terminal intents (delivered/failed/cancelled) are kept
    /// before the Retention Sweeper deletes them, in days.
    pub retention_days: u32,
    /// Local hour (0-23) used to schedule a recurrence that specifies no
    /// explicit time.
    pub default_send_hour: u8,
    /// Template used for birthday reminder bodies; `{name}` is substituted.
    pub birthday_template: String,
    /// Fixed UTC offset for the local day boundary, in minutes. IST is
    /// +330 (UTC+05:30) and carries no DST.
    pub local_offset_minutes: i32,
    /// Local time-of-day the Retention Sweeper runs, as "HH:MM".
    pub retention_sweep_time: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            daily_cap: 30,
            warn_pct: 80,
            min_delay_ms: 1_500,
            max_delay_ms: 4_500,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_jitter: 0.2,
            max_retry_window_secs: 30 * 60,
            retention_days: 30,
            default_send_hour: 9,
            birthday_template: "Happy birthday, {name}!".to_string(),
            local_offset_minutes: 330,
            retention_sweep_time: "03:00".to_string(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.daily_cap == 0 {
            return Err(EngineError::Config("daily_cap must be greater than 0".into()));
        }
        if self.warn_pct == 0 || self.warn_pct > 100 {
            return Err(EngineError::Config("warn_pct must be in 1..=100".into()));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(EngineError::Config(
                "min_delay_ms must be <= max_delay_ms".into(),
            ));
        }
        if self.max_delay_ms < 2_000 {
            return Err(EngineError::Config(
                "max_delay_ms must respect the 2s pacing floor".into(),
            ));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(EngineError::Config(
                "backoff_base_ms must be <= backoff_max_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(EngineError::Config("backoff_jitter must be in 0.0..=1.0".into()));
        }
        if self.default_send_hour > 23 {
            return Err(EngineError::Config("default_send_hour must be in 0..=23".into()));
        }
        if !self.birthday_template.contains("{name}") {
            return Err(EngineError::Config(
                "birthday_template must contain a {name} placeholder".into(),
            ));
        }
        if parse_hhmm(&self.retention_sweep_time).is_none() {
            return Err(EngineError::Config(
                "retention_sweep_time must be HH:MM".into(),
            ));
        }
        Ok(())
    }

    /// Load from `$HOME/.messaging-engine/config.toml`, writing a default
    /// file the first time the engine boots on a host.
    pub async fn load() -> Result<Self> {
        let path = Self::default_config_path()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Config(e.to_string()))?;
        }

        if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| EngineError::Config(e.to_string()))?;
            let config: Self =
                toml::from_str(&content).map_err(|e| EngineError::Config(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.validate()?;
            let toml_string =
                toml::to_string_pretty(&config).map_err(|e| EngineError::Config(e.to_string()))?;
            tokio::fs::write(&path, toml_string)
                .await
                .map_err(|e| EngineError::Config(e.to_string()))?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok(config)
        }
    }

    fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("could not determine home directory".into()))?;
        Ok(home.join(".messaging-engine").join("config.toml"))
    }

    /// The local day boundary as a `chrono::FixedOffset`.
    pub fn local_offset(&self) -> chrono::FixedOffset {
        chrono::FixedOffset::east_opt(self.local_offset_minutes * 60)
            .expect("offset within +/-24h")
    }
}

fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some((h, m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_delay_bounds() {
        let mut cfg = EngineConfig::default();
        cfg.min_delay_ms = 5_000;
        cfg.max_delay_ms = 1_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_delay_below_pacing_floor() {
        let mut cfg = EngineConfig::default();
        cfg.min_delay_ms = 500;
        cfg.max_delay_ms = 1_500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_template_without_placeholder() {
        let mut cfg = EngineConfig::default();
        cfg.birthday_template = "Happy birthday!".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_bad_sweep_time() {
        let mut cfg = EngineConfig::default();
        cfg.retention_sweep_time = "25:99".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ist_offset_is_five_thirty() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.local_offset().local_minus_utc(), 330 * 60);
    }
}
