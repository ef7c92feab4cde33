//! Runtime configuration
//!
//! Everything tunable lives here: env vars first, with an optional TOML
//! file overlay for fleets that prefer checked-in config. `validate()`
//! gates startup; a bad config is exit code 1, never a half-running
//! monitor.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Per-detector fusion weights. Normalised at fusion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorWeights {
    pub keyword: f64,
    pub dom: f64,
    pub api_probe: f64,
    pub fingerprint: f64,
}

impl Default for DetectorWeights {
    fn default() -> Self {
        Self {
            keyword: 0.20,
            dom: 0.35,
            api_probe: 0.35,
            fingerprint: 0.10,
        }
    }
}

impl DetectorWeights {
    pub fn sum(&self) -> f64 {
        self.keyword + self.dom + self.api_probe + self.fingerprint
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    pub listen_port: u16,

    /// Min seconds between polls of the same item.
    pub check_interval: u64,
    /// Due-set refresh cadence in seconds.
    pub tick_interval: u64,
    /// Seconds between notification flushes.
    pub aggregation_interval: u64,
    /// Per-(item, recipient) anti-spam window in seconds.
    pub cooldown_seconds: u64,
    /// Per-fetch deadline in seconds.
    pub fetch_timeout: u64,
    /// Per-detector deadline in seconds.
    pub detector_timeout: u64,
    /// Per-delivery deadline in seconds.
    pub delivery_timeout: u64,
    /// Transient-error backoff base in seconds.
    pub retry_delay: u64,
    pub max_retries: u32,
    /// Scheduler worker pool size.
    pub max_workers: usize,
    /// Host politeness: min seconds between polls of the same host.
    pub per_host_min_delay: u64,
    /// Extra deferral after an anti-bot block, in seconds.
    pub blocked_backoff: u64,
    /// Consecutive errors before an item is auto-disabled.
    pub error_threshold: u32,
    /// Fusion emit threshold.
    pub confidence_threshold: f64,
    /// Headless render toggle and pool cap.
    pub enable_render: bool,
    pub max_browsers: usize,
    /// Per-user admission cap per rolling day.
    pub daily_add_limit: u32,
    /// Default per-user notification cap per rolling day.
    pub daily_notify_limit: u32,
    /// Check-history retention window in days.
    pub history_retention_days: i64,
    /// Newest records per item that survive pruning regardless of age.
    pub history_keep_per_item: u32,
    /// Max rows deleted per prune call to keep the write short.
    pub prune_batch_cap: u32,
    /// Items listed in one admin digest message.
    pub admin_digest_max_items: usize,
    /// Seconds in-flight work gets to finish on shutdown.
    pub shutdown_grace: u64,
    /// Admin recipient ids.
    pub admin_ids: Vec<String>,
    // Tables last so the TOML rendering of the effective config stays
    // valid (values may not follow tables).
    pub detector_weights: DetectorWeights,
    /// Host suffix -> vendor tag table for vendor inference.
    pub vendor_tags: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "stockbot.db".to_string(),
            listen_port: 8090,
            check_interval: 180,
            tick_interval: 1,
            aggregation_interval: 180,
            cooldown_seconds: 600,
            fetch_timeout: 30,
            detector_timeout: 10,
            delivery_timeout: 15,
            retry_delay: 60,
            max_retries: 3,
            max_workers: 8,
            per_host_min_delay: 2,
            blocked_backoff: 1800,
            error_threshold: 10,
            confidence_threshold: 0.6,
            enable_render: false,
            max_browsers: 2,
            daily_add_limit: 50,
            daily_notify_limit: 20,
            history_retention_days: 90,
            history_keep_per_item: 100,
            prune_batch_cap: 5000,
            admin_digest_max_items: 10,
            shutdown_grace: 60,
            admin_ids: Vec::new(),
            detector_weights: DetectorWeights::default(),
            vendor_tags: default_vendor_tags(),
        }
    }
}

fn default_vendor_tags() -> HashMap<String, String> {
    // Suffix-matched against the item host at admission time.
    [
        ("bandwagonhost.com", "bwh"),
        ("bwh81.net", "bwh"),
        ("dmit.io", "dmit"),
        ("racknerd.com", "racknerd"),
        ("vultr.com", "vultr"),
        ("hetzner.com", "hetzner"),
        ("ovhcloud.com", "ovh"),
        ("greencloudvps.com", "greencloud"),
    ]
    .into_iter()
    .map(|(h, t)| (h.to_string(), t.to_string()))
    .collect()
}

impl Config {
    /// Load from the environment, with an optional TOML overlay taken from
    /// `STOCKBOT_CONFIG` (file wins over defaults, env wins over file).
    pub fn load() -> Result<Self> {
        let mut cfg = match env::var("STOCKBOT_CONFIG").ok() {
            Some(path) if !path.trim().is_empty() => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("read config file {}", path))?;
                toml::from_str(&raw).with_context(|| format!("parse config file {}", path))?
            }
            _ => Config::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("DB_PATH").or_else(|_| env::var("DATABASE_PATH")) {
            self.database_path = v;
        }
        env_parse("LISTEN_PORT", &mut self.listen_port);
        env_parse("CHECK_INTERVAL_SECS", &mut self.check_interval);
        env_parse("TICK_INTERVAL_SECS", &mut self.tick_interval);
        env_parse("AGGREGATION_INTERVAL_SECS", &mut self.aggregation_interval);
        env_parse("COOLDOWN_SECS", &mut self.cooldown_seconds);
        env_parse("FETCH_TIMEOUT_SECS", &mut self.fetch_timeout);
        env_parse("DETECTOR_TIMEOUT_SECS", &mut self.detector_timeout);
        env_parse("DELIVERY_TIMEOUT_SECS", &mut self.delivery_timeout);
        env_parse("RETRY_DELAY_SECS", &mut self.retry_delay);
        env_parse("MAX_RETRIES", &mut self.max_retries);
        env_parse("MAX_WORKERS", &mut self.max_workers);
        env_parse("PER_HOST_MIN_DELAY_SECS", &mut self.per_host_min_delay);
        env_parse("BLOCKED_BACKOFF_SECS", &mut self.blocked_backoff);
        env_parse("ERROR_THRESHOLD", &mut self.error_threshold);
        env_parse("CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_parse("DAILY_ADD_LIMIT", &mut self.daily_add_limit);
        env_parse("DAILY_NOTIFY_LIMIT", &mut self.daily_notify_limit);
        env_parse("HISTORY_RETENTION_DAYS", &mut self.history_retention_days);
        env_parse("HISTORY_KEEP_PER_ITEM", &mut self.history_keep_per_item);
        env_parse("SHUTDOWN_GRACE_SECS", &mut self.shutdown_grace);
        env_parse("MAX_BROWSERS", &mut self.max_browsers);

        if let Ok(v) = env::var("ENABLE_RENDER") {
            self.enable_render = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = env::var("ADMIN_IDS") {
            self.admin_ids = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_path.trim().is_empty() {
            bail!("database_path must not be empty");
        }
        if self.check_interval == 0 {
            bail!("check_interval must be > 0");
        }
        if self.tick_interval == 0 {
            bail!("tick_interval must be > 0");
        }
        if self.aggregation_interval == 0 {
            bail!("aggregation_interval must be > 0");
        }
        if self.max_workers == 0 {
            bail!("max_workers must be > 0");
        }
        if self.max_browsers == 0 && self.enable_render {
            bail!("max_browsers must be > 0 when enable_render is set");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!(
                "confidence_threshold must be in [0,1], got {}",
                self.confidence_threshold
            );
        }
        let w = &self.detector_weights;
        for (name, v) in [
            ("keyword", w.keyword),
            ("dom", w.dom),
            ("api_probe", w.api_probe),
            ("fingerprint", w.fingerprint),
        ] {
            if v < 0.0 {
                bail!("detector weight {} must be >= 0, got {}", name, v);
            }
        }
        if w.sum() <= 0.0 {
            bail!("detector weights must not all be zero");
        }
        if self.history_retention_days <= 0 {
            bail!("history_retention_days must be > 0");
        }
        Ok(())
    }

    pub fn fetch_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn detector_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.detector_timeout)
    }

    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admin_ids.iter().any(|a| a == user_id)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Some(v) = env::var(key).ok().and_then(|v| v.parse::<T>().ok()) {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_weights_sum_to_one() {
        let w = DetectorWeights::default();
        assert!((w.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_zero_workers() {
        let cfg = Config {
            max_workers: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let cfg = Config {
            confidence_threshold: 1.5,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_negative_weight() {
        let mut cfg = Config::default();
        cfg.detector_weights.dom = -0.1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_overlay_parses() {
        let cfg: Config = toml::from_str(
            r#"
            check_interval = 60
            confidence_threshold = 0.7
            admin_ids = ["42"]

            [detector_weights]
            keyword = 0.1
            dom = 0.4
            api_probe = 0.4
            fingerprint = 0.1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.check_interval, 60);
        assert_eq!(cfg.admin_ids, vec!["42".to_string()]);
        assert!((cfg.detector_weights.dom - 0.4).abs() < 1e-9);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.max_workers, 8);
    }
}
