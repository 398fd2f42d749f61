//! Monitor configuration: one immutable value built at startup from
//! `configs/monitor.toml` plus environment overrides, then passed into each
//! component's constructor. Secrets (bot token, chat id, proxy) come from
//! the environment only.

use std::fs;
use std::path::Path;
use std::time::Duration;

use alert_governor::GovernorConfig;
use collector_binance::CollectorConfig;
use market_analyzer::AnalyzerConfig;
use notifier_telegram::TelegramConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MonitorConfig {
    pub base_url: String,
    pub http_timeout_secs: u64,
    pub concurrency_limit: usize,
    pub rate_limit_wait_secs: u64,
    pub max_retries: u32,
    #[serde(skip_serializing)]
    pub proxy_url: Option<String>,

    #[serde(skip_serializing)]
    pub bot_token: Option<String>,
    #[serde(skip_serializing)]
    pub chat_id: Option<String>,
    pub max_alerts_per_cycle: usize,
    pub strong_only: bool,
    pub cooldown_minutes: i64,

    pub min_volume_24h: f64,
    pub reference_symbol: String,

    pub data_dir: String,
    pub check_interval_secs: u64,

    // Nested table last so the TOML serializer sees scalars first.
    pub thresholds: AnalyzerConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let collector = CollectorConfig::default();
        let governor = GovernorConfig::default();
        Self {
            base_url: collector.base_url,
            http_timeout_secs: collector.http_timeout.as_secs(),
            concurrency_limit: collector.concurrency_limit,
            rate_limit_wait_secs: collector.rate_limit_wait.as_secs(),
            max_retries: collector.max_retries,
            proxy_url: None,
            bot_token: None,
            chat_id: None,
            max_alerts_per_cycle: governor.max_alerts_per_cycle,
            strong_only: governor.strong_only,
            cooldown_minutes: governor.cooldown_minutes,
            thresholds: AnalyzerConfig::default(),
            min_volume_24h: collector.min_volume_24h,
            reference_symbol: collector.reference_symbol,
            data_dir: "data".to_string(),
            check_interval_secs: 300,
        }
    }
}

/// On-disk shape: every field optional so a partial file patches defaults.
#[derive(Debug, Default, Deserialize)]
struct MonitorFile {
    network: Option<NetworkSection>,
    telegram: Option<TelegramSection>,
    thresholds: Option<ThresholdSection>,
    data: Option<DataSection>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkSection {
    base_url: Option<String>,
    http_timeout_secs: Option<u64>,
    concurrency_limit: Option<usize>,
    rate_limit_wait_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramSection {
    max_alerts_per_cycle: Option<usize>,
    strong_only: Option<bool>,
    cooldown_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ThresholdSection {
    min_volume_24h: Option<f64>,
    reference_symbol: Option<String>,
    normal_funding: Option<f64>,
    strong_funding: Option<f64>,
    normal_oi_ratio: Option<f64>,
    strong_oi_ratio: Option<f64>,
    short_window: Option<usize>,
    long_window: Option<usize>,
    oi_15m_normal: Option<f64>,
    oi_15m_strong: Option<f64>,
    oi_1h_normal: Option<f64>,
    oi_1h_strong: Option<f64>,
    btc_veto_threshold: Option<f64>,
    btc_veto_enabled: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct DataSection {
    data_dir: Option<String>,
    check_interval_secs: Option<u64>,
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Self {
        let mut cfg = match fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(_) => {
                tracing::info!(path = %path.display(), "config file absent, using defaults");
                Self::default()
            }
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg
    }

    pub fn from_toml_str(raw: &str) -> Self {
        let file = match toml::from_str::<MonitorFile>(raw) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(error = %err, "config parse failed, using defaults");
                MonitorFile::default()
            }
        };

        let mut cfg = Self::default();
        if let Some(network) = file.network {
            if let Some(v) = network.base_url {
                cfg.base_url = v;
            }
            if let Some(v) = network.http_timeout_secs {
                cfg.http_timeout_secs = v;
            }
            if let Some(v) = network.concurrency_limit {
                cfg.concurrency_limit = v;
            }
            if let Some(v) = network.rate_limit_wait_secs {
                cfg.rate_limit_wait_secs = v.max(1);
            }
            if let Some(v) = network.max_retries {
                cfg.max_retries = v.clamp(1, 10);
            }
        }
        if let Some(telegram) = file.telegram {
            if let Some(v) = telegram.max_alerts_per_cycle {
                cfg.max_alerts_per_cycle = v.max(1);
            }
            if let Some(v) = telegram.strong_only {
                cfg.strong_only = v;
            }
            if let Some(v) = telegram.cooldown_minutes {
                cfg.cooldown_minutes = v;
            }
        }
        if let Some(t) = file.thresholds {
            if let Some(v) = t.min_volume_24h {
                cfg.min_volume_24h = v;
            }
            if let Some(v) = t.reference_symbol {
                cfg.reference_symbol = v;
            }
            if let Some(v) = t.normal_funding {
                cfg.thresholds.normal_funding = v;
            }
            if let Some(v) = t.strong_funding {
                cfg.thresholds.strong_funding = v;
            }
            if let Some(v) = t.normal_oi_ratio {
                cfg.thresholds.normal_oi_ratio = v.max(0.1);
            }
            if let Some(v) = t.strong_oi_ratio {
                cfg.thresholds.strong_oi_ratio = v.max(0.1);
            }
            if let Some(v) = t.short_window {
                cfg.thresholds.short_window = v.max(1);
            }
            if let Some(v) = t.long_window {
                cfg.thresholds.long_window = v.max(cfg.thresholds.short_window);
            }
            if let Some(v) = t.oi_15m_normal {
                cfg.thresholds.oi_15m_normal = v;
            }
            if let Some(v) = t.oi_15m_strong {
                cfg.thresholds.oi_15m_strong = v;
            }
            if let Some(v) = t.oi_1h_normal {
                cfg.thresholds.oi_1h_normal = v;
            }
            if let Some(v) = t.oi_1h_strong {
                cfg.thresholds.oi_1h_strong = v;
            }
            if let Some(v) = t.btc_veto_threshold {
                cfg.thresholds.btc_veto_threshold = v;
            }
            if let Some(v) = t.btc_veto_enabled {
                cfg.thresholds.btc_veto_enabled = v;
            }
        }
        if let Some(data) = file.data {
            if let Some(v) = data.data_dir {
                cfg.data_dir = v;
            }
            if let Some(v) = data.check_interval_secs {
                cfg.check_interval_secs = v;
            }
        }
        cfg
    }

    /// Environment wins over file values. The lookup is injected so tests
    /// do not touch the process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |v: String| {
            let trimmed = v.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        };
        if let Some(v) = lookup("TELEGRAM_BOT_TOKEN").and_then(non_empty) {
            self.bot_token = Some(v);
        }
        if let Some(v) = lookup("TELEGRAM_CHAT_ID").and_then(non_empty) {
            self.chat_id = Some(v);
        }
        if let Some(v) = lookup("PROXY_URL").and_then(non_empty) {
            self.proxy_url = Some(v);
        }
        if let Some(v) = lookup("CHECK_INTERVAL_SECONDS").and_then(|v| v.parse().ok()) {
            self.check_interval_secs = v;
        }
        if let Some(v) = lookup("MIN_VOLUME_USDT").and_then(|v| v.parse().ok()) {
            self.min_volume_24h = v;
        }
        if let Some(v) = lookup("ALERT_COOLDOWN_MINUTES").and_then(|v| v.parse().ok()) {
            self.cooldown_minutes = v;
        }
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.http_timeout_secs == 0 {
            errors.push("network.http_timeout_secs must be greater than 0".to_string());
        }
        if self.concurrency_limit == 0 {
            errors.push("network.concurrency_limit must be greater than 0".to_string());
        }
        if self.check_interval_secs < 60 {
            errors.push("data.check_interval_secs must be at least 60".to_string());
        }
        if self.min_volume_24h < 0.0 {
            errors.push("thresholds.min_volume_24h must not be negative".to_string());
        }
        if self.cooldown_minutes <= 0 {
            errors.push("telegram.cooldown_minutes must be greater than 0".to_string());
        }
        errors
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            base_url: self.base_url.clone(),
            proxy_url: self.proxy_url.clone(),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
            concurrency_limit: self.concurrency_limit,
            rate_limit_wait: Duration::from_secs(self.rate_limit_wait_secs),
            max_retries: self.max_retries,
            quote_asset: "USDT".to_string(),
            min_volume_24h: self.min_volume_24h,
            reference_symbol: self.reference_symbol.clone(),
        }
    }

    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            cooldown_minutes: self.cooldown_minutes,
            max_alerts_per_cycle: self.max_alerts_per_cycle,
            strong_only: self.strong_only,
            pacing_ms: 1_000,
        }
    }

    pub fn telegram_config(&self) -> TelegramConfig {
        TelegramConfig {
            bot_token: self.bot_token.clone(),
            chat_id: self.chat_id.clone(),
            proxy_url: self.proxy_url.clone(),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
        }
    }
}
