//! Detection configuration
//!
//! Every field has a default so a partial source (environment, file) only
//! needs to name what it overrides. `validate()` reports every violation at
//! once rather than stopping at the first.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;
use crate::models::MetricKind;

const MIB: u64 = 1024 * 1024;

/// Absolute floors and percentage baseline for one metric kind
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricThresholds {
    pub critical_absolute: f64,
    pub warning_absolute: f64,
    /// Denominator floor for percentage change on low-traffic distributions
    pub minimum_baseline: f64,
}

/// Relative, absolute and duration thresholds for abuse detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub critical_multiplier: f64,
    pub warning_multiplier: f64,
    pub requests: MetricThresholds,
    pub bytes: MetricThresholds,
    /// Consecutive critical detections required before alerting
    pub critical_duration: u64,
    /// Consecutive warning detections required before alerting
    pub warning_duration: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            critical_multiplier: 3.0,
            warning_multiplier: 2.0,
            // Tuned for 15-minute windows
            requests: MetricThresholds {
                critical_absolute: 2500.0,
                warning_absolute: 1250.0,
                minimum_baseline: 25.0,
            },
            bytes: MetricThresholds {
                critical_absolute: (1280 * MIB) as f64,
                warning_absolute: (512 * MIB) as f64,
                minimum_baseline: (25 * MIB) as f64,
            },
            critical_duration: 1,
            warning_duration: 2,
        }
    }
}

impl ThresholdConfig {
    pub fn for_metric(&self, metric: MetricKind) -> &MetricThresholds {
        match metric {
            MetricKind::Requests => &self.requests,
            MetricKind::BytesDownloaded => &self.bytes,
        }
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if !(self.warning_multiplier > 0.0) {
            errors.push(format!(
                "warning multiplier must be positive, got {}",
                self.warning_multiplier
            ));
        }
        if !(self.critical_multiplier > self.warning_multiplier) {
            errors.push(format!(
                "critical multiplier ({}) must exceed warning multiplier ({})",
                self.critical_multiplier, self.warning_multiplier
            ));
        }
        if self.critical_duration < 1 {
            errors.push(format!(
                "critical duration must be at least 1, got {}",
                self.critical_duration
            ));
        }
        if self.warning_duration < 1 {
            errors.push(format!(
                "warning duration must be at least 1, got {}",
                self.warning_duration
            ));
        }
        for metric in MetricKind::ALL {
            let t = self.for_metric(metric);
            if !(t.warning_absolute >= 0.0) {
                errors.push(format!(
                    "{metric} warning threshold cannot be negative, got {}",
                    t.warning_absolute
                ));
            }
            if !(t.minimum_baseline >= 0.0) {
                errors.push(format!(
                    "{metric} minimum baseline cannot be negative, got {}",
                    t.minimum_baseline
                ));
            }
            if t.warning_absolute > t.critical_absolute {
                errors.push(format!(
                    "{metric} warning threshold ({}) cannot exceed critical threshold ({})",
                    t.warning_absolute, t.critical_absolute
                ));
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Durable table names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub abuse_counters: String,
    pub sent_alerts: String,
    pub failed_accounts: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            abuse_counters: "CF_Abuse_Counter".to_string(),
            sent_alerts: "CF_Sent_Alerts".to_string(),
            failed_accounts: "CF_Failed_Accounts".to_string(),
        }
    }
}

/// Item retention in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub abuse_counter_secs: i64,
    pub sent_alerts_secs: i64,
    pub failed_accounts_secs: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            abuse_counter_secs: 30 * 24 * 3600,
            sent_alerts_secs: 24 * 3600,
            failed_accounts_secs: 7 * 24 * 3600,
        }
    }
}

/// Worker counts per fan-out tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub account_workers: usize,
    pub distribution_workers: usize,
    pub alert_workers: usize,
    pub alert_queue_capacity: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            account_workers: 12,
            distribution_workers: 5,
            alert_workers: 5,
            alert_queue_capacity: 256,
        }
    }
}

/// Distributions below both floors are skipped entirely
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficFloor {
    pub min_requests: f64,
    pub min_bytes: f64,
}

impl Default for TrafficFloor {
    fn default() -> Self {
        Self {
            min_requests: 1000.0,
            min_bytes: (500 * MIB) as f64,
        }
    }
}

impl TrafficFloor {
    pub fn is_below(&self, current_requests: f64, current_bytes: f64) -> bool {
        current_requests < self.min_requests && current_bytes < self.min_bytes
    }
}

/// Telegram bot credentials; both empty means notifications are disabled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

/// Complete detection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub thresholds: ThresholdConfig,
    pub tables: TableConfig,
    pub retention: RetentionConfig,
    pub concurrency: ConcurrencyConfig,
    pub traffic_floor: TrafficFloor,
    pub telegram: TelegramConfig,
    /// Hours from UTC used when rendering alert timestamps
    pub display_timezone_offset: i32,
    /// Upper bound on waiting for queued alerts at the end of a cycle
    pub drain_timeout_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            tables: TableConfig::default(),
            retention: RetentionConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            traffic_floor: TrafficFloor::default(),
            telegram: TelegramConfig::default(),
            display_timezone_offset: 8,
            drain_timeout_secs: 30,
        }
    }
}

impl DetectorConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        self.thresholds.collect_errors(&mut errors);

        for (name, table) in [
            ("abuse counter", &self.tables.abuse_counters),
            ("sent alerts", &self.tables.sent_alerts),
            ("failed accounts", &self.tables.failed_accounts),
        ] {
            if table.is_empty() {
                errors.push(format!("{name} table name cannot be empty"));
            }
        }

        for (name, secs) in [
            ("abuse counter", self.retention.abuse_counter_secs),
            ("sent alerts", self.retention.sent_alerts_secs),
            ("failed accounts", self.retention.failed_accounts_secs),
        ] {
            if secs < 0 {
                errors.push(format!("{name} TTL cannot be negative, got {secs}"));
            }
        }

        for (name, workers) in [
            ("account", self.concurrency.account_workers),
            ("distribution", self.concurrency.distribution_workers),
            ("alert", self.concurrency.alert_workers),
        ] {
            if workers < 1 {
                errors.push(format!("{name} workers must be at least 1, got {workers}"));
            }
        }
        if self.concurrency.alert_queue_capacity < 1 {
            errors.push("alert queue capacity must be at least 1".to_string());
        }

        if !(self.traffic_floor.min_requests >= 0.0) || !(self.traffic_floor.min_bytes >= 0.0) {
            errors.push("traffic floor values cannot be negative".to_string());
        }

        if self.telegram.bot_token.is_empty() != self.telegram.chat_id.is_empty() {
            errors.push("telegram bot token and chat id must be set together, or neither".to_string());
        }

        if !(-12..=14).contains(&self.display_timezone_offset) {
            errors.push(format!(
                "display timezone offset must be between -12 and +14, got {}",
                self.display_timezone_offset
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}
