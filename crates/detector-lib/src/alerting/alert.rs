//! Alert payload and its plain-text rendering

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::hour_bucket;
use crate::detection::Severity;
use crate::models::{Account, MetricKind};

/// One abuse alert, ready to be deduplicated and delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub account: Account,
    pub distribution_id: String,
    pub metric: MetricKind,
    pub severity: Severity,
    pub current_value: f64,
    pub baseline_value: f64,
    /// Multiplier whose threshold was exceeded
    pub multiplier: f64,
    pub consecutive_count: u64,
    pub timestamp: DateTime<Utc>,
    pub percentage_change: f64,
}

impl Alert {
    /// Dedup key, `account#distribution#Metric#YYYYmmddHH` from the alert timestamp
    pub fn alert_key(&self) -> String {
        format!(
            "{}#{}#{}#{}",
            self.account.id,
            self.distribution_id,
            self.metric,
            hour_bucket(self.timestamp)
        )
    }

    pub fn threshold_value(&self) -> f64 {
        self.baseline_value * self.multiplier
    }

    /// Render the notification text, showing the timestamp at `offset_hours` from UTC
    pub fn render(&self, offset_hours: i32) -> String {
        let header = match self.severity {
            Severity::Critical => "[CRITICAL] CDN traffic alert",
            _ => "[WARNING] CDN traffic alert",
        };

        let (current, baseline, threshold) = match self.metric {
            MetricKind::Requests => (
                format!("{} requests", format_count(self.current_value)),
                format!("{} requests", format_count(self.baseline_value)),
                format!("{} requests", format_count(self.threshold_value())),
            ),
            MetricKind::BytesDownloaded => (
                format_bytes(self.current_value),
                format_bytes(self.baseline_value),
                format_bytes(self.threshold_value()),
            ),
        };

        format!(
            "{header}\n\
             The following distribution has triggered a traffic alert (suspected abuse).\n\
             \n\
             Account ID    : {}\n\
             Account Name  : {}\n\
             Account Email : {}\n\
             Distribution  : {}\n\
             Metric        : {}\n\
             \n\
             Current 15 min    : {current}\n\
             Past 24h average  : {baseline}\n\
             Abuse threshold   : {threshold} ({}x)\n\
             Change            : {:+.1}%\n\
             Consecutive count : {}\n\
             \n\
             {}",
            self.account.id,
            self.account.name,
            self.account.email,
            self.distribution_id,
            self.metric,
            self.multiplier,
            self.percentage_change,
            self.consecutive_count,
            display_time(self.timestamp, offset_hours),
        )
    }
}

/// RFC 2822 style timestamp at a fixed hour offset, e.g. `Tue, 03 Feb 2026 14:54:48 +0800`
fn display_time(at: DateTime<Utc>, offset_hours: i32) -> String {
    let shifted = at + Duration::hours(i64::from(offset_hours));
    let sign = if offset_hours >= 0 { '+' } else { '-' };
    format!(
        "{} {sign}{:02}00",
        shifted.format("%a, %d %b %Y %H:%M:%S"),
        offset_hours.unsigned_abs()
    )
}

/// Human-readable byte size with two decimals, 1024-based
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Whole number with thousands separators
pub fn format_count(value: f64) -> String {
    let rounded = format!("{:.0}", value.abs());
    let mut grouped = String::with_capacity(rounded.len() + rounded.len() / 3);
    for (i, digit) in rounded.chars().enumerate() {
        if i > 0 && (rounded.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if value < 0.0 && rounded != "0" {
        format!("-{grouped}")
    } else {
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alert(metric: MetricKind, severity: Severity) -> Alert {
        Alert {
            account: Account {
                id: "111122223333".to_string(),
                name: "media-prod".to_string(),
                email: "ops@example.com".to_string(),
            },
            distribution_id: "E2ABC".to_string(),
            metric,
            severity,
            current_value: 3000.0,
            baseline_value: 500.0,
            multiplier: 3.0,
            consecutive_count: 1,
            timestamp: Utc.with_ymd_and_hms(2026, 2, 3, 6, 54, 48).unwrap(),
            percentage_change: 500.0,
        }
    }

    #[test]
    fn test_alert_key_uses_hour_bucket() {
        let a = alert(MetricKind::Requests, Severity::Critical);
        assert_eq!(a.alert_key(), "111122223333#E2ABC#Requests#2026020306");
    }

    #[test]
    fn test_render_requests() {
        let text = alert(MetricKind::Requests, Severity::Critical).render(8);
        assert!(text.starts_with("[CRITICAL]"));
        assert!(text.contains("Account Name  : media-prod"));
        assert!(text.contains("Current 15 min    : 3,000 requests"));
        assert!(text.contains("Abuse threshold   : 1,500 requests (3x)"));
        assert!(text.contains("Change            : +500.0%"));
        assert!(text.ends_with("Tue, 03 Feb 2026 14:54:48 +0800"));
    }

    #[test]
    fn test_render_bytes_and_negative_offset() {
        let mut a = alert(MetricKind::BytesDownloaded, Severity::Warning);
        a.current_value = 2.0 * 1024.0 * 1024.0 * 1024.0;
        a.baseline_value = 512.0 * 1024.0 * 1024.0;
        a.multiplier = 2.0;
        let text = a.render(-5);
        assert!(text.starts_with("[WARNING]"));
        assert!(text.contains("Current 15 min    : 2.00 GB"));
        assert!(text.contains("Abuse threshold   : 1.00 GB (2x)"));
        assert!(text.ends_with("Tue, 03 Feb 2026 01:54:48 -0500"));
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_bytes(0.0), "0.00 B");
        assert_eq!(format_bytes(1536.0), "1.50 KB");
        assert_eq!(format_count(0.0), "0");
        assert_eq!(format_count(999.0), "999");
        assert_eq!(format_count(1234567.4), "1,234,567");
    }
}
