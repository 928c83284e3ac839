//! Core data models for CDN abuse detection

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single (account, distribution) pair under detection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub account_id: String,
    pub distribution_id: String,
}

impl EntityId {
    pub fn new(account_id: impl Into<String>, distribution_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            distribution_id: distribution_id.into(),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.account_id, self.distribution_id)
    }
}

/// Metric kinds evaluated for every distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    Requests,
    BytesDownloaded,
}

impl MetricKind {
    pub const ALL: [MetricKind; 2] = [MetricKind::Requests, MetricKind::BytesDownloaded];

    /// Stable name used in store keys and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Requests => "Requests",
            MetricKind::BytesDownloaded => "BytesDownloaded",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation for one (entity, metric) pair at detection time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub entity: EntityId,
    pub metric: MetricKind,
    /// Sum over the most recent 15-minute window
    pub current_value: f64,
    /// Average per 15-minute sub-interval over the trailing 24 hours
    pub baseline_value: f64,
}

/// Both metrics for one distribution, as returned by a batched metrics source
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DistributionMetrics {
    pub current_requests: f64,
    pub current_bytes: f64,
    pub avg_requests: f64,
    pub avg_bytes: f64,
}

impl DistributionMetrics {
    /// Substitute used when the metrics source fails for an entity
    pub fn zero() -> Self {
        Self::default()
    }

    /// Split into one sample per metric kind
    pub fn samples(&self, entity: &EntityId) -> [MetricSample; 2] {
        [
            MetricSample {
                entity: entity.clone(),
                metric: MetricKind::Requests,
                current_value: self.current_requests,
                baseline_value: self.avg_requests,
            },
            MetricSample {
                entity: entity.clone(),
                metric: MetricKind::BytesDownloaded,
                current_value: self.current_bytes,
                baseline_value: self.avg_bytes,
            },
        ]
    }
}

/// A cloud account, validated from the inbound event payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Email")]
    pub email: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_display() {
        let entity = EntityId::new("111122223333", "E2ABCDEF");
        assert_eq!(entity.to_string(), "111122223333#E2ABCDEF");
    }

    #[test]
    fn test_samples_split() {
        let entity = EntityId::new("1", "D");
        let metrics = DistributionMetrics {
            current_requests: 10.0,
            current_bytes: 20.0,
            avg_requests: 1.0,
            avg_bytes: 2.0,
        };
        let [requests, bytes] = metrics.samples(&entity);
        assert_eq!(requests.metric, MetricKind::Requests);
        assert_eq!(requests.current_value, 10.0);
        assert_eq!(requests.baseline_value, 1.0);
        assert_eq!(bytes.metric, MetricKind::BytesDownloaded);
        assert_eq!(bytes.current_value, 20.0);
        assert_eq!(bytes.baseline_value, 2.0);
    }
}
