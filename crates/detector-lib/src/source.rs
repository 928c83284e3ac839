//! Collaborators that supply distributions and their metrics

use async_trait::async_trait;

use crate::error::SourceError;
use crate::models::{Account, DistributionMetrics, EntityId};

/// Batched metrics for one distribution: current window sums and 24h averages
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch(&self, entity: &EntityId) -> Result<DistributionMetrics, SourceError>;
}

/// Lists the distributions that belong to an account
#[async_trait]
pub trait DistributionDirectory: Send + Sync {
    async fn list_distributions(&self, account: &Account) -> Result<Vec<String>, SourceError>;
}
