//! HTTP adapter for the metrics and distribution gateway
//!
//! `GET {base}/accounts/{id}/distributions` returns `{"distributions": [...]}`
//! and `GET {base}/accounts/{id}/distributions/{dist}/metrics` returns the
//! current window sums and trailing averages for one distribution.

use async_trait::async_trait;
use detector_lib::source::{DistributionDirectory, MetricsSource};
use detector_lib::{Account, DistributionMetrics, EntityId, SourceError};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct DistributionList {
    distributions: Vec<String>,
}

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base: Url,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Request(format!("base url {} cannot have paths", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T, SourceError> {
        let resource = url.path().to_string();
        debug!(url = %url, "Gateway request");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                resource,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl MetricsSource for HttpGateway {
    async fn fetch(&self, entity: &EntityId) -> Result<DistributionMetrics, SourceError> {
        let url = self.url(&[
            "accounts",
            &entity.account_id,
            "distributions",
            &entity.distribution_id,
            "metrics",
        ])?;
        self.get_json(url).await
    }
}

#[async_trait]
impl DistributionDirectory for HttpGateway {
    async fn list_distributions(&self, account: &Account) -> Result<Vec<String>, SourceError> {
        let url = self.url(&["accounts", &account.id, "distributions"])?;
        let list: DistributionList = self.get_json(url).await?;
        Ok(list.distributions)
    }
}
