//! Component health for the detection worker
//!
//! Components report their own state; the worker's `/healthz` and `/readyz`
//! endpoints read it back. A cycle summary is folded into the
//! `detection_cycle`, `metrics_source` and `notifier` components after every run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::processor::{AccountOutcome, CycleSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but some units of work failed
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// `/healthz` body; the overall status is the worst component status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const STORE: &str = "store";
    pub const NOTIFIER: &str = "notifier";
    pub const METRICS_SOURCE: &str = "metrics_source";
    pub const DETECTION_CYCLE: &str = "detection_cycle";

    pub const ALL: [&str; 4] = [STORE, NOTIFIER, METRICS_SOURCE, DETECTION_CYCLE];
}

#[derive(Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
    last_cycle: Option<DateTime<Utc>>,
}

/// Shared, cloneable view of component health
#[derive(Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every worker component as healthy
    pub async fn register_all(&self) {
        let mut state = self.state.write().await;
        for name in components::ALL {
            state
                .components
                .insert(name.to_string(), ComponentHealth::healthy());
        }
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    /// Fold a finished cycle into component health
    ///
    /// Every account failing marks the cycle unhealthy and some failing
    /// degrades it. Zero-metric fallbacks degrade the metrics source; failed
    /// or still-pending alerts degrade the notifier, and only a delivery
    /// restores it.
    pub async fn record_cycle(&self, summary: &CycleSummary) {
        let attempted = summary.accounts_processed + summary.accounts_failed;
        let cycle = if attempted > 0 && summary.accounts_processed == 0 {
            ComponentHealth::unhealthy(format!("all {attempted} accounts failed"))
        } else if summary.accounts_failed > 0 || !summary.errors.is_empty() {
            ComponentHealth::degraded(format!(
                "{} accounts failed, {} errors",
                summary.accounts_failed,
                summary.errors.len()
            ))
        } else {
            ComponentHealth::healthy()
        };

        let fallbacks = summary
            .outcomes
            .iter()
            .filter_map(|o| match o {
                AccountOutcome::Processed { distributions, .. } => {
                    Some(distributions.iter().filter(|d| d.source_fallback).count())
                }
                _ => None,
            })
            .sum::<usize>();
        let source = if fallbacks > 0 {
            ComponentHealth::degraded(format!("{fallbacks} distributions used zero metrics"))
        } else {
            ComponentHealth::healthy()
        };

        // a cycle without deliveries says nothing about the notifier
        let notifier = if summary.alerts_failed > 0 || summary.alerts_pending > 0 {
            Some(ComponentHealth::degraded(format!(
                "{} alerts failed, {} pending",
                summary.alerts_failed, summary.alerts_pending
            )))
        } else if summary.alerts_sent > 0 {
            Some(ComponentHealth::healthy())
        } else {
            None
        };

        let mut state = self.state.write().await;
        state
            .components
            .insert(components::DETECTION_CYCLE.to_string(), cycle);
        state
            .components
            .insert(components::METRICS_SOURCE.to_string(), source);
        if let Some(notifier) = notifier {
            state
                .components
                .insert(components::NOTIFIER.to_string(), notifier);
        }
        state.last_cycle = Some(Utc::now());
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: state.components.clone(),
            last_cycle: state.last_cycle,
        }
    }

    /// Ready once started, unless the store is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        let store_down = state
            .components
            .get(components::STORE)
            .is_some_and(|c| c.status == ComponentStatus::Unhealthy);

        let reason = if !state.ready {
            Some("worker not yet initialized".to_string())
        } else if store_down {
            Some("store unhealthy".to_string())
        } else {
            None
        };
        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}
