//! One detection cycle over a batch of accounts
//!
//! Accounts fan out on a semaphore of `account_workers`; inside each account
//! the distributions fan out on a semaphore of `distribution_workers`. Each
//! unit of work runs in its own task so a panic is caught at its boundary and
//! reported with the id it belongs to. After every account has finished the
//! alert queue is drained with a bounded wait.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{DistributionProcessor, DistributionReport, FailedAccountRegistry, MetricOutcome};
use crate::alerting::AlertDispatcher;
use crate::config::ConcurrencyConfig;
use crate::models::Account;
use crate::observability::{DetectorMetrics, StructuredLogger};
use crate::source::DistributionDirectory;

/// What happened to one account in a cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AccountOutcome {
    Processed {
        account_id: String,
        distributions: Vec<DistributionReport>,
        /// Distributions whose task panicked
        errors: Vec<String>,
    },
    /// Listed in the failed-account registry
    Skipped { account_id: String },
    Failed { account_id: String, error: String },
}

impl AccountOutcome {
    pub fn account_id(&self) -> &str {
        match self {
            AccountOutcome::Processed { account_id, .. }
            | AccountOutcome::Skipped { account_id }
            | AccountOutcome::Failed { account_id, .. } => account_id,
        }
    }
}

/// Aggregate result of a cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub accounts_processed: usize,
    pub accounts_failed: usize,
    pub accounts_skipped: usize,
    pub distributions_processed: usize,
    pub distributions_skipped: usize,
    /// Samples refused by the evaluator, such as NaN or negative values
    pub metrics_rejected: usize,
    pub alerts_queued: usize,
    pub alerts_sent: usize,
    pub alerts_failed: usize,
    /// Alerts still in flight when the drain gave up
    pub alerts_pending: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
    /// Per-account outcomes ordered by account id
    pub outcomes: Vec<AccountOutcome>,
}

impl CycleSummary {
    fn absorb(&mut self, outcome: &AccountOutcome) {
        match outcome {
            AccountOutcome::Processed {
                account_id,
                distributions,
                errors,
            } => {
                self.accounts_processed += 1;
                for report in distributions {
                    if report.skipped {
                        self.distributions_skipped += 1;
                    } else {
                        self.distributions_processed += 1;
                    }
                    self.alerts_queued += report.alerts_queued();
                    for outcome in &report.metrics {
                        if let MetricOutcome::Rejected { metric, error } = outcome {
                            self.metrics_rejected += 1;
                            self.errors.push(format!("{}#{metric}: {error}", report.entity));
                        }
                    }
                }
                self.errors
                    .extend(errors.iter().map(|e| format!("{account_id}: {e}")));
            }
            AccountOutcome::Skipped { .. } => self.accounts_skipped += 1,
            AccountOutcome::Failed { account_id, error } => {
                self.accounts_failed += 1;
                self.errors.push(format!("{account_id}: {error}"));
            }
        }
    }
}

#[derive(Clone)]
pub struct DetectionCycle {
    directory: Arc<dyn DistributionDirectory>,
    processor: Arc<DistributionProcessor>,
    registry: Arc<FailedAccountRegistry>,
    dispatcher: Arc<AlertDispatcher>,
    concurrency: ConcurrencyConfig,
    drain_timeout: Duration,
    logger: StructuredLogger,
    metrics: DetectorMetrics,
}

impl DetectionCycle {
    pub fn new(
        directory: Arc<dyn DistributionDirectory>,
        processor: Arc<DistributionProcessor>,
        registry: Arc<FailedAccountRegistry>,
        dispatcher: Arc<AlertDispatcher>,
        concurrency: ConcurrencyConfig,
        drain_timeout: Duration,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            directory,
            processor,
            registry,
            dispatcher,
            concurrency,
            drain_timeout,
            logger,
            metrics: DetectorMetrics::new(),
        }
    }

    /// Process every account, then drain the alert queue
    pub async fn run(&self, accounts: Vec<Account>) -> CycleSummary {
        let started = Instant::now();
        self.logger.log_cycle_started(accounts.len());
        self.registry.refresh().await;

        let permits = Arc::new(Semaphore::new(self.concurrency.account_workers.max(1)));
        let mut tasks = JoinSet::new();
        let mut outcomes = Vec::with_capacity(accounts.len());

        for account in accounts {
            if self.registry.is_failed(&account.id) {
                debug!(account_id = %account.id, "Skipping recently failed account");
                outcomes.push(AccountOutcome::Skipped {
                    account_id: account.id,
                });
                continue;
            }

            let cycle = self.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                cycle.isolated_account(account).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                // isolated_account catches panics itself; this is cancellation only
                Err(e) => warn!(error = %e, "Account task did not complete"),
            }
        }
        outcomes.sort_by(|a, b| a.account_id().cmp(b.account_id()));

        let mut summary = CycleSummary::default();
        for outcome in &outcomes {
            summary.absorb(outcome);
            self.metrics.inc_accounts(match outcome {
                AccountOutcome::Processed { .. } => "processed",
                AccountOutcome::Skipped { .. } => "skipped",
                AccountOutcome::Failed { .. } => "failed",
            });
        }
        summary.outcomes = outcomes;

        let drained = self.dispatcher.drain(self.drain_timeout).await;
        summary.alerts_sent = drained.sent;
        summary.alerts_failed = drained.failed;
        summary.alerts_pending = drained.pending;

        let elapsed = started.elapsed();
        summary.duration_ms = elapsed.as_millis() as u64;
        self.metrics.observe_cycle_duration(elapsed.as_secs_f64());
        self.logger.log_cycle_completed(
            summary.accounts_processed,
            summary.accounts_failed,
            summary.alerts_sent,
            summary.alerts_failed,
            elapsed.as_secs_f64(),
        );
        summary
    }

    /// Run one account in its own task and turn a panic into a recorded failure
    async fn isolated_account(&self, account: Account) -> AccountOutcome {
        let account_id = account.id.clone();
        let cycle = self.clone();
        match tokio::spawn(async move { cycle.process_account(account).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = format!("account task failed: {e}");
                self.fail_account(&account_id, &error).await;
                AccountOutcome::Failed { account_id, error }
            }
        }
    }

    async fn process_account(&self, account: Account) -> AccountOutcome {
        let distribution_ids = match self.directory.list_distributions(&account).await {
            Ok(ids) => ids,
            Err(e) => {
                let error = e.to_string();
                self.fail_account(&account.id, &error).await;
                return AccountOutcome::Failed {
                    account_id: account.id,
                    error,
                };
            }
        };
        debug!(
            account_id = %account.id,
            distributions = distribution_ids.len(),
            "Listed distributions"
        );

        let account = Arc::new(account);
        let permits = Arc::new(Semaphore::new(
            self.concurrency.distribution_workers.max(1),
        ));
        let mut tasks = JoinSet::new();
        for distribution_id in distribution_ids {
            let processor = self.processor.clone();
            let account = account.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let task_id = distribution_id.clone();
                tokio::spawn(async move { processor.process(&account, &distribution_id).await })
                    .await
                    .map_err(|e| format!("distribution {task_id} failed: {e}"))
            });
        }

        let mut distributions = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => distributions.push(report),
                Ok(Err(error)) => {
                    warn!(account_id = %account.id, error = %error, "Distribution task failed");
                    errors.push(error);
                }
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "Distribution task did not complete");
                    errors.push(e.to_string());
                }
            }
        }
        distributions.sort_by(|a, b| a.entity.distribution_id.cmp(&b.entity.distribution_id));

        AccountOutcome::Processed {
            account_id: account.id.clone(),
            distributions,
            errors,
        }
    }

    async fn fail_account(&self, account_id: &str, error: &str) {
        self.logger.log_account_failed(account_id, error);
        self.registry.record(account_id, error).await;
    }
}
