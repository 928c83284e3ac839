//! Bounded alert dispatch pool
//!
//! Alerts are queued on a bounded channel and delivered by a fixed number of
//! workers. `drain` waits until every queued alert has been processed or the
//! timeout elapses; deliveries still running after a timeout are not
//! cancelled and are counted by the next drain.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Alert, AlertDeduplicator, Notifier};
use crate::clock::Clock;
use crate::observability::{DetectorMetrics, StructuredLogger};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("alert dispatcher is shut down")]
    Closed,
}

/// Outcome of a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Alerts delivered since the previous drain
    pub sent: usize,
    /// Alerts that failed delivery since the previous drain
    pub failed: usize,
    /// Alerts still queued or in flight when the drain returned
    pub pending: usize,
    pub timed_out: bool,
}

#[derive(Default)]
struct DispatchState {
    pending: AtomicUsize,
    sent: AtomicUsize,
    failed: AtomicUsize,
    idle: Notify,
}

/// Everything a worker needs to deliver one alert
struct DeliveryContext {
    notifier: Notifier,
    dedup: Arc<AlertDeduplicator>,
    clock: Arc<dyn Clock>,
    display_offset_hours: i32,
    logger: StructuredLogger,
    metrics: DetectorMetrics,
}

pub struct AlertDispatcher {
    sender: Mutex<Option<mpsc::Sender<Alert>>>,
    state: Arc<DispatchState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    metrics: DetectorMetrics,
}

impl AlertDispatcher {
    /// Spawn `workers` delivery tasks over a queue of `capacity` alerts
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        notifier: Notifier,
        dedup: Arc<AlertDeduplicator>,
        clock: Arc<dyn Clock>,
        display_offset_hours: i32,
        logger: StructuredLogger,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let state = Arc::new(DispatchState::default());
        let metrics = DetectorMetrics::new();
        let ctx = Arc::new(DeliveryContext {
            notifier,
            dedup,
            clock,
            display_offset_hours,
            logger,
            metrics: metrics.clone(),
        });

        let handles = (0..workers.max(1))
            .map(|id| {
                let rx = rx.clone();
                let state = state.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { worker_loop(id, rx, state, ctx).await })
            })
            .collect();

        info!(workers = workers.max(1), capacity = capacity.max(1), "Alert dispatcher started");

        Self {
            sender: Mutex::new(Some(tx)),
            state,
            workers: Mutex::new(handles),
            metrics,
        }
    }

    /// Queue an alert, waiting for room when the queue is full
    pub async fn enqueue(&self, alert: Alert) -> Result<(), DispatchError> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().cloned())
            .ok_or(DispatchError::Closed)?;

        let depth = self.state.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.set_alert_queue_depth(depth as i64);

        if sender.send(alert).await.is_err() {
            finish_one(&self.state, &self.metrics);
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    /// Alerts queued or in flight
    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    /// Wait until the queue is empty or `timeout` elapses
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        let state = self.state.clone();
        let wait_idle = async move {
            loop {
                let notified = state.idle.notified();
                tokio::pin!(notified);
                // register before checking so a completion in between is not missed
                notified.as_mut().enable();
                if state.pending.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };

        let timed_out = tokio::time::timeout(timeout, wait_idle).await.is_err();
        let report = DrainReport {
            sent: self.state.sent.swap(0, Ordering::SeqCst),
            failed: self.state.failed.swap(0, Ordering::SeqCst),
            pending: self.pending(),
            timed_out,
        };

        if timed_out {
            warn!(
                pending = report.pending,
                sent = report.sent,
                failed = report.failed,
                timeout_secs = timeout.as_secs_f64(),
                "Alert drain timed out, deliveries continue in background"
            );
        } else {
            debug!(sent = report.sent, failed = report.failed, "Alert queue drained");
        }
        report
    }

    /// Drain, then close the queue and wait for the workers to exit
    pub async fn shutdown(&self, timeout: Duration) -> DrainReport {
        let report = self.drain(timeout).await;

        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .map(|mut guard| guard.drain(..).collect())
            .unwrap_or_default();

        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            warn!("Alert workers did not exit before timeout");
        }

        info!(sent = report.sent, failed = report.failed, "Alert dispatcher shut down");
        report
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<Alert>>>,
    state: Arc<DispatchState>,
    ctx: Arc<DeliveryContext>,
) {
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(alert) = next else {
            debug!(worker = id, "Alert queue closed, worker exiting");
            return;
        };

        let alert_key = alert.alert_key();
        let text = alert.render(ctx.display_offset_hours);
        let delivered = ctx.notifier.deliver(&text).await;

        if delivered {
            ctx.dedup.record_sent(&alert, ctx.clock.now()).await;
            state.sent.fetch_add(1, Ordering::SeqCst);
            ctx.metrics.inc_alerts("sent");
        } else {
            ctx.dedup.release(&alert_key);
            state.failed.fetch_add(1, Ordering::SeqCst);
            ctx.metrics.inc_alerts("failed");
        }
        ctx.logger.log_alert_delivery(&alert_key, delivered);

        finish_one(&state, &ctx.metrics);
    }
}

fn finish_one(state: &DispatchState, metrics: &DetectorMetrics) {
    let remaining = state.pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    metrics.set_alert_queue_depth(remaining as i64);
    if remaining == 0 {
        state.idle.notify_waiters();
    }
}
