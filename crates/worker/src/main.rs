//! Abuse worker - periodic CDN abuse detection
//!
//! Runs a detection cycle over the configured accounts every interval and
//! delivers alerts to Telegram until interrupted.

use abuse_worker::{
    api,
    config::WorkerConfig,
    gateway::HttpGateway,
    pipeline::{Collaborators, Pipeline},
};
use anyhow::{Context, Result};
use detector_lib::{
    alerting::TelegramSink,
    health::{components, HealthRegistry},
    observability::{DetectorMetrics, StructuredLogger},
    store::InMemoryStore,
    Clock, SystemClock,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const WORKER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = WorkerConfig::load()?;
    info!(
        instance = %config.instance,
        interval_secs = config.cycle_interval_secs,
        run_once = config.run_once,
        "Worker configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    // register metrics before the first scrape
    let _metrics = DetectorMetrics::new();
    let logger = StructuredLogger::new(&config.instance);
    logger.log_startup(WORKER_VERSION);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = match &config.store_path {
        Some(path) => InMemoryStore::open(path, clock.clone())
            .with_context(|| format!("failed to open store {}", path.display()))?,
        None => {
            warn!("No store path configured, counters will not survive a restart");
            InMemoryStore::new(clock.clone())
        }
    };
    let store = Arc::new(store);

    if !config.detector.telegram.is_configured() {
        warn!("Telegram is not configured, alerts will not be delivered");
        health_registry
            .set_degraded(components::NOTIFIER, "telegram not configured")
            .await;
    }
    let sink = TelegramSink::new(&config.detector.telegram, &config.telegram_api_base)
        .context("failed to build telegram sink")?;
    let gateway = Arc::new(HttpGateway::new(&config.gateway_url)?);

    let pipeline = Pipeline::build(
        &config.detector,
        Collaborators {
            store,
            source: gateway.clone(),
            directory: gateway,
            sink: Arc::new(sink),
            clock,
        },
        logger.clone(),
    );

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let (stop_api, api_stopped) = oneshot::channel::<()>();
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state.clone(),
        async move {
            let _ = api_stopped.await;
        },
    ));
    health_registry.set_ready(true).await;

    let mut ticker = interval(config.cycle_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let reason = loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cycle(&pipeline, &config, &app_state).await;
                if config.run_once {
                    break "run once completed";
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                break "SIGINT received";
            }
        }
    };

    logger.log_shutdown(reason);
    health_registry.set_ready(false).await;
    let report = pipeline.shutdown().await?;
    info!(
        sent = report.sent,
        failed = report.failed,
        pending = report.pending,
        "Alert queue closed"
    );
    let _ = stop_api.send(());
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %format!("{e:#}"), "API server failed"),
        Err(e) => error!(error = %e, "API server task panicked"),
    }

    Ok(())
}

async fn run_cycle(pipeline: &Pipeline, config: &WorkerConfig, state: &api::AppState) {
    let health = &state.health_registry;
    match pipeline.run_tick(&config.accounts_file).await {
        Ok(summary) => state.record_cycle(summary).await,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Detection cycle did not run");
            health
                .set_unhealthy(components::DETECTION_CYCLE, format!("{e:#}"))
                .await;
        }
    }

    match pipeline.flush_store().await {
        Ok(()) => health.set_healthy(components::STORE).await,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Store flush failed");
            health
                .set_unhealthy(components::STORE, format!("{e:#}"))
                .await;
        }
    }
}
