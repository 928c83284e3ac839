//! Notification delivery
//!
//! Handles:
//! - The `NotificationSink` contract (send one formatted message)
//! - Retry policy: transport errors and 5xx responses are retried, 4xx are not
//! - The Telegram bot API sink

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::TelegramConfig;
use crate::error::NotifyError;
use crate::observability::DetectorMetrics;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts one formatted message
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Retry budget for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Extra attempts after a timeout or connection failure
    pub transport_retries: u32,
    /// Extra attempts after a 5xx response
    pub server_retries: u32,
    pub base_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            transport_retries: 2,
            server_retries: 1,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl DeliveryPolicy {
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Delivers messages through a sink, applying a [`DeliveryPolicy`]
#[derive(Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    policy: DeliveryPolicy,
    metrics: DetectorMetrics,
}

impl Notifier {
    pub fn new(sink: Arc<dyn NotificationSink>, policy: DeliveryPolicy) -> Self {
        Self {
            sink,
            policy,
            metrics: DetectorMetrics::new(),
        }
    }

    /// Deliver `text`, returning whether the sink accepted it
    pub async fn deliver(&self, text: &str) -> bool {
        let mut transport_retries = 0;
        let mut server_retries = 0;

        loop {
            let retry = transport_retries + server_retries;
            match self.sink.send(text).await {
                Ok(()) => {
                    self.metrics.inc_notify_attempts("ok");
                    debug!(attempts = retry + 1, "Notification delivered");
                    return true;
                }
                Err(e) if e.is_transport() && transport_retries < self.policy.transport_retries => {
                    self.metrics.inc_notify_attempts("transport_error");
                    let delay = self.policy.delay_for(retry);
                    warn!(
                        error = %e,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Transport error sending notification, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    transport_retries += 1;
                }
                Err(NotifyError::Server(status))
                    if server_retries < self.policy.server_retries =>
                {
                    self.metrics.inc_notify_attempts("server_error");
                    let delay = self.policy.delay_for(retry);
                    warn!(
                        status = status,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Notification sink returned server error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    server_retries += 1;
                }
                Err(NotifyError::NotConfigured) => {
                    self.metrics.inc_notify_attempts("not_configured");
                    warn!("Notification sink not configured, skipping alert");
                    return false;
                }
                Err(e) => {
                    self.metrics.inc_notify_attempts("failed");
                    error!(error = %e, attempts = retry + 1, "Notification delivery failed");
                    return false;
                }
            }
        }
    }
}

/// Telegram bot `sendMessage` sink, plain text
pub struct TelegramSink {
    client: reqwest::Client,
    endpoint: Option<String>,
    chat_id: String,
}

impl TelegramSink {
    /// Build a sink against `api_base`; an unconfigured bot yields a sink that
    /// always reports [`NotifyError::NotConfigured`]
    pub fn new(config: &TelegramConfig, api_base: &str) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Other(e.to_string()))?;

        let endpoint = config.is_configured().then(|| {
            format!(
                "{}/bot{}/sendMessage",
                api_base.trim_end_matches('/'),
                config.bot_token
            )
        });

        Ok(Self {
            client,
            endpoint,
            chat_id: config.chat_id.clone(),
        })
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let Some(endpoint) = self.endpoint.as_deref() else {
            return Err(NotifyError::NotConfigured);
        };

        let response = self
            .client
            .post(endpoint)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text)])
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_server_error() {
            Err(NotifyError::Server(status.as_u16()))
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(
                status = status.as_u16(),
                body = %body.chars().take(200).collect::<String>(),
                "Telegram API rejected message"
            );
            Err(NotifyError::Client(status.as_u16()))
        }
    }
}

fn classify_transport(e: reqwest::Error) -> NotifyError {
    if e.is_timeout() {
        NotifyError::Timeout
    } else if e.is_connect() {
        NotifyError::Connection(e.to_string())
    } else {
        NotifyError::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Sink that replays a fixed sequence of results, then succeeds
    struct ScriptedSink {
        script: Mutex<VecDeque<Result<(), NotifyError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedSink {
        fn new(script: Vec<Result<(), NotifyError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl NotificationSink for ScriptedSink {
        async fn send(&self, _text: &str) -> Result<(), NotifyError> {
            *self.calls.lock().unwrap() += 1;
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn telegram() -> TelegramConfig {
        TelegramConfig {
            bot_token: "TOKEN".to_string(),
            chat_id: "42".to_string(),
        }
    }

    #[tokio::test]
    async fn test_transport_errors_retried_twice() {
        let sink = ScriptedSink::new(vec![
            Err(NotifyError::Timeout),
            Err(NotifyError::Connection("reset".into())),
        ]);
        let notifier = Notifier::new(sink.clone(), DeliveryPolicy::immediate());
        assert!(notifier.deliver("hi").await);
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn test_transport_retries_exhausted() {
        let sink = ScriptedSink::new(vec![Err(NotifyError::Timeout); 3]);
        let notifier = Notifier::new(sink.clone(), DeliveryPolicy::immediate());
        assert!(!notifier.deliver("hi").await);
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn test_server_error_retried_once() {
        let sink = ScriptedSink::new(vec![Err(NotifyError::Server(502)), Err(NotifyError::Server(503))]);
        let notifier = Notifier::new(sink.clone(), DeliveryPolicy::immediate());
        assert!(!notifier.deliver("hi").await);
        assert_eq!(sink.calls(), 2);
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let sink = ScriptedSink::new(vec![Err(NotifyError::Client(400))]);
        let notifier = Notifier::new(sink.clone(), DeliveryPolicy::immediate());
        assert!(!notifier.deliver("hi").await);
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_one_then_two_seconds() {
        let sink = ScriptedSink::new(vec![Err(NotifyError::Timeout), Err(NotifyError::Timeout)]);
        let notifier = Notifier::new(sink, DeliveryPolicy::default());
        let started = tokio::time::Instant::now();
        assert!(notifier.deliver("hi").await);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_telegram_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("chat_id".into(), "42".into()),
                Matcher::UrlEncoded("text".into(), "abuse on E2ABC".into()),
            ]))
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .expect(1)
            .create_async()
            .await;

        let sink = TelegramSink::new(&telegram(), &server.url()).unwrap();
        assert_eq!(sink.send("abuse on E2ABC").await, Ok(()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_telegram_status_classification() {
        for (status, expected) in [
            (502, NotifyError::Server(502)),
            (400, NotifyError::Client(400)),
            (403, NotifyError::Client(403)),
        ] {
            let mut server = mockito::Server::new_async().await;
            server
                .mock("POST", "/botTOKEN/sendMessage")
                .with_status(status)
                .with_body(r#"{"ok":false,"description":"rejected"}"#)
                .create_async()
                .await;
            let sink = TelegramSink::new(&telegram(), &server.url()).unwrap();
            assert_eq!(sink.send("x").await, Err(expected));
        }
    }

    #[tokio::test]
    async fn test_notifier_retries_telegram_5xx_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTOKEN/sendMessage")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let sink = Arc::new(TelegramSink::new(&telegram(), &server.url()).unwrap());
        let notifier = Notifier::new(sink, DeliveryPolicy::immediate());
        assert!(!notifier.deliver("x").await);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unconfigured_telegram() {
        let sink = TelegramSink::new(&TelegramConfig::default(), TELEGRAM_API_BASE).unwrap();
        assert_eq!(sink.send("x").await, Err(NotifyError::NotConfigured));
        let notifier = Notifier::new(Arc::new(sink), DeliveryPolicy::immediate());
        assert!(!notifier.deliver("x").await);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        // nothing listens on port 1
        let sink = TelegramSink::new(&telegram(), "http://127.0.0.1:1").unwrap();
        let err = sink.send("x").await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err:?}");
    }
}
