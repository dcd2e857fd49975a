//! Outbound notifications (SMS one-time codes) and their delivery worker.
//!
//! Request handlers never wait for delivery. They hand a [`Notification`] to
//! the [`Notifier`], which pushes it onto a bounded channel. A background task
//! drains the channel and gives each message to a [`NotificationSender`],
//! retrying failures with exponential backoff and jitter until the attempt
//! budget is spent. A full or closed channel is logged and dropped.
//!
//! The default sender logs instead of delivering. Configure a webhook URL to
//! post messages to an SMS gateway.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::APP_USER_AGENT;

#[derive(Clone, Serialize)]
pub struct Notification {
    pub receipt: Uuid,
    pub to: String,
    pub body: String,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notification")
            .field("receipt", &self.receipt)
            .field("to", &crate::mfa::device::mask_target(&self.to))
            .finish_non_exhaustive()
    }
}

/// Delivery abstraction used by the notification worker.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    async fn send(&self, message: &Notification) -> Result<()>;
}

/// Local dev sender that logs instead of sending. The body holds a live
/// one-time code, so it is only logged at debug level.
#[derive(Clone, Debug)]
pub struct LogNotificationSender;

#[async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(&self, message: &Notification) -> Result<()> {
        info!(receipt = %message.receipt, "notification send stub");
        debug!(receipt = %message.receipt, body = %message.body, "notification body");
        Ok(())
    }
}

/// Posts `{receipt, to, body}` as JSON to a gateway.
#[derive(Clone, Debug)]
pub struct WebhookNotificationSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotificationSender {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(APP_USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build notification HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationSender for WebhookNotificationSender {
    async fn send(&self, message: &Notification) -> Result<()> {
        let span = info_span!("notify.webhook", receipt = %message.receipt);
        self.client
            .post(&self.url)
            .json(message)
            .send()
            .instrument(span)
            .await
            .context("notification webhook request failed")?
            .error_for_status()
            .context("notification webhook rejected the message")?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NotificationWorkerConfig {
    queue_capacity: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl NotificationWorkerConfig {
    /// Default worker config: 256 queued messages, 5 max attempts, and
    /// 2s->60s exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue_capacity: 256,
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let queue_capacity = self.queue_capacity.max(1);
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            queue_capacity,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for NotificationWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire-and-forget handle on the delivery queue.
#[derive(Clone, Debug)]
pub struct Notifier {
    queue: mpsc::Sender<Notification>,
}

impl Notifier {
    #[must_use]
    pub fn new(queue: mpsc::Sender<Notification>) -> Self {
        Self { queue }
    }

    /// Queue a message without waiting. Returns whether it was queued.
    pub fn dispatch(&self, message: Notification) -> bool {
        let receipt = message.receipt;
        match self.queue.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%receipt, "notification queue full, message dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                error!(%receipt, "notification worker stopped, message dropped");
                false
            }
        }
    }
}

/// Create the queue and spawn the worker draining it.
pub fn spawn_notification_worker(
    sender: Arc<dyn NotificationSender>,
    config: NotificationWorkerConfig,
) -> (Notifier, tokio::task::JoinHandle<()>) {
    let config = config.normalize();
    let (tx, mut rx) = mpsc::channel::<Notification>(config.queue_capacity());
    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let sender = sender.clone();
            tokio::spawn(async move {
                deliver(sender.as_ref(), &message, &config).await;
            });
        }
        debug!("notification queue closed");
    });
    (Notifier::new(tx), handle)
}

async fn deliver(sender: &dyn NotificationSender, message: &Notification, config: &NotificationWorkerConfig) {
    for attempt in 1..=config.max_attempts() {
        match sender.send(message).await {
            Ok(()) => {
                debug!(receipt = %message.receipt, attempt, "notification delivered");
                return;
            }
            Err(err) if attempt < config.max_attempts() => {
                let delay = backoff_delay(attempt, config.backoff_base(), config.backoff_max());
                warn!(receipt = %message.receipt, attempt, "notification delivery failed, retrying in {delay:?}: {err:#}");
                sleep(delay).await;
            }
            Err(err) => {
                error!(receipt = %message.receipt, attempt, "notification delivery failed: {err:#}");
            }
        }
    }
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
