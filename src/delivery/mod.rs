//! Rate-limited, retrying delivery of formatted messages to the chat API.

pub mod rate_limit;
pub mod retry;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DeliveryConfig;
use crate::error::{excerpt, DeliveryError, SendFailure};
use crate::event::{DeliveryBatch, FormattedMessage};
use crate::platform::ChatApi;
use crate::stats::Statistics;

use self::rate_limit::RateLimiter;
use self::retry::{RetryDecision, RetryPolicy};

const LOG_EXCERPT: usize = 120;

pub struct DeliveryClient {
    api: Arc<dyn ChatApi>,
    limiter: RateLimiter,
    policy: RetryPolicy,
    stats: Arc<Statistics>,
    cancel: CancellationToken,
}

impl DeliveryClient {
    pub fn new(
        api: Arc<dyn ChatApi>,
        config: &DeliveryConfig,
        stats: Arc<Statistics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            limiter: RateLimiter::new(config.rate_limit_interval()),
            policy: RetryPolicy::from_config(config),
            stats,
            cancel,
        }
    }

    /// Startup credential check
    pub async fn verify(&self) -> Result<String, SendFailure> {
        self.api.verify().await
    }

    /// Deliver one message. Failed messages are counted and discarded.
    pub async fn send(&self, message: &FormattedMessage) -> Result<(), DeliveryError> {
        let result = self.attempt(message).await;
        match &result {
            Ok(()) => {
                self.stats.record_processed();
                debug!("Delivered {} message", message.kind.as_str());
            }
            Err(DeliveryError::Cancelled) => {
                self.stats.record_error();
                warn!(
                    "Delivery abandoned at shutdown (text: {})",
                    excerpt(&message.text, LOG_EXCERPT)
                );
            }
            Err(e) => {
                self.stats.record_error();
                error!(
                    "Delivery of {} message failed: {} (text: {})",
                    message.kind.as_str(),
                    e,
                    excerpt(&message.text, LOG_EXCERPT)
                );
            }
        }
        result
    }

    /// Photo first when the message has one; a rejected photo falls back to text.
    async fn attempt(&self, message: &FormattedMessage) -> Result<(), DeliveryError> {
        if let Some(photo) = &message.photo {
            match self
                .retrying(|| self.api.send_photo(&photo.url, &photo.caption))
                .await
            {
                Ok(()) => return Ok(()),
                Err(DeliveryError::Cancelled) => return Err(DeliveryError::Cancelled),
                Err(e) => warn!("Photo {} not delivered ({}), sending as text", photo.url, e),
            }
        }
        self.retrying(|| self.api.send_text(&message.text)).await
    }

    async fn retrying<F, Fut>(&self, mut call: F) -> Result<(), DeliveryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), SendFailure>>,
    {
        let mut retry = self.policy.start();
        loop {
            if !self.limiter.acquire(&self.cancel).await {
                return Err(DeliveryError::Cancelled);
            }

            let outcome = tokio::select! {
                outcome = call() => outcome,
                _ = self.cancel.cancelled() => return Err(DeliveryError::Cancelled),
            };
            let failure = match outcome {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            match retry.on_failure(failure.clone()) {
                RetryDecision::Retry(wait) => {
                    warn!(
                        "Send attempt {} failed: {}, retrying in {:?}",
                        retry.attempts(),
                        failure,
                        wait
                    );
                    tokio::select! {
                        _ = sleep(wait) => {}
                        _ = self.cancel.cancelled() => return Err(DeliveryError::Cancelled),
                    }
                }
                RetryDecision::Abort(err) => return Err(err),
            }
        }
    }

    /// Send every message in order. One result per message; a failure does
    /// not stop the rest of the batch.
    pub async fn send_batch(&self, batch: &DeliveryBatch) -> Vec<Result<(), DeliveryError>> {
        debug!(
            "Sending batch of {} message(s), at least {:?}",
            batch.len(),
            batch.estimated_send_time(self.limiter.interval())
        );
        let mut results = Vec::with_capacity(batch.len());
        for message in batch.iter() {
            results.push(self.send(message).await);
        }

        let delivered = results.iter().filter(|r| r.is_ok()).count();
        info!("Delivered {}/{} messages in batch", delivered, batch.len());
        results
    }

    /// Drain batches from the processor until the channel closes.
    pub async fn run(self, mut batches: mpsc::Receiver<DeliveryBatch>) {
        while let Some(batch) = batches.recv().await {
            if batch.is_empty() {
                continue;
            }
            self.send_batch(&batch).await;
        }
        info!("Delivery client stopped");
    }
}
