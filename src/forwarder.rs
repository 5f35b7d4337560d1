//! Wires the stream client, message processor and delivery client together.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::delivery::DeliveryClient;
use crate::event::{DeliveryBatch, RawEvent};
use crate::platform::ChatApi;
use crate::processor::MessageProcessor;
use crate::scheduler::Scheduler;
use crate::stats::{Statistics, StatsSnapshot};
use crate::stream::StreamClient;

pub struct Forwarder {
    config: Config,
    stats: Arc<Statistics>,
    delivery: DeliveryClient,
    delivery_cancel: CancellationToken,
}

/// Running forwarder; dropping it does not stop the pipeline, call `stop`.
pub struct ForwarderHandle {
    shutdown: CancellationToken,
    task: JoinHandle<StatsSnapshot>,
    stats: Arc<Statistics>,
}

impl Forwarder {
    pub fn new(config: Config, api: Arc<dyn ChatApi>) -> Self {
        let stats = Arc::new(Statistics::new());
        // Separate from the shutdown token so queued batches can drain first
        let delivery_cancel = CancellationToken::new();
        let delivery =
            DeliveryClient::new(api, &config.delivery, stats.clone(), delivery_cancel.clone());
        Self {
            config,
            stats,
            delivery,
            delivery_cancel,
        }
    }

    /// Telegram connection test; returns the bot username.
    pub async fn verify(&self) -> Result<String> {
        self.delivery
            .verify()
            .await
            .context("Telegram connection test failed")
    }

    /// Schedule the stats report and spawn the pipeline.
    pub async fn start(self) -> Result<ForwarderHandle> {
        let mut scheduler = Scheduler::new().await?;
        let reporter = self.stats.clone();
        scheduler
            .add_cron_job(&self.config.runtime.stats_cron, "stats-report", move || {
                let stats = reporter.clone();
                Box::pin(async move {
                    stats.snapshot().log();
                })
            })
            .await?;
        scheduler.start().await?;

        let shutdown = CancellationToken::new();
        let stats = self.stats.clone();
        let task = tokio::spawn(self.run(scheduler, shutdown.clone()));

        Ok(ForwarderHandle {
            shutdown,
            task,
            stats,
        })
    }

    async fn run(self, mut scheduler: Scheduler, shutdown: CancellationToken) -> StatsSnapshot {
        let Forwarder {
            config,
            stats,
            delivery,
            delivery_cancel,
        } = self;
        let capacity = config.runtime.queue_capacity;
        let (event_tx, event_rx) = mpsc::channel::<RawEvent>(capacity);
        let (batch_tx, batch_rx) = mpsc::channel::<DeliveryBatch>(capacity);

        let stream = StreamClient::new(config.stream.clone(), stats.clone(), shutdown.clone());
        let processor = MessageProcessor::new(
            config.processor.clone(),
            config.effective_batch_size(),
            stats.clone(),
        );

        info!(
            "Forwarding {} to Telegram chat {}",
            config.stream.url, config.telegram.chat_id
        );
        let stream_task = tokio::spawn(stream.run(event_tx));
        let processor_task = tokio::spawn(run_processor(processor, event_rx, batch_tx));
        let delivery_task = tokio::spawn(delivery.run(batch_rx));

        shutdown.cancelled().await;
        info!("Shutting down forwarder");

        let grace = config.runtime.shutdown_grace();
        let watchdog = tokio::spawn(async move {
            sleep(grace).await;
            warn!("Delivery did not drain within {:?}, abandoning queued messages", grace);
            delivery_cancel.cancel();
        });

        // The stream stops on the shutdown token; closing its queue lets the
        // processor flush and close the delivery queue in turn.
        for (name, task) in [
            ("stream", stream_task),
            ("processor", processor_task),
            ("delivery", delivery_task),
        ] {
            if let Err(e) = task.await {
                error!("{} task failed: {}", name, e);
            }
        }
        watchdog.abort();

        if let Err(e) = scheduler.shutdown().await {
            warn!("Failed to stop scheduler: {:#}", e);
        }

        let snapshot = stats.snapshot();
        info!("Final statistics");
        snapshot.log();
        snapshot
    }
}

impl ForwarderHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting events, flush and drain, and return the final statistics.
    pub async fn stop(self) -> Result<StatsSnapshot> {
        self.shutdown.cancel();
        self.task.await.context("Forwarder task failed")
    }
}

async fn run_processor(
    mut processor: MessageProcessor,
    mut events: mpsc::Receiver<RawEvent>,
    batches: mpsc::Sender<DeliveryBatch>,
) {
    loop {
        let deadline = processor.next_deadline();
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Some(batch) = processor.accept(&event) {
                        if !forward(&batches, batch).await {
                            return;
                        }
                    }
                }
                None => break,
            },
            _ = wait_for(deadline) => {
                if let Some(batch) = processor.flush_due() {
                    if !forward(&batches, batch).await {
                        return;
                    }
                }
            }
        }
    }

    if let Some(batch) = processor.drain() {
        info!("Flushing {} pending message(s) before shutdown", batch.len());
        forward(&batches, batch).await;
    }
    info!("Message processor stopped");
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

async fn forward(batches: &mpsc::Sender<DeliveryBatch>, batch: DeliveryBatch) -> bool {
    if batches.send(batch).await.is_err() {
        warn!("Delivery queue closed, dropping batch");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChatTarget;
    use crate::error::SendFailure;
    use async_trait::async_trait;
    use futures::SinkExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    #[derive(Default)]
    struct RecordingApi {
        sent: Mutex<Vec<String>>,
    }

    impl RecordingApi {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatApi for RecordingApi {
        async fn send_text(&self, text: &str) -> Result<(), SendFailure> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_photo(&self, url: &str, caption: &str) -> Result<(), SendFailure> {
            self.sent
                .lock()
                .unwrap()
                .push(format!("[photo {}] {}", url, caption));
            Ok(())
        }

        async fn verify(&self) -> Result<String, SendFailure> {
            Ok("feed_bot".to_string())
        }
    }

    fn test_config(addr: std::net::SocketAddr, batch_max_wait_ms: u64) -> Config {
        let mut config = Config::default();
        config.stream.url = format!("ws://{}", addr);
        config.telegram.bot_token = "123:abc".to_string();
        config.telegram.chat_id = ChatTarget::Id(-100123);
        config.processor.batch_max_wait_ms = batch_max_wait_ms;
        config.delivery.rate_limit_interval_ms = 10;
        config.runtime.shutdown_grace_secs = 2;
        config
    }

    /// Serve one connection that sends `frames` and then stays open.
    async fn serve(frames: Vec<&'static str>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            for frame in frames {
                ws.send(Message::Text(frame.to_string().into())).await.unwrap();
            }
            sleep(Duration::from_secs(30)).await;
        });
        addr
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !cond() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not met in time");
    }

    #[tokio::test]
    async fn test_post_is_forwarded_end_to_end() {
        let addr = serve(vec![
            r#"{"type":"ping"}"#,
            r#"{"type":"tweet.new","tweet":{"id":"7","type":"TWEET","author":{"handle":"alice"},"body":{"text":"hello https://x.co"}}}"#,
        ])
        .await;
        let api = Arc::new(RecordingApi::default());
        let forwarder = Forwarder::new(test_config(addr, 50), api.clone());
        assert_eq!(forwarder.verify().await.unwrap(), "feed_bot");

        let handle = forwarder.start().await.unwrap();
        wait_until(|| !api.sent().is_empty()).await;
        let snapshot = handle.stop().await.unwrap();

        let sent = api.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("<b>@alice</b>"));
        assert!(sent[0].contains("hello https://x.co"));
        assert!(sent[0].contains("• https://x.co"));
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.errors, 0);
        assert_eq!(snapshot.frames_received, 2);
    }

    #[tokio::test]
    async fn test_post_with_image_is_sent_as_photo() {
        let addr = serve(vec![
            r#"{"type":"tweet.new","tweet":{"id":"8","author":{"handle":"alice"},"body":{"text":"look"},"media":{"images":[{"url":"https://img.example/1.jpg"}]}}}"#,
        ])
        .await;
        let api = Arc::new(RecordingApi::default());
        let forwarder = Forwarder::new(test_config(addr, 50), api.clone());

        let handle = forwarder.start().await.unwrap();
        wait_until(|| !api.sent().is_empty()).await;
        let snapshot = handle.stop().await.unwrap();

        let sent = api.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("[photo https://img.example/1.jpg] "));
        assert!(sent[0].contains("look"));
        assert_eq!(snapshot.processed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_batch() {
        let addr = serve(vec!["first", "second", "first"]).await;
        let api = Arc::new(RecordingApi::default());
        let forwarder = Forwarder::new(test_config(addr, 60_000), api.clone());

        let handle = forwarder.start().await.unwrap();
        wait_until(|| handle.stats().frames_received == 3).await;
        sleep(Duration::from_millis(100)).await;
        assert!(api.sent().is_empty());

        let snapshot = handle.stop().await.unwrap();
        let sent = api.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].ends_with("first"));
        assert!(sent[1].ends_with("second"));
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.processed, 2);
    }
}
