use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::sink::Sink;
use crate::storage::MessageStore;
use crate::types::Message;

/// Drives the delivery pipeline: claims due messages from the store,
/// dispatches each one to a sink, and advances the lifecycle state.
///
/// The batch is processed sequentially. That bounds the pressure a retry
/// storm can put on the broker or the remote endpoint, and keeps failure
/// handling observable one message at a time.
pub struct RetryScheduler {
    store: Arc<dyn MessageStore>,
    kafka: Option<Arc<dyn Sink>>,
    http: Option<Arc<dyn Sink>>,
    worker: WorkerConfig,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        kafka: Option<Arc<dyn Sink>>,
        http: Option<Arc<dyn Sink>>,
        worker: WorkerConfig,
    ) -> Self {
        Self {
            store,
            kafka,
            http,
            worker,
        }
    }

    /// Tick loop. Runs one pass immediately on startup, then on every
    /// retry interval. Cancellation is observed between batches, never
    /// inside one.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.worker.retry_interval.as_secs(),
            batch_size = self.worker.batch_size,
            max_retries = self.worker.max_retries,
            "retry scheduler started"
        );

        let mut ticker = tokio::time::interval(self.worker.retry_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("retry scheduler stopped");
                    return;
                }
                _ = ticker.tick() => self.process_due().await,
            }
        }
    }

    /// Claim and process one batch. Public so tests and controlled
    /// single-pass callers can drive the pipeline without the ticker.
    pub async fn process_due(&self) {
        let batch = match self.store.claim_due(self.worker.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(error = %err, "failed to claim due messages");
                return;
            }
        };

        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "processing due messages");

        for msg in &batch {
            if let Err(err) = self.process_message(msg).await {
                error!(message_id = %msg.id, error = %err, "failed to process message");
            }
        }
    }

    async fn process_message(&self, msg: &Message) -> Result<()> {
        let max_retries = self.worker.max_retries;
        if max_retries > 0 && msg.retries >= max_retries {
            warn!(
                message_id = %msg.id,
                retries = msg.retries,
                max_retries,
                "message exceeded max retries, marking failed"
            );
            return self.store.mark_failed(&msg.id, "Exceeded max retries").await;
        }

        if max_retries == 0 {
            debug!(message_id = %msg.id, attempt = msg.retries + 1, "attempting delivery (unbounded retries)");
        } else {
            debug!(message_id = %msg.id, attempt = msg.retries + 1, max_retries, "attempting delivery");
        }

        // Routing is a configuration decision re-evaluated on every
        // attempt: the remote endpoint wins whenever one is configured.
        let Some(sink) = self.http.as_ref().or(self.kafka.as_ref()) else {
            warn!(message_id = %msg.id, "no delivery sink configured");
            return self
                .store
                .mark_retrying(&msg.id, "no delivery sink configured")
                .await;
        };

        match sink.send(msg).await {
            Ok(()) => {
                info!(message_id = %msg.id, sink = sink.kind(), "message delivered, removing from store");
                self.store.delete(&msg.id).await
            }
            Err(err) => {
                warn!(
                    message_id = %msg.id,
                    sink = sink.kind(),
                    error = %err,
                    "delivery failed, scheduling retry"
                );
                self.store.mark_retrying(&msg.id, &err.to_string()).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use tokio::sync::Mutex;

    use super::*;
    use crate::error::BridgeError;
    use crate::storage::SqliteStore;
    use crate::types::MessageStatus;

    /// Scripted sink: pops one result per send, succeeds once the script
    /// runs dry, and records everything it was asked to deliver.
    struct MockSink {
        label: &'static str,
        script: Mutex<VecDeque<Result<()>>>,
        sent: Mutex<Vec<Message>>,
    }

    impl MockSink {
        fn new(label: &'static str, script: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                label,
                script: Mutex::new(script.into()),
                sent: Mutex::new(Vec::new()),
            })
        }

        async fn sent_ids(&self) -> Vec<String> {
            self.sent.lock().await.iter().map(|m| m.id.clone()).collect()
        }
    }

    #[async_trait]
    impl Sink for MockSink {
        fn kind(&self) -> &'static str {
            self.label
        }

        async fn send(&self, msg: &Message) -> Result<()> {
            self.sent.lock().await.push(msg.clone());
            self.script.lock().await.pop_front().unwrap_or(Ok(()))
        }

        async fn send_with_retry(&self, msg: &Message) -> Result<()> {
            self.send(msg).await
        }

        async fn health_probe(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn worker(max_retries: u32) -> WorkerConfig {
        WorkerConfig {
            max_retries,
            ..Default::default()
        }
    }

    fn message(id: &str) -> Message {
        Message::new(id, "/hook/a", "q1", b"{}".to_vec(), HashMap::new())
    }

    async fn store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::open_in_memory().await.unwrap())
    }

    fn scheduler(
        store: Arc<SqliteStore>,
        kafka: Option<Arc<MockSink>>,
        http: Option<Arc<MockSink>>,
        worker: WorkerConfig,
    ) -> RetryScheduler {
        RetryScheduler::new(
            store,
            kafka.map(|s| s as Arc<dyn Sink>),
            http.map(|s| s as Arc<dyn Sink>),
            worker,
        )
    }

    #[tokio::test]
    async fn successful_send_deletes_the_row() {
        let store = store().await;
        store.save(&message("a1")).await.unwrap();
        let sink = MockSink::new("kafka", vec![]);
        let scheduler = scheduler(store.clone(), Some(sink.clone()), None, worker(0));

        scheduler.process_due().await;

        assert_eq!(sink.sent_ids().await, ["a1"]);
        assert!(store.stats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_send_marks_retrying_with_error() {
        let store = store().await;
        store.save(&message("a1")).await.unwrap();
        let sink = MockSink::new(
            "kafka",
            vec![Err(BridgeError::Broker("broker unavailable".into()))],
        );
        let scheduler = scheduler(store.clone(), Some(sink.clone()), None, worker(3));

        scheduler.process_due().await;

        let row = store.get("a1").await.unwrap();
        assert_eq!(row.status, MessageStatus::Retrying);
        assert_eq!(row.retries, 1);
        assert!(row.error.contains("broker unavailable"));
        let next = row.next_retry_at.unwrap();
        assert_eq!((next - row.updated_at).num_seconds(), 120);
    }

    #[tokio::test]
    async fn retry_ceiling_marks_failed_without_sending() {
        let store = store().await;
        store.save(&message("a1")).await.unwrap();
        let sink = MockSink::new(
            "http",
            vec![
                Err(BridgeError::Http("503 Service Unavailable".into())),
                Err(BridgeError::Http("503 Service Unavailable".into())),
            ],
        );
        let scheduler = scheduler(store.clone(), None, Some(sink.clone()), worker(2));

        // Attempts 1 and 2 reach the sink and fail.
        scheduler.process_due().await;
        store.force_due("a1").await;
        scheduler.process_due().await;
        let row = store.get("a1").await.unwrap();
        assert_eq!(row.status, MessageStatus::Retrying);
        assert_eq!(row.retries, 2);

        // Attempt 3 hits the ceiling before any send.
        store.force_due("a1").await;
        scheduler.process_due().await;
        let row = store.get("a1").await.unwrap();
        assert_eq!(row.status, MessageStatus::Failed);
        assert_eq!(row.error, "Exceeded max retries");
        assert!(row.next_retry_at.is_none());
        assert_eq!(sink.sent_ids().await.len(), 2);

        // Terminal: a further pass never touches it again.
        scheduler.process_due().await;
        assert_eq!(sink.sent_ids().await.len(), 2);
        assert_eq!(store.get("a1").await.unwrap().status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn zero_max_retries_means_unbounded() {
        let store = store().await;
        let mut msg = message("a1");
        msg.status = MessageStatus::Retrying;
        msg.retries = 100;
        msg.next_retry_at = Some(Utc::now() - ChronoDuration::seconds(1));
        store.save(&msg).await.unwrap();
        let sink = MockSink::new("kafka", vec![Err(BridgeError::Broker("down".into()))]);
        let scheduler = scheduler(store.clone(), Some(sink.clone()), None, worker(0));

        scheduler.process_due().await;

        let row = store.get("a1").await.unwrap();
        assert_eq!(row.status, MessageStatus::Retrying);
        assert_eq!(row.retries, 101);
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let store = store().await;
        let sink = MockSink::new("kafka", vec![]);
        let scheduler = scheduler(store.clone(), Some(sink.clone()), None, worker(0));

        scheduler.process_due().await;

        assert!(sink.sent_ids().await.is_empty());
    }

    #[tokio::test]
    async fn http_sink_is_preferred_when_configured() {
        let store = store().await;
        store.save(&message("a1")).await.unwrap();
        let kafka = MockSink::new("kafka", vec![]);
        let http = MockSink::new("http", vec![]);
        let scheduler = scheduler(
            store.clone(),
            Some(kafka.clone()),
            Some(http.clone()),
            worker(0),
        );

        scheduler.process_due().await;

        assert_eq!(http.sent_ids().await, ["a1"]);
        assert!(kafka.sent_ids().await.is_empty());
    }

    #[tokio::test]
    async fn missing_sinks_schedule_a_retry() {
        let store = store().await;
        store.save(&message("a1")).await.unwrap();
        let scheduler = scheduler(store.clone(), None, None, worker(0));

        scheduler.process_due().await;

        let row = store.get("a1").await.unwrap();
        assert_eq!(row.status, MessageStatus::Retrying);
        assert_eq!(row.error, "no delivery sink configured");
    }

    #[tokio::test]
    async fn batch_is_processed_oldest_first() {
        let store = store().await;
        let base = Utc::now() - ChronoDuration::minutes(10);
        for (i, id) in ["m0", "m1", "m2"].iter().enumerate() {
            let mut msg = message(id);
            msg.created_at = base + ChronoDuration::minutes(i as i64);
            store.save(&msg).await.unwrap();
        }
        let sink = MockSink::new("kafka", vec![]);
        let scheduler = scheduler(store.clone(), Some(sink.clone()), None, worker(0));

        scheduler.process_due().await;

        assert_eq!(sink.sent_ids().await, ["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn recovered_sink_drains_the_backlog() {
        let store = store().await;
        store.save(&message("a1")).await.unwrap();
        let sink = MockSink::new("kafka", vec![Err(BridgeError::Broker("down".into()))]);
        let scheduler = scheduler(store.clone(), Some(sink.clone()), None, worker(0));

        scheduler.process_due().await;
        assert_eq!(store.get("a1").await.unwrap().status, MessageStatus::Retrying);

        // Broker back up, backoff elapsed: next pass delivers and deletes.
        store.force_due("a1").await;
        scheduler.process_due().await;
        assert!(store.get("a1").await.is_none());
        assert_eq!(sink.sent_ids().await.len(), 2);
    }
}
