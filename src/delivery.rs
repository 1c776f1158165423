//! At-least-once delivery of envelopes to the sink.
//!
//! A record's bytes are committed to the offset ledger only after the sink
//! accepted it. Failed records go to a FIFO retry queue with a stable packet
//! id and are retried, head first, once the fixed backoff has elapsed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::LogSink;
use crate::error::CollectorError;
use crate::offset_store::OffsetLedger;
use crate::stats::PodStats;

/// One framed record on its way to the sink.
#[derive(Debug, Clone)]
pub struct Record {
    pub batch_id: u64,
    /// Batch offset at which the record starts.
    pub position: u64,
    /// Serialized envelope.
    pub payload: Vec<u8>,
    /// Offset bytes the record accounts for.
    pub size: u64,
}

/// A record the sink has not acknowledged yet.
#[derive(Debug, Clone)]
pub struct RetryPacket {
    pub packet_id: Uuid,
    pub batch_id: u64,
    pub position: u64,
    pub payload: Vec<u8>,
    pub size: u64,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Unacknowledged records in original enqueue order.
#[derive(Debug, Default)]
pub struct RetryQueue {
    packets: VecDeque<RetryPacket>,
    next_attempt: Option<Instant>,
}

impl RetryQueue {
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RetryPacket> {
        self.packets.iter()
    }

    /// When the head of the queue is next attempted, if anything is queued.
    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.next_attempt, Some(at) if at <= now) && !self.packets.is_empty()
    }

    pub fn unacked_bytes(&self) -> u64 {
        self.packets.iter().map(|p| p.size).sum()
    }

    /// Packet id of the queued copy of a record, if any.
    pub fn find(&self, batch_id: u64, position: u64) -> Option<Uuid> {
        self.packets
            .iter()
            .find(|p| p.batch_id == batch_id && p.position == position)
            .map(|p| p.packet_id)
    }

    fn enqueue(&mut self, record: Record, retry_at: Instant) -> Uuid {
        let packet_id = Uuid::new_v4();
        self.packets.push_back(RetryPacket {
            packet_id,
            batch_id: record.batch_id,
            position: record.position,
            payload: record.payload,
            size: record.size,
            enqueued_at: Utc::now(),
            attempts: 1,
        });
        if self.next_attempt.is_none() {
            self.next_attempt = Some(retry_at);
        }
        packet_id
    }

    fn remove(&mut self, packet_id: Uuid) -> Option<RetryPacket> {
        let index = self.packets.iter().position(|p| p.packet_id == packet_id)?;
        let packet = self.packets.remove(index);
        if self.packets.is_empty() {
            self.next_attempt = None;
        }
        packet
    }
}

/// Result of a delivery attempt for a new record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted by the sink; the batch offset is now `offset`.
    Delivered { offset: u64 },
    /// Not accepted; parked in the retry queue.
    Queued { packet_id: Uuid },
}

/// Ships records for one pod and keeps the ledger and stats in step.
pub struct DeliveryClient {
    sink: Arc<dyn LogSink>,
    backoff: Duration,
    stats: Arc<PodStats>,
    target_url: String,
}

impl DeliveryClient {
    pub fn new(
        sink: Arc<dyn LogSink>,
        backoff: Duration,
        stats: Arc<PodStats>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            backoff,
            stats,
            target_url: target_url.into(),
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Send one record.
    ///
    /// On success the offset is advanced by `record.size` before returning. On
    /// failure the record is queued (once) and a retry is scheduled after the
    /// backoff; the offset stays where it was.
    pub async fn deliver(
        &self,
        record: Record,
        offsets: &mut OffsetLedger,
        retries: &mut RetryQueue,
    ) -> Result<DeliveryOutcome, CollectorError> {
        match self.sink.send(&record.payload).await {
            Ok(()) => {
                self.mark_sink(false);
                let offset = offsets.commit(record.batch_id, record.size).await?;
                if let Some(packet_id) = retries.find(record.batch_id, record.position) {
                    retries.remove(packet_id);
                    self.stats.ack(record.size);
                }
                self.stats.record_sent(record.size);
                Ok(DeliveryOutcome::Delivered { offset })
            }
            Err(e) => {
                self.mark_sink(true);
                let err = CollectorError::from(e);
                if let Some(packet_id) = retries.find(record.batch_id, record.position) {
                    return Ok(DeliveryOutcome::Queued { packet_id });
                }

                let size = record.size;
                let batch_id = record.batch_id;
                let packet_id = retries.enqueue(record, Instant::now() + self.backoff);
                self.stats.add_unacked(size);
                debug!(
                    target_url = %self.target_url,
                    batch_id = batch_id,
                    packet_id = %packet_id,
                    size = size,
                    error = %err,
                    "Record queued for retry"
                );
                Ok(DeliveryOutcome::Queued { packet_id })
            }
        }
    }

    /// Retry queued packets in FIFO order if the backoff has elapsed.
    ///
    /// Stops at the first failure and reschedules the queue. Returns how many
    /// packets were delivered.
    pub async fn retry_due(
        &self,
        offsets: &mut OffsetLedger,
        retries: &mut RetryQueue,
    ) -> Result<usize, CollectorError> {
        if !retries.is_due(Instant::now()) {
            return Ok(0);
        }

        let mut delivered = 0;
        while let Some(head) = retries.packets.front() {
            let packet_id = head.packet_id;
            let result = self.sink.send(&head.payload).await;

            match result {
                Ok(()) => {
                    self.mark_sink(false);
                    let Some(packet) = retries.remove(packet_id) else {
                        break;
                    };
                    self.stats.ack(packet.size);

                    let current = offsets.delivered(packet.batch_id).await?;
                    if current == packet.position {
                        offsets.commit(packet.batch_id, packet.size).await?;
                    } else {
                        debug!(
                            target_url = %self.target_url,
                            batch_id = packet.batch_id,
                            position = packet.position,
                            current = current,
                            "Offset already past retried packet"
                        );
                    }
                    self.stats.record_sent(packet.size);
                    delivered += 1;

                    debug!(
                        target_url = %self.target_url,
                        packet_id = %packet.packet_id,
                        attempts = packet.attempts + 1,
                        queued_for_ms = (Utc::now() - packet.enqueued_at).num_milliseconds(),
                        "Retried packet delivered"
                    );
                }
                Err(e) => {
                    self.mark_sink(true);
                    let err = CollectorError::from(e);
                    if let Some(head) = retries.packets.front_mut() {
                        head.attempts += 1;
                    }
                    retries.next_attempt = Some(Instant::now() + self.backoff);
                    debug!(
                        target_url = %self.target_url,
                        packet_id = %packet_id,
                        pending = retries.len(),
                        error = %err,
                        "Retry failed, backing off"
                    );
                    return Ok(delivered);
                }
            }
        }

        retries.next_attempt = None;
        Ok(delivered)
    }

    fn mark_sink(&self, failed: bool) {
        let was_failed = self.stats.set_delivery_failed(failed);
        if was_failed == failed {
            return;
        }
        if failed {
            warn!(target_url = %self.target_url, "Sink refused delivery, queueing records for retry");
        } else {
            info!(target_url = %self.target_url, "Sink accepting deliveries again");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::SinkError;
    use crate::endpoint::Endpoint;
    use crate::offset_store::OffsetStore;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory sink that can be switched between accepting and refusing.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub refuse: AtomicBool,
        pub accepted: Mutex<Vec<serde_json::Value>>,
        pub attempts: std::sync::atomic::AtomicUsize,
    }

    impl RecordingSink {
        pub fn refusing() -> Self {
            let sink = Self::default();
            sink.refuse.store(true, Ordering::SeqCst);
            sink
        }

        pub fn set_refuse(&self, refuse: bool) {
            self.refuse.store(refuse, Ordering::SeqCst);
        }

        pub fn accepted(&self) -> Vec<serde_json::Value> {
            self.accepted.lock().unwrap().clone()
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn send(&self, body: &[u8]) -> Result<(), SinkError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse.load(Ordering::SeqCst) {
                return Err(SinkError::Status {
                    code: StatusCode::SERVICE_UNAVAILABLE,
                    message: "refusing".to_string(),
                });
            }
            let value = serde_json::from_slice(body).unwrap_or(serde_json::Value::Null);
            self.accepted.lock().unwrap().push(value);
            Ok(())
        }
    }

    fn record(batch_id: u64, position: u64, text: &str) -> Record {
        let payload = serde_json::to_vec(&serde_json::json!({ "textMessage": text })).unwrap();
        Record {
            batch_id,
            position,
            payload,
            size: text.len() as u64 + 1,
        }
    }

    fn setup(
        sink: Arc<RecordingSink>,
        backoff: Duration,
    ) -> (TempDir, OffsetLedger, DeliveryClient, Arc<PodStats>) {
        let dir = TempDir::new().unwrap();
        let endpoint = Endpoint::new("http://10.0.0.9:8666/logs/svc", "svc");
        let ledger = OffsetLedger::new(OffsetStore::new(dir.path()), endpoint.clone());
        let stats = Arc::new(PodStats::default());
        let client = DeliveryClient::new(sink, backoff, stats.clone(), endpoint.target_url);
        (dir, ledger, client, stats)
    }

    #[tokio::test]
    async fn test_successful_delivery_commits_offset() {
        let sink = Arc::new(RecordingSink::default());
        let (_dir, mut ledger, client, stats) = setup(sink.clone(), Duration::from_secs(5));
        let mut retries = RetryQueue::default();

        let outcome = client
            .deliver(record(1, 0, "hello"), &mut ledger, &mut retries)
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered { offset: 6 });
        assert_eq!(ledger.delivered(1).await.unwrap(), 6);
        assert_eq!(stats.total_sent_bytes(), 6);
        assert_eq!(sink.accepted().len(), 1);
        assert!(retries.is_empty());
    }

    #[tokio::test]
    async fn test_failed_delivery_is_queued_once() {
        let sink = Arc::new(RecordingSink::refusing());
        let (_dir, mut ledger, client, stats) = setup(sink.clone(), Duration::from_secs(5));
        let mut retries = RetryQueue::default();

        let first = client
            .deliver(record(1, 0, "hello"), &mut ledger, &mut retries)
            .await
            .unwrap();
        let second = client
            .deliver(record(1, 0, "hello"), &mut ledger, &mut retries)
            .await
            .unwrap();

        let (DeliveryOutcome::Queued { packet_id: a }, DeliveryOutcome::Queued { packet_id: b }) =
            (first, second)
        else {
            panic!("expected both attempts to queue");
        };
        assert_eq!(a, b);
        assert_eq!(retries.len(), 1);
        assert_eq!(stats.total_unacked_bytes(), 6);
        assert_eq!(ledger.delivered(1).await.unwrap(), 0);
        assert!(stats.last_delivery_failed());
    }

    #[tokio::test]
    async fn test_retry_waits_for_backoff() {
        let sink = Arc::new(RecordingSink::refusing());
        let (_dir, mut ledger, client, _stats) = setup(sink.clone(), Duration::from_secs(60));
        let mut retries = RetryQueue::default();

        client
            .deliver(record(1, 0, "hello"), &mut ledger, &mut retries)
            .await
            .unwrap();
        sink.set_refuse(false);

        assert_eq!(client.retry_due(&mut ledger, &mut retries).await.unwrap(), 0);
        assert_eq!(sink.attempts(), 1);
        assert_eq!(retries.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_backoff_acks_and_commits() {
        let sink = Arc::new(RecordingSink::refusing());
        let (_dir, mut ledger, client, stats) = setup(sink.clone(), Duration::from_millis(20));
        let mut retries = RetryQueue::default();

        client
            .deliver(record(1, 0, "hello"), &mut ledger, &mut retries)
            .await
            .unwrap();
        assert_eq!(stats.total_unacked_bytes(), 6);

        sink.set_refuse(false);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(client.retry_due(&mut ledger, &mut retries).await.unwrap(), 1);
        assert_eq!(stats.total_unacked_bytes(), 0);
        assert_eq!(ledger.delivered(1).await.unwrap(), 6);
        assert!(retries.is_empty());
        assert!(retries.next_attempt().is_none());
        assert!(!stats.last_delivery_failed());
    }

    #[tokio::test]
    async fn test_retries_preserve_fifo_order() {
        let sink = Arc::new(RecordingSink::refusing());
        let (_dir, mut ledger, client, _stats) = setup(sink.clone(), Duration::from_millis(10));
        let mut retries = RetryQueue::default();

        client
            .deliver(record(1, 0, "first"), &mut ledger, &mut retries)
            .await
            .unwrap();
        client
            .deliver(record(2, 0, "second"), &mut ledger, &mut retries)
            .await
            .unwrap();

        sink.set_refuse(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(client.retry_due(&mut ledger, &mut retries).await.unwrap(), 2);

        let accepted = sink.accepted();
        assert_eq!(accepted[0]["textMessage"], "first");
        assert_eq!(accepted[1]["textMessage"], "second");
    }

    #[tokio::test]
    async fn test_failed_retry_reschedules_and_keeps_packet() {
        let sink = Arc::new(RecordingSink::refusing());
        let (_dir, mut ledger, client, stats) = setup(sink.clone(), Duration::from_millis(10));
        let mut retries = RetryQueue::default();

        client
            .deliver(record(1, 0, "hello"), &mut ledger, &mut retries)
            .await
            .unwrap();
        let first_deadline = retries.next_attempt().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.retry_due(&mut ledger, &mut retries).await.unwrap(), 0);

        assert_eq!(retries.len(), 1);
        assert!(retries.next_attempt().unwrap() > first_deadline);
        assert_eq!(retries.iter().next().unwrap().attempts, 2);
        assert_eq!(stats.total_unacked_bytes(), 6);
    }
}
