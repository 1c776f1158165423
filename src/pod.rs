//! Per-endpoint collection worker.
//!
//! A pod polls its endpoint for the batch list, walks the batches in id order
//! and streams whatever has not been delivered yet. Ticks are self-scheduling:
//! the next one is armed only after the current one settled, and the retry
//! queue is serviced from the same task while it waits.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::LogSink;
use crate::config::PodConfig;
use crate::delivery::{DeliveryClient, RetryQueue};
use crate::endpoint::{parse_discovery, BatchDescriptor, Endpoint};
use crate::error::CollectorError;
use crate::offset_store::{OffsetLedger, OffsetStore};
use crate::stats::{Lifecycle, PodReport, PodStats};
use crate::streamer::{BatchStreamer, StreamEnd};

/// Mutable state owned by one pod.
#[derive(Debug)]
pub struct PodState {
    pub offsets: OffsetLedger,
    /// Partial line carried between chunks of the batch being streamed.
    pub remainder: Vec<u8>,
    pub retries: RetryQueue,
}

/// What one discovery tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Batches reported by the endpoint.
    pub batches_seen: usize,
    /// Batches fully delivered when the tick settled.
    pub batches_complete: usize,
    /// Batches skipped because more bytes were delivered than they hold.
    pub integrity_skipped: Vec<u64>,
    /// Batch at which the tick stopped without completing it.
    pub stopped_at: Option<u64>,
    /// Streaming was held back because the sink has unacknowledged records.
    pub deferred: bool,
}

/// Collection worker for one endpoint. Owns its offsets, retry queue and
/// partial-line buffer; shares only its [`PodStats`].
pub struct Pod {
    endpoint: Endpoint,
    config: PodConfig,
    http: Client,
    streamer: BatchStreamer,
    delivery: DeliveryClient,
    state: PodState,
    stats: Arc<PodStats>,
    cancel: CancellationToken,
    attached: bool,
    integrity_flagged: HashSet<u64>,
}

impl Pod {
    pub fn new(
        endpoint: Endpoint,
        config: PodConfig,
        store: OffsetStore,
        sink: Arc<dyn LogSink>,
        http: Client,
    ) -> Self {
        let stats = Arc::new(PodStats::default());
        let delivery = DeliveryClient::new(
            sink,
            config.retry_backoff,
            stats.clone(),
            endpoint.target_url.clone(),
        );
        let streamer = BatchStreamer::new(http.clone(), config.start_offset_supported);
        let state = PodState {
            offsets: OffsetLedger::new(store, endpoint.clone()),
            remainder: Vec::new(),
            retries: RetryQueue::default(),
        };

        Self {
            endpoint,
            config,
            http,
            streamer,
            delivery,
            state,
            stats,
            cancel: CancellationToken::new(),
            attached: false,
            integrity_flagged: HashSet::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> Arc<PodStats> {
        self.stats.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.state.offsets.work_dir()
    }

    pub fn pending_retries(&self) -> usize {
        self.state.retries.len()
    }

    /// Bytes of `batch_id` delivered so far, as this pod sees them.
    pub async fn delivered(&mut self, batch_id: u64) -> Result<u64, CollectorError> {
        self.state.offsets.delivered(batch_id).await
    }

    /// Run the pod on its own task.
    pub fn spawn(self) -> PodHandle {
        let endpoint = self.endpoint.clone();
        let stats = self.stats.clone();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());
        PodHandle {
            endpoint,
            stats,
            cancel,
            task,
        }
    }

    /// Jittered start, then tick / wait / tick until cancelled.
    pub async fn run(mut self) {
        let cancel = self.cancel.clone();
        let delay = start_delay(self.config.start_jitter);
        debug!(
            target_url = %self.endpoint.target_url,
            delay_ms = delay.as_millis() as u64,
            "Pod scheduled"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                self.finish();
                return;
            }
            _ = sleep(delay) => {}
        }

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.tick() => outcome,
            };

            match outcome {
                Ok(report) => debug!(
                    target_url = %self.endpoint.target_url,
                    batches = report.batches_seen,
                    complete = report.batches_complete,
                    stopped_at = ?report.stopped_at,
                    deferred = report.deferred,
                    "Tick settled"
                ),
                Err(e @ CollectorError::Poll { .. }) => debug!(error = %e, "Tick skipped"),
                Err(e) => warn!(target_url = %self.endpoint.target_url, error = %e, "Tick aborted"),
            }

            let next_tick = Instant::now() + self.config.poll_interval;
            if !self.idle_until(next_tick, &cancel).await {
                break;
            }
        }

        self.finish();
    }

    /// Wait for the next tick, servicing retries as they fall due.
    /// Returns `false` when cancelled.
    async fn idle_until(&mut self, next_tick: Instant, cancel: &CancellationToken) -> bool {
        loop {
            let retry_at = self.state.retries.next_attempt();
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = sleep_until(next_tick) => return true,
                _ = sleep_until(retry_at.unwrap_or(next_tick)), if retry_at.is_some() => {
                    if let Err(e) = self.retry_pending().await {
                        warn!(target_url = %self.endpoint.target_url, error = %e, "Retry pass failed");
                    }
                }
            }
        }
    }

    /// Attempt queued packets whose backoff has elapsed.
    pub async fn retry_pending(&mut self) -> Result<usize, CollectorError> {
        self.delivery
            .retry_due(&mut self.state.offsets, &mut self.state.retries)
            .await
    }

    /// One discovery cycle.
    ///
    /// Poll failures are returned as `CollectorError::Poll`; the caller treats
    /// them as "try again next tick".
    pub async fn tick(&mut self) -> Result<TickReport, CollectorError> {
        let mut report = TickReport::default();

        self.retry_pending().await?;
        if !self.state.retries.is_empty() {
            debug!(
                target_url = %self.endpoint.target_url,
                pending = self.state.retries.len(),
                "Sink backlog pending, holding batch streaming"
            );
            report.deferred = true;
            return Ok(report);
        }

        let batches = match self.discover().await {
            Ok(batches) => {
                self.mark_reachable(true);
                batches
            }
            Err(e) => {
                self.mark_reachable(false);
                return Err(e);
            }
        };

        if !self.attached {
            let first_contact = self.state.offsets.attach().await?;
            self.attached = true;
            if first_contact && self.config.skip_history {
                for batch in &batches {
                    self.state
                        .offsets
                        .mark_delivered(batch.id, batch.batch_size)
                        .await?;
                }
                info!(
                    target_url = %self.endpoint.target_url,
                    batches = batches.len(),
                    "First contact with endpoint, existing backlog marked as delivered"
                );
            }
        }

        report.batches_seen = batches.len();
        let newest = batches.last().map(|b| b.id);

        for batch in &batches {
            if self.cancel.is_cancelled() {
                break;
            }

            let delivered = self.state.offsets.delivered(batch.id).await?;
            if delivered > batch.batch_size {
                self.flag_integrity(batch, delivered);
                report.integrity_skipped.push(batch.id);
                continue;
            }
            if delivered == batch.batch_size {
                report.batches_complete += 1;
                continue;
            }

            let sealed = newest.is_some_and(|id| id != batch.id);
            let end = self
                .streamer
                .stream(
                    &self.endpoint,
                    *batch,
                    sealed,
                    &mut self.state,
                    &self.delivery,
                    &self.cancel,
                )
                .await?;

            match end {
                StreamEnd::Complete => report.batches_complete += 1,
                StreamEnd::Incomplete => {
                    debug!(
                        target_url = %self.endpoint.target_url,
                        batch_id = batch.id,
                        "Batch not fully delivered yet, holding position"
                    );
                    report.stopped_at = Some(batch.id);
                    break;
                }
                StreamEnd::SinkUnavailable => {
                    report.stopped_at = Some(batch.id);
                    report.deferred = true;
                    break;
                }
                StreamEnd::Cancelled => break,
            }
        }

        Ok(report)
    }

    async fn discover(&self) -> Result<Vec<BatchDescriptor>, CollectorError> {
        let url = self.endpoint.discovery_url();
        let response = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| CollectorError::poll(url, e))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| CollectorError::poll(url, e))?;

        match parse_discovery(&body) {
            Ok(batches) if status.is_success() => Ok(batches),
            Ok(_) => Err(CollectorError::poll(url, format!("HTTP {}", status))),
            Err(reason) if status.is_success() => Err(CollectorError::poll(url, reason)),
            Err(reason) => Err(CollectorError::poll(
                url,
                format!("HTTP {}: {}", status, reason),
            )),
        }
    }

    fn mark_reachable(&self, reachable: bool) {
        let next = if reachable {
            Lifecycle::Active
        } else {
            Lifecycle::Disabled
        };
        let previous = self.stats.set_lifecycle(next);
        if previous == next {
            return;
        }
        if reachable {
            info!(target_url = %self.endpoint.target_url, "Endpoint reachable");
        } else {
            warn!(
                target_url = %self.endpoint.target_url,
                "Endpoint discovery failing, retrying every tick"
            );
        }
    }

    fn flag_integrity(&mut self, batch: &BatchDescriptor, delivered: u64) {
        let err = CollectorError::Integrity {
            target_url: self.endpoint.target_url.clone(),
            batch_id: batch.id,
            delivered,
            batch_size: batch.batch_size,
        };
        if self.integrity_flagged.insert(batch.id) {
            self.stats.record_integrity_error();
            error!(error = %err, "Skipping batch permanently");
        } else {
            debug!(error = %err, "Skipping batch");
        }
    }

    fn finish(&self) {
        self.stats.set_lifecycle(Lifecycle::Stopped);
        info!(
            target_url = %self.endpoint.target_url,
            pending_retries = self.state.retries.len(),
            unacked_bytes = self.state.retries.unacked_bytes(),
            "Pod stopped"
        );
    }
}

fn start_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Supervisor-side handle of a running pod.
pub struct PodHandle {
    endpoint: Endpoint,
    stats: Arc<PodStats>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PodHandle {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn stats(&self) -> Arc<PodStats> {
        self.stats.clone()
    }

    pub fn report(&self) -> PodReport {
        PodReport {
            state: self.stats.lifecycle(),
            target_url: self.endpoint.target_url.clone(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the pod without waiting for it.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Cancel the pod and wait up to `timeout` for its task to end.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target_url = %self.endpoint.target_url, error = %e, "Pod task panicked"),
            Err(_) => warn!(target_url = %self.endpoint.target_url, "Pod did not stop in time"),
        }
    }
}
