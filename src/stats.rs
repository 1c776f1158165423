//! Pod statistics and the fleet stats surface.
//!
//! Counters are written only by the owning pod task and read by anyone through
//! lock-free snapshots.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::supervisor::FleetSupervisor;

/// Pod lifecycle as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Running; last discovery succeeded or none attempted yet.
    Active,
    /// Running, but the endpoint's last discovery failed.
    Disabled,
    /// Cancelled by the supervisor.
    Stopped,
}

impl Lifecycle {
    fn as_u8(self) -> u8 {
        match self {
            Lifecycle::Active => 0,
            Lifecycle::Disabled => 1,
            Lifecycle::Stopped => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Active,
            1 => Lifecycle::Disabled,
            _ => Lifecycle::Stopped,
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lifecycle::Active => write!(f, "active"),
            Lifecycle::Disabled => write!(f, "disabled"),
            Lifecycle::Stopped => write!(f, "stopped"),
        }
    }
}

/// Live counters of one pod.
#[derive(Debug, Default)]
pub struct PodStats {
    lifecycle: AtomicU8,
    total_sent_bytes: AtomicU64,
    total_unacked_bytes: AtomicU64,
    delivered_records: AtomicU64,
    integrity_errors: AtomicU64,
    last_delivery_failed: AtomicBool,
}

impl PodStats {
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Set the lifecycle, returning the previous one.
    pub fn set_lifecycle(&self, lifecycle: Lifecycle) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.swap(lifecycle.as_u8(), Ordering::AcqRel))
    }

    pub fn record_sent(&self, bytes: u64) {
        self.total_sent_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.delivered_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unacked(&self, bytes: u64) {
        self.total_unacked_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn ack(&self, bytes: u64) {
        let _ = self
            .total_unacked_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
    }

    pub fn record_integrity_error(&self) {
        self.integrity_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of the latest sink call, returning the previous flag.
    pub fn set_delivery_failed(&self, failed: bool) -> bool {
        self.last_delivery_failed.swap(failed, Ordering::AcqRel)
    }

    pub fn last_delivery_failed(&self) -> bool {
        self.last_delivery_failed.load(Ordering::Acquire)
    }

    pub fn total_sent_bytes(&self) -> u64 {
        self.total_sent_bytes.load(Ordering::Relaxed)
    }

    pub fn total_unacked_bytes(&self) -> u64 {
        self.total_unacked_bytes.load(Ordering::Relaxed)
    }

    pub fn integrity_errors(&self) -> u64 {
        self.integrity_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PodStatsSnapshot {
        PodStatsSnapshot {
            total_sent_bytes: self.total_sent_bytes(),
            total_unacked_bytes: self.total_unacked_bytes(),
            delivered_records: self.delivered_records.load(Ordering::Relaxed),
            integrity_errors: self.integrity_errors(),
            last_delivery_failed: self.last_delivery_failed(),
        }
    }
}

/// Point-in-time copy of [`PodStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatsSnapshot {
    pub total_sent_bytes: u64,
    pub total_unacked_bytes: u64,
    pub delivered_records: u64,
    pub integrity_errors: u64,
    pub last_delivery_failed: bool,
}

/// One pod in the stats surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodReport {
    pub state: Lifecycle,
    pub target_url: String,
    pub stats: PodStatsSnapshot,
}

/// Stats surface read by external aggregators.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStats {
    pub pods: Vec<PodReport>,
    pub sink_connected: bool,
    pub generated_at: DateTime<Utc>,
}

impl FleetStats {
    pub fn new(mut pods: Vec<PodReport>) -> Self {
        pods.sort_by(|a, b| a.target_url.cmp(&b.target_url));
        // The sink counts as reachable while at least one pod's last call went through
        let sink_connected =
            pods.is_empty() || pods.iter().any(|p| !p.stats.last_delivery_failed);
        Self {
            pods,
            sink_connected,
            generated_at: Utc::now(),
        }
    }

    pub fn active_pods(&self) -> usize {
        self.pods
            .iter()
            .filter(|p| p.state == Lifecycle::Active)
            .count()
    }

    pub fn total_sent_bytes(&self) -> u64 {
        self.pods.iter().map(|p| p.stats.total_sent_bytes).sum()
    }

    pub fn total_unacked_bytes(&self) -> u64 {
        self.pods.iter().map(|p| p.stats.total_unacked_bytes).sum()
    }
}

/// Log a fleet summary every `interval` until cancelled.
pub async fn run_reporter(
    supervisor: FleetSupervisor,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = supervisor.stats().await;
                info!(
                    pods_active = stats.active_pods(),
                    pods_total = stats.pods.len(),
                    sink = if stats.sink_connected { "OK" } else { "NOT OK" },
                    sent_bytes = stats.total_sent_bytes(),
                    pending_bytes = stats.total_unacked_bytes(),
                    "Fleet stats"
                );
            }
        }
    }
}
