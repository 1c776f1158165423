//! Fleet supervisor: keeps one running pod per desired endpoint.
//!
//! Reconciliation fetches the desired set from the directory, diffs it
//! against the running pods by target URL, starts the new ones and stops the
//! removed ones. Pods present on both sides are left alone, so their offsets
//! and retry queues survive a re-sync.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::LogSink;
use crate::config::Config;
use crate::directory::EndpointDirectory;
use crate::endpoint::Endpoint;
use crate::error::CollectorError;
use crate::offset_store::OffsetStore;
use crate::pod::{Pod, PodHandle};
use crate::stats::FleetStats;
use crate::streamer::source_http_client;

/// How long a stopped pod gets to finish its current await.
const POD_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetState {
    /// No reconciliation has succeeded yet.
    Uninitialized,
    /// Running pods match the last successfully fetched directory.
    Converged,
}

/// Pods to start and stop to reach a desired set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_start: Vec<Endpoint>,
    pub to_stop: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }
}

/// Diff running target URLs against the desired endpoints.
///
/// Duplicate target URLs in `desired` collapse to their first occurrence.
/// `to_stop` is sorted for stable logging.
pub fn plan_reconciliation<'a>(
    running: impl IntoIterator<Item = &'a String>,
    desired: Vec<Endpoint>,
) -> ReconcilePlan {
    let running: HashSet<&String> = running.into_iter().collect();

    let mut wanted = HashSet::new();
    let mut to_start = Vec::new();
    for endpoint in desired {
        if !wanted.insert(endpoint.target_url.clone()) {
            debug!(target_url = %endpoint.target_url, "Duplicate endpoint in directory, ignoring");
            continue;
        }
        if !running.contains(&endpoint.target_url) {
            to_start.push(endpoint);
        }
    }

    let mut to_stop: Vec<String> = running
        .into_iter()
        .filter(|url| !wanted.contains(*url))
        .cloned()
        .collect();
    to_stop.sort();

    ReconcilePlan { to_start, to_stop }
}

/// Outcome of one reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub running: usize,
}

/// Owns the pods of the process. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct FleetSupervisor {
    config: Arc<Config>,
    directory: Arc<dyn EndpointDirectory>,
    sink: Arc<dyn LogSink>,
    http: Client,
    store: OffsetStore,
    pods: Arc<RwLock<HashMap<String, PodHandle>>>,
    state: Arc<RwLock<FleetState>>,
    cancel: CancellationToken,
    schedule: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FleetSupervisor {
    pub fn new(
        config: Config,
        directory: Arc<dyn EndpointDirectory>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, CollectorError> {
        let http = source_http_client(config.request_timeout)?;
        let store = OffsetStore::new(config.workspace_path.clone());
        Ok(Self {
            config: Arc::new(config),
            directory,
            sink,
            http,
            store,
            pods: Arc::new(RwLock::new(HashMap::new())),
            state: Arc::new(RwLock::new(FleetState::Uninitialized)),
            cancel: CancellationToken::new(),
            schedule: Arc::new(Mutex::new(None)),
        })
    }

    pub async fn state(&self) -> FleetState {
        *self.state.read().await
    }

    /// Run the first reconciliation and schedule the following ones.
    ///
    /// # Errors
    ///
    /// A failure of the first reconciliation is returned and nothing is
    /// scheduled; the process cannot know what to collect.
    pub async fn start(&self) -> Result<ReconcileReport, CollectorError> {
        let report = self.reconcile().await?;

        let supervisor = self.clone();
        let interval = self.config.reconcile_interval;
        let task = tokio::spawn(async move { supervisor.run_schedule(interval).await });
        *self.schedule.lock().await = Some(task);

        info!(
            pods = report.running,
            reconcile_every_secs = interval.as_secs(),
            "Fleet supervisor started"
        );
        Ok(report)
    }

    async fn run_schedule(&self, interval: Duration) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.reconcile().await {
                warn!(error = %e, "Reconciliation failed, keeping current pods");
            }
        }
        debug!("Reconciliation schedule stopped");
    }

    /// Bring the running pods in line with the directory.
    pub async fn reconcile(&self) -> Result<ReconcileReport, CollectorError> {
        let desired = match self.directory.desired_endpoints().await {
            Ok(desired) => desired,
            Err(e) => {
                if self.state().await == FleetState::Uninitialized {
                    error!(error = %e, "Initial directory fetch failed");
                }
                return Err(e);
            }
        };

        let mut report = ReconcileReport::default();
        let mut removed = Vec::new();
        {
            let mut pods = self.pods.write().await;
            let plan = plan_reconciliation(pods.keys(), desired);

            for target_url in plan.to_stop {
                if let Some(handle) = pods.remove(&target_url) {
                    handle.stop();
                    removed.push(handle);
                }
                info!(target_url = %target_url, "Stopping pod, endpoint left the directory");
                report.stopped.push(target_url);
            }

            for endpoint in plan.to_start {
                let target_url = endpoint.target_url.clone();
                let pod = Pod::new(
                    endpoint,
                    self.config.pod_config(),
                    self.store.clone(),
                    self.sink.clone(),
                    self.http.clone(),
                );
                info!(
                    target_url = %target_url,
                    work_dir = %pod.work_dir().display(),
                    "Starting pod"
                );
                pods.insert(target_url.clone(), pod.spawn());
                report.started.push(target_url);
            }

            report.running = pods.len();
        }
        *self.state.write().await = FleetState::Converged;

        for handle in removed {
            handle.shutdown(POD_SHUTDOWN_TIMEOUT).await;
        }

        if !report.started.is_empty() || !report.stopped.is_empty() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                running = report.running,
                "Fleet reconciled"
            );
        }
        Ok(report)
    }

    /// Stop the schedule and every pod.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let schedule = self.schedule.lock().await.take();
        if let Some(task) = schedule {
            if let Err(e) = task.await {
                warn!(error = %e, "Reconciliation schedule task panicked");
            }
        }

        let handles: Vec<PodHandle> = self.pods.write().await.drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.stop();
        }
        let count = handles.len();
        for handle in handles {
            handle.shutdown(POD_SHUTDOWN_TIMEOUT).await;
        }
        info!(pods = count, "Fleet supervisor stopped");
    }

    pub async fn stats(&self) -> FleetStats {
        let pods = self.pods.read().await;
        FleetStats::new(pods.values().map(PodHandle::report).collect())
    }

    /// Target URLs of the running pods, sorted.
    pub async fn active_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.pods.read().await.keys().cloned().collect();
        targets.sort();
        targets
    }
}
