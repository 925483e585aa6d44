//! Supervisor plus one independent task per cluster.
//!
//! The supervisor resolves clusters once per tick and hands each cluster
//! task a fresh slot; every slot update starts one cycle on that cluster.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use kgraph_core::{ClusterRef, CycleError, CycleFatalError, ErrorScope, IngestError};
use kgraph_kubehub::{ClusterLocator, Resolution};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::delta::EntityCache;
use crate::index::{GraphIndex, LocatorStatus};
use crate::pipeline::{CycleReport, Pipeline};

/// What the supervisor last told a cluster task.
#[derive(Debug, Clone)]
pub struct ClusterSlot {
    /// Last successfully resolved connection details.
    pub cluster: ClusterRef,
    /// Set when this tick's cycle is skipped: the locator is unavailable or
    /// the cluster's definition failed to resolve.
    pub skip: Option<IngestError>,
}

struct ClusterTask {
    slot: watch::Sender<ClusterSlot>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Scheduler {
    locator: ClusterLocator,
    pipeline: Arc<Pipeline>,
    interval: Duration,
    backoff: Backoff,
}

impl Scheduler {
    pub fn new(locator: ClusterLocator, pipeline: Pipeline, interval: Duration, backoff: Backoff) -> Self {
        Self { locator, pipeline: Arc::new(pipeline), interval, backoff }
    }

    pub fn index(&self) -> Arc<GraphIndex> { Arc::clone(self.pipeline.index()) }

    /// Resolve clusters once and run a single cycle for each, concurrently,
    /// starting from empty caches.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Vec<CycleReport>, CycleFatalError> {
        let resolution = self.locator.resolve_clusters().await?;
        self.publish_locator(Ok(&resolution));
        let runs = resolution.clusters.iter().map(|cluster| {
            let pipeline = Arc::clone(&self.pipeline);
            async move {
                let mut cache = EntityCache::default();
                pipeline.run_cycle(cluster, &mut cache, cancel).await
            }
        });
        Ok(join_all(runs).await.into_iter().flatten().collect())
    }

    fn publish_locator(&self, outcome: Result<&Resolution, &CycleFatalError>) {
        let status = match outcome {
            Ok(res) => LocatorStatus {
                resolved_at: Some(Utc::now()),
                clusters: res.clusters.len(),
                error: None,
                skipped: res.errors.iter().map(|e| e.to_string()).collect(),
            },
            Err(e) => LocatorStatus {
                resolved_at: Some(Utc::now()),
                clusters: 0,
                error: Some(e.to_string()),
                skipped: Vec::new(),
            },
        };
        self.pipeline.index().set_locator(status);
    }

    /// Run until `cancel` fires, then wait for every cluster task to stop.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks: FxHashMap<String, ClusterTask> = FxHashMap::default();
        let mut stopping: FxHashMap<String, JoinHandle<()>> = FxHashMap::default();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), kinds = self.pipeline.selectors().len(), "scheduler: started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            stopping.retain(|_, h| !h.is_finished());
            match self.locator.resolve_clusters().await {
                Ok(resolution) => {
                    self.publish_locator(Ok(&resolution));
                    let mut live: Vec<String> = Vec::with_capacity(resolution.clusters.len() + resolution.skipped.len());
                    for skipped in resolution.skipped {
                        if let Some(task) = tasks.get(&skipped.name) {
                            debug!(cluster = %skipped.name, error = %skipped.error, "scheduler: keeping last good state for skipped cluster");
                            task.slot.send_modify(|s| s.skip = Some(IngestError::from(skipped.error)));
                        }
                        live.push(skipped.name);
                    }
                    for cluster in resolution.clusters {
                        live.push(cluster.name.clone());
                        let slot = ClusterSlot { cluster, skip: None };
                        match tasks.get(&slot.cluster.name) {
                            Some(task) => {
                                task.slot.send_replace(slot);
                            }
                            None => {
                                let name = slot.cluster.name.clone();
                                if let Some(previous) = stopping.remove(&name) {
                                    // its cleanup must not wipe the new task's state
                                    let _ = previous.await;
                                }
                                info!(cluster = %name, "scheduler: cluster added");
                                tasks.insert(name, self.spawn_cluster(slot, cancel.child_token()));
                            }
                        }
                    }
                    let vanished: Vec<String> = tasks.keys().filter(|n| !live.contains(n)).cloned().collect();
                    for name in vanished {
                        if let Some(task) = tasks.remove(&name) {
                            info!(cluster = %name, "scheduler: cluster removed; stopping its task");
                            task.cancel.cancel();
                            let index = Arc::clone(self.pipeline.index());
                            let cluster = name.clone();
                            let cleanup = tokio::spawn(async move {
                                if let Err(e) = task.join.await {
                                    warn!(cluster = %cluster, error = %e, "scheduler: cluster task ended abnormally");
                                }
                                index.forget(&cluster);
                            });
                            stopping.insert(name, cleanup);
                        }
                    }
                    gauge!("kgraph_clusters", tasks.len() as f64);
                }
                Err(err) => {
                    warn!(error = %err, "scheduler: locator unavailable; skipping tick");
                    counter!("kgraph_locator_errors_total", 1u64);
                    self.publish_locator(Err(&err));
                    for task in tasks.values() {
                        task.slot.send_modify(|s| s.skip = Some(IngestError::from(err.clone())));
                    }
                }
            }
        }

        info!(clusters = tasks.len(), "scheduler: shutting down");
        for task in tasks.values() {
            task.cancel.cancel();
        }
        let handles = tasks.into_values().map(|t| t.join).chain(stopping.into_values());
        for res in join_all(handles).await {
            if let Err(e) = res {
                warn!(error = %e, "scheduler: cluster task ended abnormally");
            }
        }
        info!("scheduler: stopped");
    }

    fn spawn_cluster(&self, slot: ClusterSlot, cancel: CancellationToken) -> ClusterTask {
        let (tx, rx) = watch::channel(slot);
        let join = tokio::spawn(cluster_loop(Arc::clone(&self.pipeline), rx, self.backoff, cancel.clone()));
        ClusterTask { slot: tx, cancel, join }
    }
}

/// One cycle per slot update, starting with the slot the task was spawned
/// with. After a failure the task sleeps out its backoff and then waits for
/// a tick that arrives after it, so cycles never run more often than the
/// supervisor ticks.
async fn cluster_loop(
    pipeline: Arc<Pipeline>,
    mut slot: watch::Receiver<ClusterSlot>,
    backoff: Backoff,
    cancel: CancellationToken,
) {
    let mut cache = EntityCache::default();
    let name = slot.borrow().cluster.name.clone();
    let mut first = true;

    loop {
        if !first {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = slot.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        first = false;

        let current = slot.borrow_and_update().clone();
        let failures = match current.skip {
            Some(err) => {
                debug!(cluster = %name, error = %err, "scheduler: cycle skipped");
                let scope = ErrorScope::Cluster { cluster: name.clone() };
                pipeline.index().record_failure(&name, vec![CycleError::new(scope, &err)])
            }
            None => match pipeline.run_cycle(&current.cluster, &mut cache, &cancel).await {
                Some(report) => report.consecutive_failures,
                None => break,
            },
        };

        if failures > 0 {
            let delay = backoff.delay(failures);
            debug!(cluster = %name, failures, delay_ms = %delay.as_millis(), "scheduler: backing off");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            // ticks seen while backing off do not start a cycle
            let _ = slot.borrow_and_update();
        }
    }
    debug!(cluster = %name, cached = cache.len(), "scheduler: cluster task stopped");
}
