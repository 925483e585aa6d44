//! kgraph store: per-cluster ingestion scheduling, delta computation,
//! catalog sinks and the read-side graph index.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod backoff;
mod delta;
mod index;
mod pipeline;
mod scheduler;
mod sink;

pub use backoff::Backoff;
pub use delta::{compute_delta, CachedEntity, EntityCache};
pub use index::{ClusterStatus, ClusterView, CycleState, DeltaSummary, GraphIndex, LocatorStatus};
pub use pipeline::{CycleReport, Pipeline};
pub use scheduler::{ClusterSlot, Scheduler};
pub use sink::{CatalogSink, JsonLinesSink, MemorySink};

/// Handle for readers of a running scheduler.
pub struct IngestHandle {
    index: Arc<GraphIndex>,
    join: JoinHandle<()>,
}

impl IngestHandle {
    pub fn index(&self) -> Arc<GraphIndex> { Arc::clone(&self.index) }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.index.subscribe_epoch() }

    /// Wait for the scheduler to finish after its token was cancelled.
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "scheduler task ended abnormally");
        }
    }
}

/// Spawn the scheduler on the current runtime.
pub fn spawn_ingest(scheduler: Scheduler, cancel: CancellationToken) -> IngestHandle {
    let index = scheduler.index();
    let join = tokio::spawn(scheduler.run(cancel));
    IngestHandle { index, join }
}
