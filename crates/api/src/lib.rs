//! StatusHA public API façade.
//!
//! [`Aggregator`] walks every partitioned cache service of an injected
//! [`ClusterDirectory`] and reduces each one to its [`SafetyStatus`]. The
//! bounded variants run the walk on a single background worker and give up
//! waiting after a caller-supplied timeout.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use statusha_core::{is_reserved_service, ClusterDirectory, ClusterError, PartitionedService, DISTRIBUTED_CACHE};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub use statusha_core::SafetyStatus;

/// Service name -> worst-case HA status.
pub type ServiceStatuses = BTreeMap<String, SafetyStatus>;
/// Service name -> (process id -> primary partitions owned).
pub type ServiceOwnership = BTreeMap<String, BTreeMap<i64, u32>>;

/// Default number of scans that may wait for the worker at once.
pub const DEFAULT_PENDING_SCANS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("no services available in this cluster")]
    NoServicesAvailable,
    #[error("evaluating service {service}: {source}")]
    Evaluation {
        service: String,
        #[source]
        source: ClusterError,
    },
    #[error("status worker is shut down")]
    WorkerClosed,
    #[error("status scan aborted: {0}")]
    WorkerPanicked(String),
}

pub type StatusResult<T> = Result<T, StatusError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Capacity of the worker queue. Bounds how many timed-out scans can pile up.
    pub pending_scans: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self { Self { pending_scans: DEFAULT_PENDING_SCANS } }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let pending_scans = std::env::var("STATUSHA_PENDING_SCANS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_PENDING_SCANS);
        Self { pending_scans }
    }
}

// ----------------- Scans -----------------

/// Visit every evaluable service: not reserved, typed as a distributed cache.
/// The first failure aborts the walk.
fn scan_partitioned<T>(
    directory: &dyn ClusterDirectory,
    mut visit: impl FnMut(&str, &dyn PartitionedService) -> Result<T, ClusterError>,
) -> StatusResult<BTreeMap<String, T>> {
    let names = directory.service_names().ok_or(StatusError::NoServicesAvailable)?;
    let mut out = BTreeMap::new();
    for name in names {
        if is_reserved_service(&name) {
            continue;
        }
        let fail = |source: ClusterError| StatusError::Evaluation { service: name.clone(), source };
        let handle = directory.service(&name).map_err(fail)?;
        if handle.service_type() != DISTRIBUTED_CACHE {
            debug!(service = %name, kind = %handle.service_type(), "aggregator: skipping non-partitioned service");
            continue;
        }
        if !handle.has_partitioned_view() {
            return Err(fail(ClusterError::NotPartitioned(name.clone())));
        }
        let view = handle.partitioned_view().ok_or_else(|| fail(ClusterError::NotPartitioned(name.clone())))?;
        let value = visit(&name, view).map_err(fail)?;
        out.insert(name, value);
    }
    Ok(out)
}

/// Unbounded status scan on the calling thread.
pub fn scan_statuses(directory: &dyn ClusterDirectory) -> StatusResult<ServiceStatuses> {
    let t0 = Instant::now();
    let out = scan_partitioned(directory, |name, view| {
        let status = statusha_evaluator::evaluate_status(view);
        debug!(service = %name, status = %status, partitions = view.partition_count(), "aggregator: service evaluated");
        Ok(status)
    })?;
    histogram!("statusha_scan_ms", t0.elapsed().as_secs_f64() * 1000.0);
    counter!("statusha_scans_total", 1u64);
    gauge!("statusha_services", out.len() as f64);
    info!(services = out.len(), took_ms = %t0.elapsed().as_millis(), "aggregator: status scan ok");
    Ok(out)
}

/// Unbounded ownership scan on the calling thread.
pub fn scan_ownership(directory: &dyn ClusterDirectory) -> StatusResult<ServiceOwnership> {
    let t0 = Instant::now();
    let out: ServiceOwnership = scan_partitioned(directory, |_, view| {
        Ok(statusha_evaluator::ownership_distribution(view)?.into_iter().collect())
    })?;
    info!(services = out.len(), took_ms = %t0.elapsed().as_millis(), "aggregator: ownership scan ok");
    Ok(out)
}

// ----------------- Worker -----------------

type Job = Box<dyn FnOnce() + Send + 'static>;

async fn run_worker(mut rx: mpsc::Receiver<Job>) {
    info!("aggregator: worker started");
    while let Some(job) = rx.recv().await {
        // Scans block on cluster reads; keep them off the async threads.
        if let Err(e) = tokio::task::spawn_blocking(job).await {
            warn!(error = %e, "aggregator: scan task failed");
        }
    }
    info!("aggregator: worker stopped");
}

/// Cluster status aggregator owning one background worker.
///
/// Scans submitted through the bounded calls run one at a time in arrival
/// order. A scan whose caller stopped waiting is not cancelled: it runs to
/// completion and its result is dropped. Dropping the aggregator (or calling
/// [`Aggregator::shutdown`]) closes the queue; already queued scans still run.
pub struct Aggregator {
    directory: Arc<dyn ClusterDirectory>,
    jobs: mpsc::Sender<Job>,
    worker: tokio::task::JoinHandle<()>,
}

impl Aggregator {
    /// Must be called from within a tokio runtime.
    pub fn new(directory: Arc<dyn ClusterDirectory>, config: AggregatorConfig) -> Self {
        let (jobs, rx) = mpsc::channel::<Job>(config.pending_scans.max(1));
        let worker = tokio::spawn(run_worker(rx));
        Self { directory, jobs, worker }
    }

    /// Statuses of all partitioned services, computed on the calling thread.
    pub fn service_statuses(&self) -> StatusResult<ServiceStatuses> { scan_statuses(self.directory.as_ref()) }

    /// Ownership distribution of all partitioned services, computed on the calling thread.
    pub fn ownership_distributions(&self) -> StatusResult<ServiceOwnership> { scan_ownership(self.directory.as_ref()) }

    /// Like [`Self::service_statuses`] but waits at most `timeout`.
    /// An expired wait yields an empty map, not an error.
    pub async fn service_statuses_within(&self, timeout: Duration) -> StatusResult<ServiceStatuses> {
        Ok(self.run_bounded(timeout, "status", scan_statuses).await?.unwrap_or_default())
    }

    /// Like [`Self::ownership_distributions`] but waits at most `timeout`.
    pub async fn ownership_within(&self, timeout: Duration) -> StatusResult<ServiceOwnership> {
        Ok(self.run_bounded(timeout, "ownership", scan_ownership).await?.unwrap_or_default())
    }

    /// Submit `scan` to the worker; `Ok(None)` when the deadline passes first.
    /// The deadline covers waiting for a queue slot as well as the scan.
    async fn run_bounded<T, F>(&self, timeout: Duration, what: &'static str, scan: F) -> StatusResult<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ClusterDirectory) -> StatusResult<T> + Send + 'static,
    {
        let t0 = Instant::now();
        let (tx, rx) = oneshot::channel();
        let directory = Arc::clone(&self.directory);
        let job: Job = Box::new(move || {
            let res = scan(directory.as_ref());
            if tx.send(res).is_err() {
                debug!(scan = what, "aggregator: caller gone; discarding scan result");
            }
        });
        let submit_and_wait = async {
            self.jobs.send(job).await.map_err(|_| StatusError::WorkerClosed)?;
            match rx.await {
                Ok(res) => res,
                Err(_) => Err(StatusError::WorkerPanicked(format!("{} scan ended without a result", what))),
            }
        };
        match tokio::time::timeout(timeout, submit_and_wait).await {
            Ok(res) => res.map(Some),
            Err(_) => {
                counter!("statusha_scan_timeouts_total", 1u64);
                warn!(scan = what, timeout_ms = %timeout.as_millis(), waited_ms = %t0.elapsed().as_millis(), "aggregator: timed out waiting for scan");
                Ok(None)
            }
        }
    }

    /// Run `scan` to completion on the blocking pool, bypassing the worker queue.
    async fn run_blocking<T, F>(&self, what: &'static str, scan: F) -> StatusResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ClusterDirectory) -> StatusResult<T> + Send + 'static,
    {
        let directory = Arc::clone(&self.directory);
        tokio::task::spawn_blocking(move || scan(directory.as_ref()))
            .await
            .map_err(|e| StatusError::WorkerPanicked(format!("{} scan: {}", what, e)))?
    }

    /// Close the queue and wait for the worker to finish the scans already queued.
    pub async fn shutdown(self) {
        let Self { jobs, worker, .. } = self;
        drop(jobs);
        if let Err(e) = worker.await {
            warn!(error = %e, "aggregator: worker ended abnormally");
        }
    }
}

// ----------------- Façade trait -----------------

/// Status API surface used by frontends. `timeout: None` runs unbounded.
#[async_trait::async_trait]
pub trait StatusApi: Send + Sync {
    async fn statuses(&self, timeout: Option<Duration>) -> StatusResult<ServiceStatuses>;
    async fn ownership(&self, timeout: Option<Duration>) -> StatusResult<ServiceOwnership>;
}

#[async_trait::async_trait]
impl StatusApi for Aggregator {
    async fn statuses(&self, timeout: Option<Duration>) -> StatusResult<ServiceStatuses> {
        match timeout {
            Some(t) => self.service_statuses_within(t).await,
            None => self.run_blocking("status", scan_statuses).await,
        }
    }

    async fn ownership(&self, timeout: Option<Duration>) -> StatusResult<ServiceOwnership> {
        match timeout {
            Some(t) => self.ownership_within(t).await,
            None => self.run_blocking("ownership", scan_ownership).await,
        }
    }
}

/// Simple in-memory mock implementation for tests.
#[derive(Default)]
pub struct MockApi {
    pub statuses: ServiceStatuses,
    pub ownership: ServiceOwnership,
    /// When set, every call fails with `NoServicesAvailable`.
    pub unavailable: bool,
}

#[async_trait::async_trait]
impl StatusApi for MockApi {
    async fn statuses(&self, _timeout: Option<Duration>) -> StatusResult<ServiceStatuses> {
        if self.unavailable { return Err(StatusError::NoServicesAvailable); }
        Ok(self.statuses.clone())
    }

    async fn ownership(&self, _timeout: Option<Duration>) -> StatusResult<ServiceOwnership> {
        if self.unavailable { return Err(StatusError::NoServicesAvailable); }
        Ok(self.ownership.clone())
    }
}
