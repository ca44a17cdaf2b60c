//! Coordination: worker registry, worker selection, batch partitioning, fan-out and health checks.

pub mod balancer;
pub mod health;
pub mod partition;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{Instrument, info, warn};

use crate::catalog::ArcCatalog;
use crate::config::Config;
use crate::error::{MasterError, MasterResult};
use crate::metrics::Metrics;
use crate::model::{Datagram, StreamingWindow, VelocityResult};

pub use balancer::{LoadBalancer, Strategy};
pub use health::HealthMonitor;
pub use partition::TaskPartitioner;
pub use registry::{WorkerHandle, WorkerRegistry};

/// Which worker handles a streaming window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingRouting {
    /// Always the first registered worker, so consecutive windows see one worker.
    #[default]
    Pinned,
    /// Selected by the load balancer like historical tasks.
    Balanced,
}

impl FromStr for StreamingRouting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pinned" => Ok(StreamingRouting::Pinned),
            "balanced" => Ok(StreamingRouting::Balanced),
            other => Err(format!(
                "unknown streaming routing '{}', expected pinned or balanced",
                other
            )),
        }
    }
}

impl fmt::Display for StreamingRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamingRouting::Pinned => f.write_str("pinned"),
            StreamingRouting::Balanced => f.write_str("balanced"),
        }
    }
}

/// Entry point for historical batches and streaming windows.
pub struct DistributedMaster {
    registry: Arc<WorkerRegistry>,
    balancer: LoadBalancer,
    partitioner: TaskPartitioner,
    catalog: Arc<ArcCatalog>,
    metrics: Arc<Metrics>,
    processing_timeout: Duration,
    streaming_routing: StreamingRouting,
}

impl DistributedMaster {
    pub fn new(catalog: Arc<ArcCatalog>, metrics: Arc<Metrics>, config: &Config) -> Self {
        Self {
            registry: Arc::new(WorkerRegistry::new(config.max_workers, metrics.clone())),
            balancer: LoadBalancer::new(config.load_balancing),
            partitioner: TaskPartitioner::new(),
            catalog,
            metrics,
            processing_timeout: config.processing_timeout(),
            streaming_routing: config.streaming_routing,
        }
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ArcCatalog> {
        &self.catalog
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Returns `false` when the registry is full.
    pub async fn register_worker(&self, handle: WorkerHandle) -> bool {
        self.registry.register(handle).await
    }

    pub async fn unregister_worker(&self, endpoint: &str) -> bool {
        self.registry.unregister(endpoint).await
    }

    /// A monitor over this master's registry; call [`HealthMonitor::spawn`] to start it.
    pub fn health_monitor(&self, interval: Duration, probe_timeout: Duration) -> HealthMonitor {
        HealthMonitor::new(self.registry.clone(), interval, probe_timeout)
    }

    /// Processes a batch against the master's own catalog.
    pub async fn process_historical(
        &self,
        datagrams: Vec<Datagram>,
    ) -> MasterResult<Vec<VelocityResult>> {
        self.process_historical_with_catalog(datagrams.into(), self.catalog.clone())
            .await
    }

    /// Splits the batch into one task per registered worker and waits for all of them.
    ///
    /// A failed task becomes an error result instead of failing the batch. If the batch
    /// does not finish within the processing timeout, the whole call fails and every
    /// outstanding task is aborted.
    #[tracing::instrument(skip_all, fields(datagrams = datagrams.len()))]
    pub async fn process_historical_with_catalog(
        &self,
        datagrams: Arc<[Datagram]>,
        catalog: Arc<ArcCatalog>,
    ) -> MasterResult<Vec<VelocityResult>> {
        let workers = self.registry.list().await;
        if workers.is_empty() {
            return Err(MasterError::NoWorkersAvailable);
        }

        let started = Instant::now();
        let datagram_count = datagrams.len();
        let tasks = self.partitioner.partition(datagrams, catalog, workers.len());
        info!(
            tasks = tasks.len(),
            workers = workers.len(),
            "Distributing historical batch"
        );

        let mut running = JoinSet::new();
        let mut dispatched = Vec::with_capacity(tasks.len());

        for task in tasks {
            let Some(handle) = self.balancer.select(&workers) else {
                return Err(MasterError::NoWorkersAvailable);
            };

            let task_id = task.task_id.clone();
            dispatched.push(task_id.clone());

            let span = tracing::info_span!(
                "dispatch_task",
                task_id = %task_id,
                worker_id = %handle.worker_id(),
            );
            let metrics = self.metrics.clone();

            running.spawn(
                async move {
                    let _in_flight = handle.begin_task();
                    match handle.worker().process_task(task).await {
                        Ok(mut result) => {
                            metrics.task_completed(handle.endpoint());
                            result.task_id = task_id;
                            result
                        }
                        Err(e) => {
                            warn!(error = %e, "Task failed, recording error result");
                            VelocityResult::task_error(&task_id, e.to_string())
                        }
                    }
                }
                .instrument(span),
            );
        }

        let collect = async {
            let mut results = Vec::with_capacity(dispatched.len());
            while let Some(joined) = running.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => warn!(error = %e, "Task unit ended without a result"),
                }
            }
            results
        };

        let Ok(mut results) = tokio::time::timeout(self.processing_timeout, collect).await else {
            warn!(timeout = ?self.processing_timeout, "Historical batch timed out, discarding partial results");
            return Err(MasterError::ProcessingTimeout {
                timeout: self.processing_timeout,
            });
        };

        for task_id in &dispatched {
            if !results.iter().any(|r| &r.task_id == task_id) {
                results.push(VelocityResult::task_error(
                    task_id,
                    "task ended without a result",
                ));
            }
        }

        let elapsed = started.elapsed();
        self.metrics.record_processing(datagram_count, elapsed);

        let failed = results.iter().filter(|r| r.is_error()).count();
        info!(
            results = results.len(),
            failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Historical batch completed"
        );
        Ok(results)
    }

    /// Sends the whole window to a single worker; any failure fails the call.
    #[tracing::instrument(
        skip_all,
        fields(window_id = %window.window_id, datagrams = window.datagrams.len())
    )]
    pub async fn process_streaming_window(
        &self,
        window: StreamingWindow,
    ) -> MasterResult<Vec<VelocityResult>> {
        let workers = self.registry.list().await;
        let handle = match self.streaming_routing {
            StreamingRouting::Pinned => workers.first().cloned(),
            StreamingRouting::Balanced => self.balancer.select(&workers),
        }
        .ok_or(MasterError::NoWorkersAvailable)?;

        let started = Instant::now();
        let datagram_count = window.datagrams.len();
        let window_id = window.window_id.clone();

        let result = {
            let _in_flight = handle.begin_task();
            handle
                .worker()
                .process_streaming_window(window, self.catalog.clone())
                .await
        }
        .map_err(|e| {
            warn!(worker_id = %handle.worker_id(), error = %e, "Streaming window failed");
            MasterError::StreamingProcessingFailed {
                window_id,
                reason: e.to_string(),
            }
        })?;

        self.metrics.task_completed(handle.endpoint());
        self.metrics
            .record_processing(datagram_count, started.elapsed());

        info!(
            worker_id = %handle.worker_id(),
            samples = result.sample_count,
            "Streaming window completed"
        );
        Ok(vec![result])
    }

    /// `Master Status - Workers: a/m (p%) - Tasks: t - Arcs: n`
    pub async fn system_status(&self) -> String {
        let active = self.registry.count().await;
        let max = self.registry.max_workers();
        let utilization = if max == 0 {
            0.0
        } else {
            active as f64 / max as f64 * 100.0
        };

        format!(
            "Master Status - Workers: {}/{} ({:.1}%) - Tasks: {} - Arcs: {}",
            active,
            max,
            utilization,
            self.partitioner.tasks_created(),
            self.catalog.arc_count()
        )
    }
}
