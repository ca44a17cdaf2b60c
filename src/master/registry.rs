use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::worker::Worker;

/// A registered worker: its id, the endpoint that identifies it, and the callable proxy.
///
/// Clones share the in-flight counter, so a snapshot taken from the registry still reports
/// the live load of each worker.
#[derive(Clone)]
pub struct WorkerHandle {
    worker_id: String,
    endpoint: String,
    worker: Arc<dyn Worker>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub fn new(
        worker_id: impl Into<String>,
        endpoint: impl Into<String>,
        worker: Arc<dyn Worker>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            endpoint: endpoint.into(),
            worker,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    /// Tasks the master has dispatched to this worker that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Whether both handles come from the same registration, not just the same endpoint.
    pub fn same_registration(&self, other: &WorkerHandle) -> bool {
        Arc::ptr_eq(&self.in_flight, &other.in_flight)
    }

    /// Marks one task as dispatched until the returned guard is dropped.
    pub fn begin_task(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: self.in_flight.clone(),
        }
    }
}

impl PartialEq for WorkerHandle {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for WorkerHandle {}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("worker_id", &self.worker_id)
            .field("endpoint", &self.endpoint)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Decrements the worker's in-flight count on drop, including when the task is aborted.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The set of workers eligible for dispatch.
///
/// All mutations and snapshots go through one lock; callers only ever see cloned snapshots.
pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerHandle>>,
    max_workers: usize,
    metrics: Arc<Metrics>,
}

impl WorkerRegistry {
    pub fn new(max_workers: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            workers: RwLock::new(Vec::new()),
            max_workers,
            metrics,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Adds `handle` unless the registry is full. Registering an endpoint twice is a no-op.
    ///
    /// Returns `false` when rejected for capacity.
    pub async fn register(&self, handle: WorkerHandle) -> bool {
        let mut workers = self.workers.write().await;

        if workers.len() >= self.max_workers {
            warn!(
                worker_id = %handle.worker_id,
                max_workers = self.max_workers,
                "Worker limit reached, rejecting registration"
            );
            return false;
        }

        if !workers.contains(&handle) {
            self.metrics.worker_registered(&handle.endpoint);
            info!(
                worker_id = %handle.worker_id,
                endpoint = %handle.endpoint,
                total = workers.len() + 1,
                "Worker registered"
            );
            workers.push(handle);
        }
        true
    }

    /// Removes the worker with `endpoint`. Returns whether it was present.
    pub async fn unregister(&self, endpoint: &str) -> bool {
        self.remove_where(|h| h.endpoint == endpoint).await
    }

    /// Removes `handle` only if it is still the registration at its endpoint.
    ///
    /// A worker that re-registered at the same endpoint since `handle` was listed is kept.
    pub async fn unregister_handle(&self, handle: &WorkerHandle) -> bool {
        self.remove_where(|h| h.same_registration(handle)).await
    }

    async fn remove_where<P>(&self, predicate: P) -> bool
    where
        P: Fn(&WorkerHandle) -> bool,
    {
        let mut workers = self.workers.write().await;

        let Some(pos) = workers.iter().position(predicate) else {
            return false;
        };
        let handle = workers.remove(pos);
        self.metrics.worker_unregistered(&handle.endpoint);
        info!(
            worker_id = %handle.worker_id,
            endpoint = %handle.endpoint,
            total = workers.len(),
            "Worker unregistered"
        );
        true
    }

    /// Point-in-time copy of the registered workers, in registration order.
    pub async fn list(&self) -> Vec<WorkerHandle> {
        self.workers.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::ArcCatalog;
    use crate::error::WorkerResult;
    use crate::model::{ProcessingTask, StreamingWindow, VelocityResult};
    use async_trait::async_trait;

    pub(crate) struct IdleWorker;

    #[async_trait]
    impl Worker for IdleWorker {
        async fn process_task(&self, task: ProcessingTask) -> WorkerResult<VelocityResult> {
            Ok(VelocityResult::from_arcs(
                format!("aggregated-{}", task.task_id),
                &task.task_id,
                Vec::new(),
            ))
        }

        async fn process_streaming_window(
            &self,
            window: StreamingWindow,
            _catalog: Arc<ArcCatalog>,
        ) -> WorkerResult<VelocityResult> {
            Ok(VelocityResult::from_arcs(
                format!("streaming-{}", window.window_id),
                &window.window_id,
                Vec::new(),
            ))
        }

        async fn is_alive(&self) -> WorkerResult<bool> {
            Ok(true)
        }

        async fn system_status(&self) -> WorkerResult<String> {
            Ok("idle".to_string())
        }
    }

    pub(crate) fn handle(id: &str) -> WorkerHandle {
        WorkerHandle::new(id, format!("{}:9000", id), Arc::new(IdleWorker))
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let metrics = Arc::new(Metrics::new());
        let registry = WorkerRegistry::new(4, metrics.clone());

        assert!(registry.register(handle("w1")).await);
        assert!(registry.register(handle("w1")).await);

        assert_eq!(registry.count().await, 1);
        assert_eq!(metrics.snapshot().active_workers, 1);
    }

    #[tokio::test]
    async fn test_register_rejected_at_capacity() {
        let registry = WorkerRegistry::new(2, Arc::new(Metrics::new()));

        assert!(registry.register(handle("w1")).await);
        assert!(registry.register(handle("w2")).await);
        assert!(!registry.register(handle("w3")).await);

        let ids: Vec<String> = registry
            .list()
            .await
            .iter()
            .map(|h| h.worker_id().to_string())
            .collect();
        assert_eq!(ids, vec!["w1", "w2"]);
    }

    #[tokio::test]
    async fn test_unregister() {
        let metrics = Arc::new(Metrics::new());
        let registry = WorkerRegistry::new(4, metrics.clone());
        registry.register(handle("w1")).await;
        registry.register(handle("w2")).await;

        assert!(registry.unregister("w1:9000").await);
        assert!(!registry.unregister("w1:9000").await);

        assert_eq!(registry.count().await, 1);
        assert_eq!(metrics.snapshot().active_workers, 1);
    }

    #[tokio::test]
    async fn test_snapshot_unaffected_by_later_mutation() {
        let registry = WorkerRegistry::new(4, Arc::new(Metrics::new()));
        registry.register(handle("w1")).await;

        let snapshot = registry.list().await;
        registry.unregister("w1:9000").await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_shared_worker_id_keeps_separate_task_counts() {
        let metrics = Arc::new(Metrics::new());
        let registry = WorkerRegistry::new(4, metrics.clone());
        registry
            .register(WorkerHandle::new("w1", "host-a:9000", Arc::new(IdleWorker)))
            .await;
        registry
            .register(WorkerHandle::new("w1", "host-b:9000", Arc::new(IdleWorker)))
            .await;

        metrics.task_completed("host-b:9000");
        registry.unregister("host-a:9000").await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(snapshot.tasks_by_worker.len(), 1);
        assert_eq!(snapshot.tasks_by_worker.get("host-b:9000"), Some(&1));
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_remove_new_registration() {
        let registry = WorkerRegistry::new(4, Arc::new(Metrics::new()));
        registry.register(handle("w1")).await;
        let stale = registry.list().await.remove(0);

        // The worker restarts at the same endpoint.
        registry.unregister("w1:9000").await;
        registry.register(handle("w1")).await;

        assert!(!registry.unregister_handle(&stale).await);
        assert_eq!(registry.count().await, 1);

        let current = registry.list().await.remove(0);
        assert!(registry.unregister_handle(&current).await);
        assert_eq!(registry.count().await, 0);
    }

    #[test]
    fn test_in_flight_guard() {
        let h = handle("w1");
        let copy = h.clone();
        {
            let _a = h.begin_task();
            let _b = h.begin_task();
            assert_eq!(copy.in_flight(), 2);
        }
        assert_eq!(copy.in_flight(), 0);
    }
}
