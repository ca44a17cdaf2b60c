use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::registry::{WorkerHandle, WorkerRegistry};

/// Periodically probes every registered worker and evicts the ones that fail.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<WorkerRegistry>,
    interval: Duration,
    probe_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<WorkerRegistry>, interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            probe_timeout,
        }
    }

    /// Runs checks every `interval` until the returned handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                self.check_once().await;
            }
        })
    }

    /// Probes all workers concurrently; returns the number evicted.
    ///
    /// A probe that answers `false`, errors, or exceeds the probe timeout evicts the worker.
    #[tracing::instrument(skip(self))]
    pub async fn check_once(&self) -> usize {
        let workers = self.registry.list().await;
        let mut probes = JoinSet::new();

        for handle in workers {
            let timeout = self.probe_timeout;
            probes.spawn(async move {
                let outcome = tokio::time::timeout(timeout, handle.worker().is_alive()).await;
                (handle, outcome)
            });
        }

        let mut evicted = 0;
        while let Some(joined) = probes.join_next().await {
            let Ok((handle, outcome)) = joined else {
                continue;
            };

            let reason = match outcome {
                Ok(Ok(true)) => {
                    debug!(worker_id = %handle.worker_id(), "Worker alive");
                    continue;
                }
                Ok(Ok(false)) => "reported not alive".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("no answer within {:?}", self.probe_timeout),
            };

            if self.evict(&handle, &reason).await {
                evicted += 1;
            }
        }

        if evicted > 0 {
            let remaining = self.registry.count().await;
            info!(evicted, remaining, "Health check finished");
        }
        evicted
    }

    async fn evict(&self, handle: &WorkerHandle, reason: &str) -> bool {
        warn!(
            worker_id = %handle.worker_id(),
            endpoint = %handle.endpoint(),
            reason,
            "Worker failed health check, evicting"
        );
        self.registry.unregister_handle(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ArcCatalog;
    use crate::error::{WorkerError, WorkerResult};
    use crate::master::registry::tests::handle;
    use crate::metrics::Metrics;
    use crate::model::{ProcessingTask, StreamingWindow, VelocityResult};
    use crate::worker::Worker;
    use async_trait::async_trait;

    enum Liveness {
        Dead,
        Unreachable,
        Hung,
    }

    struct SickWorker(Liveness);

    #[async_trait]
    impl Worker for SickWorker {
        async fn process_task(&self, task: ProcessingTask) -> WorkerResult<VelocityResult> {
            Ok(VelocityResult::task_error(&task.task_id, "sick"))
        }

        async fn process_streaming_window(
            &self,
            window: StreamingWindow,
            _catalog: Arc<ArcCatalog>,
        ) -> WorkerResult<VelocityResult> {
            Ok(VelocityResult::task_error(&window.window_id, "sick"))
        }

        async fn is_alive(&self) -> WorkerResult<bool> {
            match self.0 {
                Liveness::Dead => Ok(false),
                Liveness::Unreachable => Err(WorkerError::Transport("connection refused".into())),
                Liveness::Hung => {
                    std::future::pending::<()>().await;
                    Ok(true)
                }
            }
        }

        async fn system_status(&self) -> WorkerResult<String> {
            Ok("sick".to_string())
        }
    }

    #[tokio::test]
    async fn test_check_once_evicts_failing_workers() {
        let registry = Arc::new(WorkerRegistry::new(10, Arc::new(Metrics::new())));
        registry.register(handle("ok")).await;
        for (id, liveness) in [("dead", Liveness::Dead), ("gone", Liveness::Unreachable), ("hung", Liveness::Hung)] {
            registry
                .register(WorkerHandle::new(id, format!("{}:1", id), Arc::new(SickWorker(liveness))))
                .await;
        }

        let monitor = HealthMonitor::new(
            registry.clone(),
            Duration::from_secs(30),
            Duration::from_millis(50),
        );
        let evicted = monitor.check_once().await;

        assert_eq!(evicted, 3);
        let remaining: Vec<String> = registry
            .list()
            .await
            .iter()
            .map(|h| h.worker_id().to_string())
            .collect();
        assert_eq!(remaining, vec!["ok"]);
    }

    /// Restarts itself at the same endpoint while its liveness check is still running.
    struct RestartingWorker {
        registry: Arc<WorkerRegistry>,
    }

    #[async_trait]
    impl Worker for RestartingWorker {
        async fn process_task(&self, task: ProcessingTask) -> WorkerResult<VelocityResult> {
            Ok(VelocityResult::task_error(&task.task_id, "restarting"))
        }

        async fn process_streaming_window(
            &self,
            window: StreamingWindow,
            _catalog: Arc<ArcCatalog>,
        ) -> WorkerResult<VelocityResult> {
            Ok(VelocityResult::task_error(&window.window_id, "restarting"))
        }

        async fn is_alive(&self) -> WorkerResult<bool> {
            self.registry.unregister("w1:9000").await;
            self.registry.register(handle("w1")).await;
            Ok(false)
        }

        async fn system_status(&self) -> WorkerResult<String> {
            Ok("restarting".to_string())
        }
    }

    #[tokio::test]
    async fn test_reregistered_worker_survives_failed_check() {
        let registry = Arc::new(WorkerRegistry::new(10, Arc::new(Metrics::new())));
        registry
            .register(WorkerHandle::new(
                "w1",
                "w1:9000",
                Arc::new(RestartingWorker {
                    registry: registry.clone(),
                }),
            ))
            .await;

        let monitor = HealthMonitor::new(
            registry.clone(),
            Duration::from_secs(30),
            Duration::from_secs(1),
        );

        assert_eq!(monitor.check_once().await, 0);
        let workers = registry.list().await;
        assert_eq!(workers.len(), 1);
        assert!(workers[0].worker().is_alive().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_runs_periodically() {
        let registry = Arc::new(WorkerRegistry::new(10, Arc::new(Metrics::new())));
        registry
            .register(WorkerHandle::new("dead", "dead:1", Arc::new(SickWorker(Liveness::Dead))))
            .await;

        let task = HealthMonitor::new(registry.clone(), Duration::from_secs(30), Duration::from_secs(5))
            .spawn();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.count().await, 0);
        task.abort();
    }
}
