use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{TaskState, Worker};
use crate::catalog::ArcCatalog;
use crate::error::{WorkerError, WorkerResult};
use crate::model::{ArcVelocity, Datagram, ProcessingTask, StreamingWindow, VelocityResult};
use crate::persistence::{VelocityRow, VelocitySink};
use crate::velocity::{VelocityComputer, summarize};

/// Computes velocities in this process and optionally persists per-arc rows.
pub struct VelocityWorker {
    worker_id: String,
    computer: VelocityComputer,
    sink: Option<Arc<dyn VelocitySink>>,
    tasks_processed: AtomicU64,
}

impl VelocityWorker {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            computer: VelocityComputer::new(),
            sink: None,
            tasks_processed: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn VelocitySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_computer(mut self, computer: VelocityComputer) -> Self {
        self.computer = computer;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn tasks_processed(&self) -> u64 {
        self.tasks_processed.load(Ordering::Relaxed)
    }

    /// Runs the computation off the async runtime.
    async fn compute(
        &self,
        id: &str,
        datagrams: Arc<[Datagram]>,
        range: std::ops::Range<usize>,
        catalog: Arc<ArcCatalog>,
    ) -> WorkerResult<Vec<ArcVelocity>> {
        let computer = self.computer.clone();
        tokio::task::spawn_blocking(move || {
            let velocities = computer.compute(&datagrams[range], &catalog);
            summarize(&velocities)
        })
        .await
        .map_err(|e| WorkerError::TaskFailed {
            task_id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Upserts one row per arc. Failures are logged and never fail the task.
    async fn persist(&self, arcs: &[ArcVelocity]) {
        let Some(sink) = &self.sink else {
            return;
        };

        let now = Utc::now();
        let mut failed = 0usize;
        for arc in arcs {
            let row = VelocityRow::from_arc(arc, now);
            if let Err(e) = sink.upsert(&row).await {
                failed += 1;
                warn!(arc_id = %arc.arc_id, error = %e, "Failed to persist velocity row");
            }
        }

        debug!(rows = arcs.len(), failed, "Velocity rows persisted");
    }
}

#[async_trait]
impl Worker for VelocityWorker {
    #[tracing::instrument(
        skip(self, task),
        fields(worker_id = %self.worker_id, task_id = %task.task_id, datagrams = task.len())
    )]
    async fn process_task(&self, task: ProcessingTask) -> WorkerResult<VelocityResult> {
        let started = Instant::now();
        debug!(state = %TaskState::Received, "Task state");

        let task_id = task.task_id.clone();
        let (datagrams, range) = task.shared();

        debug!(state = %TaskState::Computing, "Task state");
        let arcs = match self.compute(&task_id, datagrams, range, task.catalog).await {
            Ok(arcs) => arcs,
            Err(e) => {
                warn!(state = %TaskState::Failed, error = %e, "Task state");
                return Err(e);
            }
        };

        self.persist(&arcs).await;

        let mut result = VelocityResult::from_arcs(format!("aggregated-{}", task_id), &task_id, arcs);
        result.processing_time_millis = started.elapsed().as_millis() as u64;
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);

        info!(
            state = %TaskState::Succeeded,
            arcs = result.arcs.len(),
            samples = result.sample_count,
            elapsed_ms = result.processing_time_millis,
            "Task processed"
        );
        Ok(result)
    }

    #[tracing::instrument(
        skip(self, window, catalog),
        fields(worker_id = %self.worker_id, window_id = %window.window_id)
    )]
    async fn process_streaming_window(
        &self,
        window: StreamingWindow,
        catalog: Arc<ArcCatalog>,
    ) -> WorkerResult<VelocityResult> {
        let started = Instant::now();

        let in_bounds = window.datagrams_in_bounds();
        let dropped = window.datagrams.len() - in_bounds.len();
        if dropped > 0 {
            debug!(dropped, "Dropped datagrams outside window bounds");
        }

        let len = in_bounds.len();
        let arcs = self
            .compute(&window.window_id, in_bounds.into(), 0..len, catalog)
            .await?;

        let mut result = VelocityResult::from_arcs(
            format!("streaming-{}", window.window_id),
            &window.window_id,
            arcs,
        );
        result.processing_time_millis = started.elapsed().as_millis() as u64;

        info!(
            datagrams = len,
            arcs = result.arcs.len(),
            samples = result.sample_count,
            "Streaming window processed"
        );
        Ok(result)
    }

    async fn is_alive(&self) -> WorkerResult<bool> {
        Ok(true)
    }

    async fn system_status(&self) -> WorkerResult<String> {
        Ok(format!(
            "Worker {} - Tasks processed: {}",
            self.worker_id,
            self.tasks_processed()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Direction, RouteArc, Stop};
    use crate::error::PersistenceError;
    use crate::persistence::MemorySink;
    use chrono::{DateTime, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn datagram(stop: &str, odometer: f64, secs: i64) -> Datagram {
        Datagram {
            event_type: 0,
            vehicle_id: "V1".to_string(),
            trip_id: "T1".to_string(),
            line_id: "L1".to_string(),
            stop_id: stop.to_string(),
            odometer_meters: odometer,
            latitude: 0.0,
            longitude: 0.0,
            timestamp: at(secs),
        }
    }

    fn catalog() -> Arc<ArcCatalog> {
        Arc::new(ArcCatalog::new(
            Vec::<Stop>::new(),
            vec![
                RouteArc {
                    line_id: "L1".to_string(),
                    direction: Direction::Outbound,
                    start_sequence: 1,
                    end_sequence: 2,
                    start_stop_id: "A".to_string(),
                    end_stop_id: "B".to_string(),
                    distance_meters: 100.0,
                },
                RouteArc {
                    line_id: "L1".to_string(),
                    direction: Direction::Outbound,
                    start_sequence: 2,
                    end_sequence: 3,
                    start_stop_id: "B".to_string(),
                    end_stop_id: "C".to_string(),
                    distance_meters: 100.0,
                },
            ],
        ))
    }

    struct BrokenSink;

    #[async_trait]
    impl VelocitySink for BrokenSink {
        async fn upsert(&self, row: &VelocityRow) -> Result<(), PersistenceError> {
            Err(PersistenceError::WriteFailed {
                key: row.arc_id.clone(),
                reason: "store offline".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_process_task_aggregates_and_persists() {
        let sink = Arc::new(MemorySink::new());
        let worker = VelocityWorker::new("w1").with_sink(sink.clone());
        let task = ProcessingTask::from_datagrams(
            "task-1-0".to_string(),
            vec![datagram("A", 1000.0, 0), datagram("B", 1100.0, 10)],
            catalog(),
            0,
            1,
        );

        let result = worker.process_task(task).await.unwrap();

        assert_eq!(result.arc_id, "aggregated-task-1-0");
        assert_eq!(result.task_id, "task-1-0");
        assert_eq!(result.sample_count, 1);
        assert!((result.average_velocity - 10.0).abs() < 1e-9);
        assert_eq!(result.arcs[0].arc_id, "ARC_L1_IDA_1_2");

        let rows = sink.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].arc_id, "ARC_L1_IDA_1_2");
        assert_eq!(rows[0].sample_count, 1);
        assert_eq!(worker.tasks_processed(), 1);
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_fail_task() {
        let worker = VelocityWorker::new("w1").with_sink(Arc::new(BrokenSink));
        let task = ProcessingTask::from_datagrams(
            "task-2-0".to_string(),
            vec![datagram("A", 1000.0, 0), datagram("B", 1100.0, 10)],
            catalog(),
            0,
            1,
        );

        let result = worker.process_task(task).await.unwrap();
        assert_eq!(result.sample_count, 1);
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn test_streaming_window_drops_out_of_bounds() {
        let worker = VelocityWorker::new("w1");
        let window = StreamingWindow {
            window_id: "win-1".to_string(),
            datagrams: vec![
                datagram("A", 1000.0, 0),
                datagram("B", 1100.0, 10),
                // Outside the window; would otherwise add a B -> C sample.
                datagram("C", 1200.0, 500),
            ],
            start: at(0),
            end: at(60),
        };

        let result = worker
            .process_streaming_window(window, catalog())
            .await
            .unwrap();

        assert_eq!(result.arc_id, "streaming-win-1");
        assert_eq!(result.sample_count, 1);
        assert_eq!(worker.tasks_processed(), 0);
    }

    #[tokio::test]
    async fn test_status_reports_tasks_processed() {
        let worker = VelocityWorker::new("w7");
        assert!(worker.is_alive().await.unwrap());
        assert_eq!(
            worker.system_status().await.unwrap(),
            "Worker w7 - Tasks processed: 0"
        );
    }
}
