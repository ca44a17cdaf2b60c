use arc_velocity::catalog::{ArcCatalog, Direction, RouteArc, Stop};
use arc_velocity::config::Config;
use arc_velocity::error::{MasterError, WorkerError, WorkerResult};
use arc_velocity::master::{DistributedMaster, WorkerHandle};
use arc_velocity::metrics::Metrics;
use arc_velocity::model::{Datagram, ProcessingTask, StreamingWindow, VelocityResult, merge_arc_velocities};
use arc_velocity::rpc::{MasterClient, serve_master, serve_worker};
use arc_velocity::worker::{VelocityWorker, Worker};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn datagram(vehicle: &str, stop: &str, odometer: f64, secs: i64) -> Datagram {
    Datagram {
        event_type: 0,
        vehicle_id: vehicle.to_string(),
        trip_id: format!("trip-{}", vehicle),
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
        vec![RouteArc {
            line_id: "L1".to_string(),
            direction: Direction::Outbound,
            start_sequence: 1,
            end_sequence: 2,
            start_stop_id: "A".to_string(),
            end_stop_id: "B".to_string(),
            distance_meters: 100.0,
        }],
    ))
}

/// Ten datagrams split 5/5 across two workers. Each half holds one A->B pair
/// (8 m/s in the first, 12 m/s in the second) plus three single-sample trips.
fn batch() -> Vec<Datagram> {
    vec![
        datagram("V1", "A", 1000.0, 0),
        datagram("V1", "B", 1080.0, 10),
        datagram("V2", "X", 0.0, 0),
        datagram("V3", "X", 0.0, 0),
        datagram("V4", "X", 0.0, 0),
        datagram("V5", "A", 2000.0, 0),
        datagram("V5", "B", 2120.0, 10),
        datagram("V6", "X", 0.0, 0),
        datagram("V7", "X", 0.0, 0),
        datagram("V8", "X", 0.0, 0),
    ]
}

fn master(max_workers: usize) -> DistributedMaster {
    let config = Config {
        max_workers,
        ..Config::default()
    };
    DistributedMaster::new(catalog(), Arc::new(Metrics::new()), &config)
}

fn local(id: &str) -> WorkerHandle {
    WorkerHandle::new(id, format!("{}:9000", id), Arc::new(VelocityWorker::new(id)))
}

struct FailingWorker;

#[async_trait]
impl Worker for FailingWorker {
    async fn process_task(&self, task: ProcessingTask) -> WorkerResult<VelocityResult> {
        Err(WorkerError::TaskFailed {
            task_id: task.task_id,
            reason: "disk full".to_string(),
        })
    }

    async fn process_streaming_window(
        &self,
        window: StreamingWindow,
        _catalog: Arc<ArcCatalog>,
    ) -> WorkerResult<VelocityResult> {
        Err(WorkerError::TaskFailed {
            task_id: window.window_id,
            reason: "disk full".to_string(),
        })
    }

    async fn is_alive(&self) -> WorkerResult<bool> {
        Ok(true)
    }

    async fn system_status(&self) -> WorkerResult<String> {
        Ok("failing".to_string())
    }
}

struct StuckWorker;

#[async_trait]
impl Worker for StuckWorker {
    async fn process_task(&self, _task: ProcessingTask) -> WorkerResult<VelocityResult> {
        std::future::pending().await
    }

    async fn process_streaming_window(
        &self,
        _window: StreamingWindow,
        _catalog: Arc<ArcCatalog>,
    ) -> WorkerResult<VelocityResult> {
        std::future::pending().await
    }

    async fn is_alive(&self) -> WorkerResult<bool> {
        Ok(true)
    }

    async fn system_status(&self) -> WorkerResult<String> {
        Ok("stuck".to_string())
    }
}

#[tokio::test]
async fn test_historical_batch_across_two_workers() {
    let master = master(4);
    assert!(master.register_worker(local("w1")).await);
    assert!(master.register_worker(local("w2")).await);

    let results = master.process_historical(batch()).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| !r.is_error()));
    assert_eq!(results.iter().map(|r| r.sample_count).sum::<u64>(), 2);

    let arcs = merge_arc_velocities(&results);
    assert_eq!(arcs.len(), 1);
    assert_eq!(arcs[0].arc_id, "ARC_L1_IDA_1_2");
    assert_eq!(arcs[0].sample_count, 2);
    assert!((arcs[0].average_velocity - 10.0).abs() < 1e-9);

    let snapshot = master.metrics().snapshot();
    assert_eq!(snapshot.datagrams_processed, 10);
    assert_eq!(snapshot.tasks_by_worker.values().sum::<u64>(), 2);
}

#[tokio::test]
async fn test_historical_batch_without_workers() {
    let master = master(4);
    let err = master.process_historical(batch()).await.unwrap_err();
    assert_eq!(err, MasterError::NoWorkersAvailable);
}

#[tokio::test]
async fn test_failed_task_becomes_error_result() {
    let master = master(4);
    master.register_worker(local("w1")).await;
    master
        .register_worker(WorkerHandle::new("bad", "bad:9000", Arc::new(FailingWorker)))
        .await;

    let results = master.process_historical(batch()).await.unwrap();

    assert_eq!(results.len(), 2);
    let failed: Vec<_> = results.iter().filter(|r| r.is_error()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].sample_count, 0);
    assert!(failed[0].error.as_deref().unwrap_or_default().contains("disk full"));
    assert_eq!(master.metrics().snapshot().tasks_by_worker.get("bad:9000"), Some(&0));
}

#[tokio::test]
async fn test_batch_timeout_discards_partial_results() {
    let master = master(4).with_processing_timeout(Duration::from_millis(50));
    master.register_worker(local("w1")).await;
    master
        .register_worker(WorkerHandle::new("stuck", "stuck:9000", Arc::new(StuckWorker)))
        .await;

    let err = master.process_historical(batch()).await.unwrap_err();

    assert!(matches!(err, MasterError::ProcessingTimeout { .. }));
}

#[tokio::test]
async fn test_streaming_failure_fails_the_call() {
    let master = master(4);
    master
        .register_worker(WorkerHandle::new("bad", "bad:9000", Arc::new(FailingWorker)))
        .await;

    let window = StreamingWindow {
        window_id: "window-0".to_string(),
        datagrams: batch(),
        start: at(0),
        end: at(59),
    };
    let err = master.process_streaming_window(window).await.unwrap_err();

    assert!(matches!(
        err,
        MasterError::StreamingProcessingFailed { ref window_id, .. } if window_id == "window-0"
    ));
}

#[tokio::test]
async fn test_registry_capacity_is_enforced() {
    let master = master(1);
    assert!(master.register_worker(local("w1")).await);
    assert!(!master.register_worker(local("w2")).await);
    assert!(master.system_status().await.contains("Workers: 1/1 (100.0%)"));
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = worker_listener.local_addr().unwrap().to_string();
    let (stop_worker, worker_stopped) = oneshot::channel::<()>();
    tokio::spawn(serve_worker(
        worker_listener,
        Arc::new(VelocityWorker::new("remote-1")),
        async move {
            let _ = worker_stopped.await;
        },
    ));

    let master_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let master_addr = master_listener.local_addr().unwrap().to_string();
    let (stop_master, master_stopped) = oneshot::channel::<()>();
    tokio::spawn(serve_master(
        master_listener,
        Arc::new(master(1)),
        Duration::from_secs(5),
        async move {
            let _ = master_stopped.await;
        },
    ));

    let client = MasterClient::new(master_addr, Duration::from_secs(5));
    client.register("remote-1", &worker_addr).await.unwrap();

    let rejected = client.register("remote-2", "127.0.0.1:1").await.unwrap_err();
    assert!(matches!(rejected, MasterError::RegistrationRejected { .. }));

    let results = client.process_historical(&batch()).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].sample_count, 2);
    assert!((results[0].average_velocity - 10.0).abs() < 1e-9);

    let status = client.system_status().await.unwrap();
    assert!(status.starts_with("Master Status - Workers: 1/1"));

    assert!(client.unregister("remote-1", &worker_addr).await.unwrap());
    let err = client.process_historical(&batch()).await.unwrap_err();
    assert_eq!(err, MasterError::NoWorkersAvailable);

    let _ = stop_master.send(());
    let _ = stop_worker.send(());
}

#[tokio::test]
async fn test_batch_timeout_reaches_tcp_client_by_name() {
    let worker_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let worker_addr = worker_listener.local_addr().unwrap().to_string();
    tokio::spawn(serve_worker(
        worker_listener,
        Arc::new(StuckWorker),
        std::future::pending::<()>(),
    ));

    let batch_timeout = Duration::from_millis(300);
    let rpc_timeout = Duration::from_secs(2);
    let master_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let master_addr = master_listener.local_addr().unwrap().to_string();
    tokio::spawn(serve_master(
        master_listener,
        Arc::new(master(1).with_processing_timeout(batch_timeout)),
        rpc_timeout,
        std::future::pending::<()>(),
    ));

    // Same budget as `Config::submit_timeout`: batch deadline plus one worker call.
    let client = MasterClient::new(master_addr, batch_timeout + rpc_timeout);
    client.register("stuck", &worker_addr).await.unwrap();

    let err = client.process_historical(&batch()).await.unwrap_err();

    assert_eq!(err, MasterError::ProcessingTimeout { timeout: batch_timeout });
}
