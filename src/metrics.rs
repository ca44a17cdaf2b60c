//! Processing and cluster metrics.
//!
//! Counters are atomics so tasks, the registry and the health monitor can update them
//! concurrently without a shared lock on the hot path.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    datagrams_processed: AtomicU64,
    processing_millis: AtomicU64,
    batches: AtomicU64,
    active_workers: AtomicI64,
    tasks_by_worker: RwLock<HashMap<String, AtomicU64>>,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub datagrams_processed: u64,
    pub processing_millis: u64,
    pub batches: u64,
    pub active_workers: i64,
    /// Datagrams per second over all recorded batches.
    pub average_throughput: f64,
    /// Completed tasks per worker endpoint.
    pub tasks_by_worker: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-worker counts are keyed by endpoint, which is what identifies a registration.
    pub fn worker_registered(&self, endpoint: &str) {
        self.active_workers.fetch_add(1, Ordering::Relaxed);
        self.tasks_by_worker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicU64::new(0));
    }

    pub fn worker_unregistered(&self, endpoint: &str) {
        self.active_workers.fetch_sub(1, Ordering::Relaxed);
        self.tasks_by_worker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
    }

    /// Counts a completed task. Ignored for workers that are no longer registered.
    pub fn task_completed(&self, endpoint: &str) {
        if let Some(count) = self
            .tasks_by_worker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(endpoint)
        {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_processing(&self, datagram_count: usize, elapsed: Duration) {
        self.datagrams_processed
            .fetch_add(datagram_count as u64, Ordering::Relaxed);
        self.processing_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn throughput(datagrams: u64, millis: u64) -> f64 {
        if millis == 0 {
            0.0
        } else {
            datagrams as f64 / millis as f64 * 1000.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let datagrams_processed = self.datagrams_processed.load(Ordering::Relaxed);
        let processing_millis = self.processing_millis.load(Ordering::Relaxed);

        let tasks_by_worker = self
            .tasks_by_worker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, count)| (id.clone(), count.load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            datagrams_processed,
            processing_millis,
            batches: self.batches.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            average_throughput: Self::throughput(datagrams_processed, processing_millis),
            tasks_by_worker,
        }
    }

    /// Clears throughput counters and per-worker task counts. Worker membership is kept.
    pub fn reset(&self) {
        self.datagrams_processed.store(0, Ordering::Relaxed);
        self.processing_millis.store(0, Ordering::Relaxed);
        self.batches.store(0, Ordering::Relaxed);
        for count in self
            .tasks_by_worker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            count.store(0, Ordering::Relaxed);
        }
    }
}
