//! Data types shared by the master, the workers and the wire codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use crate::catalog::ArcCatalog;

/// One vehicle telemetry sample.
///
/// `timestamp` and `odometer_meters` are expected non-decreasing within a trip;
/// samples that violate this are discarded by the velocity computation, never corrected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datagram {
    pub event_type: i32,
    pub vehicle_id: String,
    pub trip_id: String,
    pub line_id: String,
    /// Nearest or last known stop.
    pub stop_id: String,
    pub odometer_meters: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Grouping key for trip reconstruction: `(vehicle, trip, line)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TripKey<'a> {
    pub vehicle_id: &'a str,
    pub trip_id: &'a str,
    pub line_id: &'a str,
}

impl Datagram {
    pub fn trip_key(&self) -> TripKey<'_> {
        TripKey {
            vehicle_id: &self.vehicle_id,
            trip_id: &self.trip_id,
            line_id: &self.line_id,
        }
    }
}

/// A partition of a historical batch, dispatched to one worker.
///
/// Holds a range into the shared batch instead of a copy; the catalog is shared the same way.
#[derive(Debug, Clone)]
pub struct ProcessingTask {
    pub task_id: String,
    source: Arc<[Datagram]>,
    range: Range<usize>,
    pub catalog: Arc<ArcCatalog>,
    pub partition_index: usize,
    pub partition_count: usize,
}

impl ProcessingTask {
    /// Creates a task over `source[range]`. The range is clamped to the source length.
    pub fn new(
        task_id: String,
        source: Arc<[Datagram]>,
        range: Range<usize>,
        catalog: Arc<ArcCatalog>,
        partition_index: usize,
        partition_count: usize,
    ) -> Self {
        let end = range.end.min(source.len());
        let start = range.start.min(end);
        Self {
            task_id,
            source,
            range: start..end,
            catalog,
            partition_index,
            partition_count,
        }
    }

    /// Creates a task owning its datagrams, as received off the wire.
    pub fn from_datagrams(
        task_id: String,
        datagrams: Vec<Datagram>,
        catalog: Arc<ArcCatalog>,
        partition_index: usize,
        partition_count: usize,
    ) -> Self {
        let len = datagrams.len();
        Self::new(
            task_id,
            datagrams.into(),
            0..len,
            catalog,
            partition_index,
            partition_count,
        )
    }

    pub fn datagrams(&self) -> &[Datagram] {
        &self.source[self.range.clone()]
    }

    /// The shared batch and this task's range within it.
    pub fn shared(&self) -> (Arc<[Datagram]>, Range<usize>) {
        (self.source.clone(), self.range.clone())
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// A bounded slice of datagrams representing one streaming interval.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingWindow {
    pub window_id: String,
    pub datagrams: Vec<Datagram>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl StreamingWindow {
    /// Datagrams whose timestamp falls inside `[start, end]`.
    pub fn datagrams_in_bounds(&self) -> Vec<Datagram> {
        self.datagrams
            .iter()
            .filter(|d| d.timestamp >= self.start && d.timestamp <= self.end)
            .cloned()
            .collect()
    }
}

/// Mean velocity and sample count for a single arc.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcVelocity {
    pub arc_id: String,
    pub line_id: String,
    /// Meters per second.
    pub average_velocity: f64,
    pub sample_count: u64,
}

/// Outcome of one task (or one streaming window) at a worker.
///
/// `average_velocity` and `sample_count` aggregate every accepted sample of the task;
/// `arcs` carries the per-arc breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityResult {
    pub arc_id: String,
    pub task_id: String,
    pub average_velocity: f64,
    pub sample_count: u64,
    pub processing_time_millis: u64,
    pub arcs: Vec<ArcVelocity>,
    pub error: Option<String>,
}

impl VelocityResult {
    /// Builds a result whose aggregate is the sample-weighted mean over `arcs`.
    pub fn from_arcs(arc_id: String, task_id: &str, arcs: Vec<ArcVelocity>) -> Self {
        let sample_count: u64 = arcs.iter().map(|a| a.sample_count).sum();
        let weighted: f64 = arcs
            .iter()
            .map(|a| a.average_velocity * a.sample_count as f64)
            .sum();
        let average_velocity = if sample_count == 0 {
            0.0
        } else {
            weighted / sample_count as f64
        };

        Self {
            arc_id,
            task_id: task_id.to_string(),
            average_velocity,
            sample_count,
            processing_time_millis: 0,
            arcs,
            error: None,
        }
    }

    /// Error-shaped result standing in for a failed task.
    pub fn task_error(task_id: &str, reason: impl Into<String>) -> Self {
        Self {
            arc_id: format!("error-{}", task_id),
            task_id: task_id.to_string(),
            average_velocity: 0.0,
            sample_count: 0,
            processing_time_millis: 0,
            arcs: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Folds the per-arc detail of a batch into one sample-weighted entry per arc, ordered by arc id.
pub fn merge_arc_velocities(results: &[VelocityResult]) -> Vec<ArcVelocity> {
    let mut merged: BTreeMap<&str, (&str, f64, u64)> = BTreeMap::new();

    for arc in results.iter().flat_map(|r| r.arcs.iter()) {
        let entry = merged
            .entry(arc.arc_id.as_str())
            .or_insert((arc.line_id.as_str(), 0.0, 0));
        entry.1 += arc.average_velocity * arc.sample_count as f64;
        entry.2 += arc.sample_count;
    }

    merged
        .into_iter()
        .map(|(arc_id, (line_id, weighted, count))| ArcVelocity {
            arc_id: arc_id.to_string(),
            line_id: line_id.to_string(),
            average_velocity: if count == 0 { 0.0 } else { weighted / count as f64 },
            sample_count: count,
        })
        .collect()
}
