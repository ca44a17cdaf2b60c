//! Reporting for batch results.
//!
//! Supports logging per-task summaries and the merged per-arc table, and CSV append.

use anyhow::Result;
use chrono::{DateTime, Utc};
use csv::WriterBuilder;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::model::{ArcVelocity, VelocityResult};

/// One row of the per-arc CSV export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArcRecord {
    pub processed_at: DateTime<Utc>,
    pub arc_id: String,
    pub line_id: String,
    pub average_velocity_mps: f64,
    pub average_velocity_kmh: f64,
    pub sample_count: u64,
}

impl ArcRecord {
    pub fn new(arc: &ArcVelocity, processed_at: DateTime<Utc>) -> Self {
        Self {
            processed_at,
            arc_id: arc.arc_id.clone(),
            line_id: arc.line_id.clone(),
            average_velocity_mps: arc.average_velocity,
            average_velocity_kmh: arc.average_velocity * 3.6,
            sample_count: arc.sample_count,
        }
    }
}

/// Logs one line per task result.
pub fn log_task_results(results: &[VelocityResult]) {
    for r in results {
        match &r.error {
            Some(error) => warn!(task_id = %r.task_id, arc_id = %r.arc_id, error = %error, "Task failed"),
            None => info!(
                task_id = %r.task_id,
                arcs = r.arcs.len(),
                samples = r.sample_count,
                avg_mps = r.average_velocity,
                elapsed_ms = r.processing_time_millis,
                "Task result"
            ),
        }
    }
}

/// Logs the merged per-arc table.
pub fn log_arc_table(arcs: &[ArcVelocity]) {
    for arc in arcs {
        info!(
            arc_id = %arc.arc_id,
            line_id = %arc.line_id,
            avg_kmh = arc.average_velocity * 3.6,
            samples = arc.sample_count,
            "Arc velocity"
        );
    }
    info!(arcs = arcs.len(), "Arc table complete");
}

/// Logs results as pretty-printed JSON.
pub fn print_json(results: &[VelocityResult]) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(results)?);
    Ok(())
}

/// Appends one row per arc to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_arc_records(path: &Path, arcs: &[ArcVelocity], processed_at: DateTime<Utc>) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, rows = arcs.len(), "Appending CSV records");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    for arc in arcs {
        writer.serialize(ArcRecord::new(arc, processed_at))?;
    }
    writer.flush()?;

    Ok(())
}
