//! Best-effort storage of per-arc velocity aggregates.
//!
//! Rows are keyed by `(year_month, line_id, arc_id)`; writing the same key twice overwrites it.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::model::ArcVelocity;

pub use memory::MemorySink;
pub use s3::S3Sink;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VelocityRow {
    pub year_month: String,
    pub line_id: String,
    pub arc_id: String,
    pub avg_velocity: f64,
    pub sample_count: u64,
    pub updated_at: DateTime<Utc>,
}

impl VelocityRow {
    pub fn from_arc(arc: &ArcVelocity, now: DateTime<Utc>) -> Self {
        Self {
            year_month: year_month(now),
            line_id: arc.line_id.clone(),
            arc_id: arc.arc_id.clone(),
            avg_velocity: arc.average_velocity,
            sample_count: arc.sample_count,
            updated_at: now,
        }
    }
}

/// `YYYY_MM` partition of `now`.
pub fn year_month(now: DateTime<Utc>) -> String {
    now.format("%Y_%m").to_string()
}

#[async_trait]
pub trait VelocitySink: Send + Sync {
    /// Inserts the row, or overwrites an existing row with the same key.
    async fn upsert(&self, row: &VelocityRow) -> Result<(), PersistenceError>;
}
