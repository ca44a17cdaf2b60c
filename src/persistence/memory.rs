use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{VelocityRow, VelocitySink};
use crate::error::PersistenceError;

type RowKey = (String, String, String);

/// In-process sink for local runs and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: RwLock<HashMap<RowKey, VelocityRow>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, year_month: &str, line_id: &str, arc_id: &str) -> Option<VelocityRow> {
        let key = (
            year_month.to_string(),
            line_id.to_string(),
            arc_id.to_string(),
        );
        self.rows.read().await.get(&key).cloned()
    }

    /// All rows, ordered by key.
    pub async fn rows(&self) -> Vec<VelocityRow> {
        let mut rows: Vec<VelocityRow> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| {
            (&a.year_month, &a.line_id, &a.arc_id).cmp(&(&b.year_month, &b.line_id, &b.arc_id))
        });
        rows
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl VelocitySink for MemorySink {
    async fn upsert(&self, row: &VelocityRow) -> Result<(), PersistenceError> {
        let key = (
            row.year_month.clone(),
            row.line_id.clone(),
            row.arc_id.clone(),
        );
        self.rows.write().await.insert(key, row.clone());
        Ok(())
    }
}
