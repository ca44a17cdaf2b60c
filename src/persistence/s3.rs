use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

use super::{VelocityRow, VelocitySink};
use crate::error::PersistenceError;

/// Writes each row as a JSON object. A PUT to an existing key replaces it.
#[derive(Debug, Clone)]
pub struct S3Sink {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Sink {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the standard AWS environment.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }

    pub fn object_key(row: &VelocityRow) -> String {
        format!(
            "velocity_by_arc/year_month={}/line_id={}/{}.json",
            row.year_month, row.line_id, row.arc_id
        )
    }
}

#[async_trait]
impl VelocitySink for S3Sink {
    async fn upsert(&self, row: &VelocityRow) -> Result<(), PersistenceError> {
        let key = Self::object_key(row);
        let body = serde_json::to_vec(row)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| PersistenceError::WriteFailed {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        debug!(bucket = %self.bucket, key = %key, "Velocity row written");
        Ok(())
    }
}
