//! CSV to Parquet conversion in fixed-size row shards.

use crate::error::{PipelineError, Result};
use crate::io::cloud::ObjectIO;
use crate::io::csv::CsvChunks;
use crate::io::parquet::encode_batch;
use crate::keys;
use crate::locator::ShardLocator;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Body of the `.done_pqs` marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionSummary {
    pub source_key: String,
    pub shard_dir: String,
    pub shards: usize,
    pub rows: u64,
}

/// Result of converting one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOutput {
    pub shard_dir: String,
    pub shard_keys: Vec<String>,
    pub marker_key: String,
    pub rows: u64,
}

/// Streams a CSV object into Parquet shards of `batch_size` rows each.
///
/// Only one chunk is held in memory at a time. Shards are written under
/// deterministic, zero-padded keys, so re-running a conversion overwrites the
/// previous run's shards in place; shards beyond the new count are deleted.
/// The completion marker is written last.
pub struct ShardWriter<'a> {
    storage: &'a dyn ObjectIO,
    batch_size: usize,
}

impl<'a> ShardWriter<'a> {
    pub fn new(storage: &'a dyn ObjectIO, batch_size: usize) -> Self {
        Self {
            storage,
            batch_size: batch_size.max(1),
        }
    }

    /// Convert `bucket/source_key`.
    ///
    /// # Errors
    /// Returns [`PipelineError::SourceRead`] if the source cannot be opened or
    /// parsed, and [`PipelineError::ShardWrite`] if a shard or the marker
    /// cannot be stored. No marker exists after a failed run.
    pub fn convert(&self, bucket: &str, source_key: &str) -> Result<ConversionOutput> {
        let shard_dir = keys::conversion_dir(source_key)?;
        let marker_key = keys::conversion_marker(source_key)?;
        info!(bucket, key = source_key, batch_size = self.batch_size, "converting source to shards");

        let reader = self
            .storage
            .open_object(bucket, source_key)
            .map_err(|e| PipelineError::source_read(source_key, e))?;
        let mut chunks =
            CsvChunks::new(reader, self.batch_size).map_err(|e| PipelineError::source_read(source_key, e))?;

        let mut shard_keys = Vec::new();
        for chunk in &mut chunks {
            let batch = chunk.map_err(|e| PipelineError::source_read(source_key, e))?;
            let shard_key = keys::shard_key(&shard_dir, shard_keys.len() + 1);
            let bytes = encode_batch(&batch).map_err(|e| PipelineError::shard_write(&shard_key, e))?;
            self.storage
                .put_object(bucket, &shard_key, &bytes)
                .map_err(|e| PipelineError::shard_write(&shard_key, e))?;
            debug!(key = %shard_key, rows = batch.num_rows(), "wrote conversion shard");
            shard_keys.push(shard_key);
        }
        let rows = chunks.rows_read();
        ShardLocator::new(self.storage)
            .prune(bucket, &shard_dir, shard_keys.len())
            .map_err(|e| PipelineError::shard_write(&shard_dir, e))?;

        let summary = ConversionSummary {
            source_key: source_key.to_string(),
            shard_dir: shard_dir.clone(),
            shards: shard_keys.len(),
            rows,
        };
        let body = serde_json::to_vec(&summary).map_err(|e| PipelineError::shard_write(&marker_key, e))?;
        self.storage
            .put_object(bucket, &marker_key, &body)
            .map_err(|e| PipelineError::shard_write(&marker_key, e))?;

        info!(bucket, key = source_key, shards = shard_keys.len(), rows, "conversion complete");
        Ok(ConversionOutput {
            shard_dir,
            shard_keys,
            marker_key,
            rows,
        })
    }
}
