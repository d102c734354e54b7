//! Listing the shards of one shard set.

use crate::error::Result;
use crate::io::cloud::ObjectIO;
use crate::keys::{is_shard_key, shard_key};
use std::collections::HashSet;
use tracing::{debug, info};

/// Lists shard files directly under a directory prefix, in lexical (and so
/// numeric) order.
///
/// Works the same over any [`ObjectIO`] backend. A missing bucket or an empty
/// prefix yields an empty list: zero shards means zero findings, not an error.
pub struct ShardLocator<'a> {
    storage: &'a dyn ObjectIO,
}

impl<'a> ShardLocator<'a> {
    pub fn new(storage: &'a dyn ObjectIO) -> Self {
        Self { storage }
    }

    /// # Errors
    /// Returns a storage error for listing failures other than "not found".
    pub fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let objects = match self.storage.list_objects(bucket, Some(&dir)) {
            Ok(objects) => objects,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut shards: Vec<String> = objects
            .into_iter()
            .map(|o| o.key)
            .filter(|key| {
                key.strip_prefix(dir.as_str())
                    .is_some_and(|name| !name.contains('/') && is_shard_key(name))
            })
            .collect();
        shards.sort();
        debug!(bucket, prefix = %dir, shards = shards.len(), "located shards");
        Ok(shards)
    }

    /// Delete every shard under `prefix` other than the first `kept`, so a
    /// shorter re-run does not leave an earlier run's tail behind.
    ///
    /// Returns the number of shards deleted.
    ///
    /// # Errors
    /// Returns a storage error if the listing or a deletion fails.
    pub fn prune(&self, bucket: &str, prefix: &str, kept: usize) -> Result<usize> {
        let keep: HashSet<String> = (1..=kept).map(|index| shard_key(prefix, index)).collect();
        let mut removed = 0;
        for key in self.list(bucket, prefix)? {
            if keep.contains(&key) {
                continue;
            }
            self.storage.delete_object(bucket, &key)?;
            removed += 1;
        }
        if removed > 0 {
            info!(bucket, prefix, kept, removed, "removed stale shards");
        }
        Ok(removed)
    }
}
