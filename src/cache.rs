use std::collections::HashSet;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use crate::types::{ResourceRecord, SearchNode};

/// TTL-aware record store. Buckets are keyed by `SearchNode`; uniqueness
/// within a bucket follows `ResourceRecord` equality (node + payload, not
/// expiry). Expired entries are pruned lazily, on the next read of their
/// bucket; there is no removal API and no background sweep.
pub struct RecordCache {
    map: DashMap<SearchNode, HashSet<ResourceRecord>, FxBuildHasher>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    /// Currently valid records for `node`. Empty for unknown nodes.
    pub fn lookup(&self, node: &SearchNode) -> Vec<ResourceRecord> {
        match self.map.get_mut(node) {
            Some(mut bucket) => {
                bucket.retain(ResourceRecord::is_still_valid);
                bucket.iter().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Adds `record` unless it is already expired. On a duplicate, the copy
    /// with the later expiration wins, so TTLs only ever extend.
    pub fn insert(&self, record: ResourceRecord) {
        if !record.is_still_valid() {
            return;
        }

        let mut bucket = self.map.entry(record.node().clone()).or_default();
        match bucket.get(&record) {
            Some(existing) if !existing.expires_before(&record) => {}
            _ => {
                bucket.replace(record);
            }
        }
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new()
    }
}
