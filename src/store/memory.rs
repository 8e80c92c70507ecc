//! In-process usage store.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{SetOnce, StoreError, TokenDelta, UsageRecord, UsageStore};
use crate::clock::Clock;

/// A [`UsageStore`] held in process memory.
///
/// Each partition lives in one `DashMap` entry, so an atomic add runs under
/// that shard's write lock. Like a real TTL-capable store, expired records are
/// still visible until they are evicted by [`MemoryStore::purge_expired`] or
/// the reaper task.
pub struct MemoryStore {
    partitions: DashMap<String, BTreeMap<String, UsageRecord>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("partitions", &self.partitions.len())
            .field("clock", &self.clock)
            .finish()
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            partitions: DashMap::new(),
            clock,
        }
    }

    /// Total number of records across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict every record whose TTL has elapsed. Returns the number evicted.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now().timestamp();
        let mut evicted = 0;

        self.partitions.retain(|_, records| {
            let before = records.len();
            records.retain(|_, record| !record.is_expired(now));
            evicted += before - records.len();
            !records.is_empty()
        });

        if evicted > 0 {
            debug!(evicted = evicted, "Purged expired records");
        }
        evicted
    }

    /// Spawn a task that purges expired records every `interval`.
    ///
    /// The task stops once the store is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
        })
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn get(
        &self,
        partition: &str,
        sort_key: &str,
    ) -> Result<Option<UsageRecord>, StoreError> {
        Ok(self
            .partitions
            .get(partition)
            .and_then(|records| records.get(sort_key).cloned()))
    }

    async fn put(&self, partition: &str, record: UsageRecord) -> Result<(), StoreError> {
        trace!(partition = %partition, sort_key = %record.sort_key, "Put record");
        self.partitions
            .entry(partition.to_string())
            .or_default()
            .insert(record.sort_key.clone(), record);
        Ok(())
    }

    async fn atomic_add(
        &self,
        partition: &str,
        sort_key: &str,
        delta: TokenDelta,
        set_once: SetOnce,
    ) -> Result<(), StoreError> {
        let mut records = self.partitions.entry(partition.to_string()).or_default();
        let record = records
            .entry(sort_key.to_string())
            .or_insert_with(|| UsageRecord {
                sort_key: sort_key.to_string(),
                input_tokens: 0,
                output_tokens: 0,
                created_at: None,
                ttl: None,
            });

        record.input_tokens = record.input_tokens.saturating_add(delta.input_tokens);
        record.output_tokens = record.output_tokens.saturating_add(delta.output_tokens);
        record.created_at.get_or_insert(set_once.created_at);
        record.ttl.get_or_insert(set_once.ttl);

        trace!(
            partition = %partition,
            sort_key = %sort_key,
            input_tokens = record.input_tokens,
            output_tokens = record.output_tokens,
            "Atomic add applied"
        );
        Ok(())
    }

    async fn query_range(
        &self,
        partition: &str,
        prefix: &str,
        lower: Option<&str>,
        upper: Option<&str>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        let Some(records) = self.partitions.get(partition) else {
            return Ok(Vec::new());
        };

        let start = match lower {
            Some(lower) if lower > prefix => lower,
            _ => prefix,
        };

        Ok(records
            .range::<str, _>((Bound::Included(start), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take_while(|(key, _)| upper.map_or(true, |upper| key.as_str() <= upper))
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn delete(&self, partition: &str, sort_key: &str) -> Result<(), StoreError> {
        if let Some(mut records) = self.partitions.get_mut(partition) {
            records.remove(sort_key);
        }
        Ok(())
    }
}
