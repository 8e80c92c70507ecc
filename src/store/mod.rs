//! Usage store contract.
//!
//! All coordination between admission cycles happens through a shared
//! counter store. The store is partitioned by principal; inside a partition
//! records are ordered by sort key, which carries the policy or reservation
//! prefix (`10min:`, `hourly:`, `monthly:`, `reservation:`).

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a usage store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or rejected the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A single record inside a principal's partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub sort_key: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Epoch seconds, set by the first writer.
    pub created_at: Option<i64>,
    /// Epoch seconds after which the store may drop the record.
    pub ttl: Option<i64>,
}

impl UsageRecord {
    /// Whether the record's TTL has elapsed at `now_secs`.
    pub fn is_expired(&self, now_secs: i64) -> bool {
        matches!(self.ttl, Some(ttl) if ttl > 0 && now_secs > ttl)
    }
}

/// Counter increments applied by [`UsageStore::atomic_add`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Attributes written only when the record does not have them yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetOnce {
    pub created_at: i64,
    pub ttl: i64,
}

/// Atomic-counter key-value store with TTL expiry and range queries.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Fetch one record.
    async fn get(&self, partition: &str, sort_key: &str) -> Result<Option<UsageRecord>, StoreError>;

    /// Unconditionally write a record.
    async fn put(&self, partition: &str, record: UsageRecord) -> Result<(), StoreError>;

    /// Add `delta` to the record's counters, creating it if needed.
    ///
    /// Concurrent adds to the same key must combine without lost updates.
    /// `set_once` attributes are only written when absent.
    async fn atomic_add(
        &self,
        partition: &str,
        sort_key: &str,
        delta: TokenDelta,
        set_once: SetOnce,
    ) -> Result<(), StoreError>;

    /// List records whose sort key starts with `prefix` and lies within the
    /// inclusive `[lower, upper]` bounds, in ascending sort key order.
    async fn query_range(
        &self,
        partition: &str,
        prefix: &str,
        lower: Option<&str>,
        upper: Option<&str>,
    ) -> Result<Vec<UsageRecord>, StoreError>;

    /// Delete a record. Deleting a missing key succeeds.
    async fn delete(&self, partition: &str, sort_key: &str) -> Result<(), StoreError>;
}
