//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

use tokenmeter::admission::AdmissionController;
use tokenmeter::clock::{Clock, ManualClock};
use tokenmeter::config::Settings;
use tokenmeter::store::{
    MemoryStore, SetOnce, StoreError, TokenDelta, UsageRecord, UsageStore,
};

#[derive(Debug, Default, Clone, Copy)]
struct Faults {
    reads: bool,
    writes: bool,
}

/// A [`MemoryStore`] whose reads and writes can be made to fail on demand.
#[derive(Debug)]
pub struct FaultyStore {
    inner: MemoryStore,
    faults: RwLock<Faults>,
}

impl FaultyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: MemoryStore::new(clock),
            faults: RwLock::new(Faults::default()),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.faults.write().reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.faults.write().writes = fail;
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.faults.read().reads {
            return Err(StoreError::Unavailable("read throttled".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.faults.read().writes {
            return Err(StoreError::Unavailable("write throttled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UsageStore for FaultyStore {
    async fn get(
        &self,
        partition: &str,
        sort_key: &str,
    ) -> Result<Option<UsageRecord>, StoreError> {
        self.check_read()?;
        self.inner.get(partition, sort_key).await
    }

    async fn put(&self, partition: &str, record: UsageRecord) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.put(partition, record).await
    }

    async fn atomic_add(
        &self,
        partition: &str,
        sort_key: &str,
        delta: TokenDelta,
        set_once: SetOnce,
    ) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.atomic_add(partition, sort_key, delta, set_once).await
    }

    async fn query_range(
        &self,
        partition: &str,
        prefix: &str,
        lower: Option<&str>,
        upper: Option<&str>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        self.check_read()?;
        self.inner.query_range(partition, prefix, lower, upper).await
    }

    async fn delete(&self, partition: &str, sort_key: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.inner.delete(partition, sort_key).await
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 8, 12, 5, 0).unwrap()
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<FaultyStore>,
    pub controller: AdmissionController,
}

pub fn harness(settings: &Settings) -> Harness {
    harness_at(settings, start_time())
}

pub fn harness_at(settings: &Settings, at: DateTime<Utc>) -> Harness {
    let clock = Arc::new(ManualClock::new(at));
    let store = Arc::new(FaultyStore::new(clock.clone()));
    let controller = AdmissionController::from_settings(settings, store.clone(), clock.clone())
        .expect("valid settings");
    Harness {
        clock,
        store,
        controller,
    }
}
