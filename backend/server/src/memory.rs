//! In-memory store for tests and local runs without Redis.
//!
//! One mutex over all maps, so every trait method is trivially atomic. Nothing survives a
//! restart.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use codec::Status;
use tokio::sync::Mutex;

use crate::store::{
    CertificateRecord, CertificateStore, Partition, SequenceStore, StatusChange, StoreError,
    YearStats,
};

#[derive(Default)]
struct Inner {
    courses: HashMap<u64, String>,
    sequences: HashMap<Partition, u64>,
    active: HashMap<(u64, u64), String>,
    records: HashMap<String, CertificateRecord>,
    stats: HashMap<u32, YearStats>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SequenceStore for MemoryStore {
    async fn increment(&self, partition: &Partition) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let counter = inner.sequences.entry(partition.clone()).or_insert(0);
        *counter += 1;

        Ok(*counter)
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn register_course(&self, course_id: u64, course_code: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.courses.insert(course_id, course_code.to_string());

        Ok(())
    }

    async fn course_code(&self, course_id: u64) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.courses.get(&course_id).cloned())
    }

    async fn active_certificate(
        &self,
        student_id: u64,
        course_id: u64,
    ) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;

        Ok(inner.active.get(&(student_id, course_id)).cloned())
    }

    async fn insert_certificate(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let slot = (record.student_id, record.course_id);

        if let Some(existing) = inner.active.get(&slot) {
            return Err(StoreError::Duplicate {
                existing: existing.clone(),
            });
        }

        if inner.records.contains_key(&record.core) {
            return Err(StoreError::Conflict {
                key: record.core.clone(),
            });
        }

        inner.active.insert(slot, record.core.clone());
        inner.records.insert(record.core.clone(), record.clone());

        let stats = inner.stats.entry(record.year).or_insert_with(|| YearStats {
            year: record.year,
            ..Default::default()
        });
        stats.total += 1;
        *stats.by_course.entry(record.course_code.clone()).or_default() += 1;
        *stats.by_status.entry(record.status).or_default() += 1;

        Ok(())
    }

    async fn find_by_core(&self, core: &str) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(self.inner.lock().await.records.get(core).cloned())
    }

    async fn transition(
        &self,
        core: &str,
        change: &StatusChange,
    ) -> Result<CertificateRecord, StoreError> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let Some(record) = inner.records.get_mut(core) else {
            return Err(StoreError::Missing {
                key: core.to_string(),
            });
        };

        if record.status != change.from {
            return Err(StoreError::Conflict {
                key: core.to_string(),
            });
        }

        let slot = (record.student_id, record.course_id);
        if change.to == Status::Active {
            match inner.active.get(&slot) {
                Some(holder) if holder != core => {
                    return Err(StoreError::Duplicate {
                        existing: holder.clone(),
                    });
                }
                _ => {
                    inner.active.insert(slot, core.to_string());
                }
            }
        } else if change.from == Status::Active
            && inner.active.get(&slot).map(String::as_str) == Some(core)
        {
            inner.active.remove(&slot);
        }

        record.apply(change);

        if let Some(stats) = inner.stats.get_mut(&record.year) {
            if let Some(count) = stats.by_status.get_mut(&change.from) {
                *count = count.saturating_sub(1);
            }
            *stats.by_status.entry(change.to).or_default() += 1;
        }

        Ok(record.clone())
    }

    async fn stats(&self, year: u32) -> Result<YearStats, StoreError> {
        let inner = self.inner.lock().await;

        Ok(inner.stats.get(&year).cloned().unwrap_or(YearStats {
            year,
            ..Default::default()
        }))
    }
}
