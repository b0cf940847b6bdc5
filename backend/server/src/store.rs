//! # Certificate Store
//!
//! Everything the service needs from durable storage, behind two traits so the Redis backend
//! and the in-memory backend are interchangeable.
//!
//! ## Guarantees expected from an implementation
//! - [`SequenceStore::increment`] is one atomic read-increment-write per partition
//! - [`CertificateStore::insert_certificate`] claims the (student, course) active slot and writes
//!   the record together, or does neither
//! - [`CertificateStore::transition`] is a compare-and-set on the current status
//! - stats counters move in the same atomic unit as the writes they count
use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codec::Status;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("Store timed out")]
    Timeout,

    #[error("Concurrent update on {key}")]
    Conflict { key: String },

    #[error("No record at {key}")]
    Missing { key: String },

    #[error("Active certificate {existing} already holds this slot")]
    Duplicate { existing: String },

    #[error("Corrupted data at {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

impl StoreError {
    /// Worth one more attempt from the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Backend(_))
    }
}

/// Scope of sequence uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    pub year: u32,
    pub course_code: String,
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.year, self.course_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub csl: String,
    pub core: String,
    pub year: u32,
    pub course_code: String,
    pub sequence: u32,
    pub student_id: u64,
    pub course_id: u64,
    pub issuer_id: u64,
    pub status: Status,
    pub issued_at: DateTime<Utc>,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub status_changed_by: Option<u64>,
    pub status_reason: Option<String>,
}

/// Audit trail of a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub from: Status,
    pub to: Status,
    pub actor_id: u64,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl CertificateRecord {
    pub(crate) fn apply(&mut self, change: &StatusChange) {
        self.status = change.to;
        self.status_changed_at = Some(change.at);
        self.status_changed_by = Some(change.actor_id);
        self.status_reason = change.reason.clone();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearStats {
    pub year: u32,
    pub total: u64,
    pub by_course: BTreeMap<String, u64>,
    pub by_status: BTreeMap<Status, u64>,
}

#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Bumps the partition counter and returns the new value. First call returns 1.
    async fn increment(&self, partition: &Partition) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait CertificateStore: SequenceStore {
    async fn register_course(&self, course_id: u64, course_code: &str) -> Result<(), StoreError>;

    async fn course_code(&self, course_id: u64) -> Result<Option<String>, StoreError>;

    /// Core string of the active certificate for (student, course), if any.
    async fn active_certificate(
        &self,
        student_id: u64,
        course_id: u64,
    ) -> Result<Option<String>, StoreError>;

    /// Fails with [`StoreError::Duplicate`] when the active slot is already taken.
    async fn insert_certificate(&self, record: &CertificateRecord) -> Result<(), StoreError>;

    async fn find_by_core(&self, core: &str) -> Result<Option<CertificateRecord>, StoreError>;

    /// Applies `change` only if the stored status still equals `change.from`.
    async fn transition(
        &self,
        core: &str,
        change: &StatusChange,
    ) -> Result<CertificateRecord, StoreError>;

    async fn stats(&self, year: u32) -> Result<YearStats, StoreError>;
}
