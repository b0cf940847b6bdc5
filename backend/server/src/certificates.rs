//! # Issuance and Verification
//!
//! Glue between the allocator, the codec and the store.
//!
//! ## Issue
//! 1. resolve the course code
//! 2. reject early when (student, course) already has an active certificate
//! 3. allocate the next sequence for (year, course code)
//! 4. mint the CSL with the active pepper
//! 5. insert, which re-checks the active slot atomically
//!
//! Every store round-trip is bounded by the configured timeout. A transient failure re-runs
//! the whole thing once with a fresh sequence, the earlier one stays burned.
//!
//! ## Verify
//! Format first, then the record lookup by core string, then the codec does the rest.
use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Datelike, Utc};
use codec::{
    CodecError, Linked, MAX_SEQUENCE, Pepper, Reason, Status, Verdict, mint,
    normalize_course_code, parse, validate_format, verification_url, verify_parsed,
};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{
    allocator::{AllocationError, SequenceAllocator},
    store::{CertificateRecord, CertificateStore, Partition, StatusChange, StoreError, YearStats},
};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Error, Debug)]
pub enum IssueError {
    #[error("Certificate already exists for student {student_id} in course {course_id}")]
    Duplicate { student_id: u64, course_id: u64 },

    #[error("Course {0} not found")]
    CourseNotFound(u64),

    #[error("No serial numbers left for {course_code} in {year}")]
    PartitionExhausted { year: u32, course_code: String },

    #[error(transparent)]
    InvalidInput(#[from] CodecError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IssueError {
    fn is_transient(&self) -> bool {
        match self {
            IssueError::Allocation(_) => true,
            IssueError::Store(err) => matches!(err, StoreError::Conflict { .. }),
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Malformed certificate number")]
    Malformed,

    #[error("Certificate {0} not found")]
    NotFound(String),

    #[error("Cannot move certificate from {from} to {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("Another active certificate exists for this student and course")]
    Duplicate,

    #[error("Certificate changed concurrently, retry")]
    Conflict,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate { .. } => LifecycleError::Duplicate,
            StoreError::Conflict { .. } => LifecycleError::Conflict,
            other => LifecycleError::Store(other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Issued {
    pub csl: String,
    pub sequence: u32,
    pub verify_url: String,
}

pub struct CertificateService {
    store: Arc<dyn CertificateStore>,
    allocator: SequenceAllocator<dyn CertificateStore>,
    peppers: Vec<Pepper>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    public_base_url: String,
}

impl CertificateService {
    /// `pepper` mints, `pepper` and every `retired` pepper verify.
    pub fn new(
        store: Arc<dyn CertificateStore>,
        pepper: Pepper,
        retired: Vec<Pepper>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
        public_base_url: impl Into<String>,
    ) -> Self {
        let mut peppers = vec![pepper];
        peppers.extend(retired);

        Self {
            allocator: SequenceAllocator::new(store.clone()),
            store,
            peppers,
            clock,
            store_timeout,
            public_base_url: public_base_url.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CertificateStore> {
        &self.store
    }

    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        timeout(self.store_timeout, operation)
            .await
            .unwrap_or(Err(StoreError::Timeout))
    }

    pub async fn issue(
        &self,
        student_id: u64,
        course_id: u64,
        issuer_id: u64,
    ) -> Result<Issued, IssueError> {
        match self.try_issue(student_id, course_id, issuer_id).await {
            Err(err) if err.is_transient() => {
                warn!(student_id, course_id, error = %err, "issuance failed, retrying once");
                self.try_issue(student_id, course_id, issuer_id).await
            }
            result => result,
        }
    }

    async fn try_issue(
        &self,
        student_id: u64,
        course_id: u64,
        issuer_id: u64,
    ) -> Result<Issued, IssueError> {
        let course_code = self
            .bounded(self.store.course_code(course_id))
            .await?
            .ok_or(IssueError::CourseNotFound(course_id))?;
        let course_code = normalize_course_code(&course_code)?;

        if self
            .bounded(self.store.active_certificate(student_id, course_id))
            .await?
            .is_some()
        {
            return Err(IssueError::Duplicate {
                student_id,
                course_id,
            });
        }

        let issued_at = self.clock.now();
        let year = u32::try_from(issued_at.year()).map_err(|_| CodecError::InvalidYear(0))?;
        let partition = Partition {
            year,
            course_code: course_code.clone(),
        };

        let sequence = timeout(self.store_timeout, self.allocator.next_sequence(&partition))
            .await
            .unwrap_or_else(|_| {
                Err(AllocationError {
                    partition: partition.to_string(),
                    source: StoreError::Timeout,
                })
            })?;

        let sequence = u32::try_from(sequence)
            .ok()
            .filter(|sequence| *sequence <= MAX_SEQUENCE)
            .ok_or_else(|| IssueError::PartitionExhausted {
                year,
                course_code: course_code.clone(),
            })?;

        let csl = mint(year, &course_code, sequence, student_id, &self.peppers[0])?;
        let core = csl[..csl.len() - codec::HASH_LEN - 1].to_string();

        let record = CertificateRecord {
            csl: csl.clone(),
            core,
            year,
            course_code,
            sequence,
            student_id,
            course_id,
            issuer_id,
            status: Status::Active,
            issued_at,
            status_changed_at: None,
            status_changed_by: None,
            status_reason: None,
        };

        match self.bounded(self.store.insert_certificate(&record)).await {
            Ok(()) => {}
            Err(StoreError::Duplicate { .. }) => {
                return Err(IssueError::Duplicate {
                    student_id,
                    course_id,
                });
            }
            Err(err) => return Err(err.into()),
        }

        info!(csl = %csl, student_id, course_id, issuer_id, "issued certificate");

        Ok(Issued {
            verify_url: verification_url(&self.public_base_url, &csl),
            csl,
            sequence,
        })
    }

    /// Public check. Only storage trouble comes back as `Err`, bad input is a [`Verdict`].
    pub async fn verify(&self, csl: &str) -> Result<Verdict, StoreError> {
        if !validate_format(csl) {
            return Ok(Verdict {
                valid: false,
                reason: Reason::Malformed,
            });
        }

        let Some(parsed) = parse(csl) else {
            return Ok(Verdict {
                valid: false,
                reason: Reason::Malformed,
            });
        };

        let linked = self
            .bounded(self.store.find_by_core(&parsed.core()))
            .await?
            .map(|record| Linked {
                owner_id: record.student_id,
                status: record.status,
            });

        Ok(verify_parsed(&parsed, linked, &self.peppers))
    }

    pub async fn set_status(
        &self,
        csl: &str,
        status: Status,
        actor_id: u64,
        reason: Option<String>,
    ) -> Result<CertificateRecord, LifecycleError> {
        let parsed = parse(csl).ok_or(LifecycleError::Malformed)?;
        let core = parsed.core();

        // a CSL with a forged hash must not be able to move the real record
        let record = self
            .bounded(self.store.find_by_core(&core))
            .await?
            .filter(|record| record.csl == csl)
            .ok_or_else(|| LifecycleError::NotFound(csl.to_string()))?;

        if !record.status.can_transition_to(status) {
            return Err(LifecycleError::InvalidTransition {
                from: record.status,
                to: status,
            });
        }

        let change = StatusChange {
            from: record.status,
            to: status,
            actor_id,
            reason,
            at: self.clock.now(),
        };
        let updated = self
            .bounded(self.store.transition(&core, &change))
            .await
            .map_err(|err| match err {
                StoreError::Missing { .. } => LifecycleError::NotFound(csl.to_string()),
                other => other.into(),
            })?;

        info!(csl = %csl, from = %change.from, to = %change.to, actor_id, "changed certificate status");

        Ok(updated)
    }

    pub async fn stats(&self, year: u32) -> Result<YearStats, StoreError> {
        self.bounded(self.store.stats(year)).await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::{memory::MemoryStore, store::SequenceStore};

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()))
    }

    fn pepper(secret: &str) -> Pepper {
        Pepper::new(secret).unwrap()
    }

    async fn service_with(store: Arc<dyn CertificateStore>) -> CertificateService {
        store.register_course(1, "wd").await.unwrap();
        store.register_course(2, "DS").await.unwrap();

        CertificateService::new(
            store,
            pepper("p"),
            Vec::new(),
            clock(),
            Duration::from_millis(200),
            "https://certs.example.org",
        )
    }

    async fn service() -> CertificateService {
        service_with(MemoryStore::new()).await
    }

    /// Delegates to a [`MemoryStore`] but fails the first `failures` increments.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        failures: AtomicUsize,
        delay: Option<Duration>,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(failures),
                delay: None,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new(),
                failures: AtomicUsize::new(0),
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl SequenceStore for FlakyStore {
        async fn increment(&self, partition: &Partition) -> Result<u64, StoreError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                // the sequence is still consumed, as a real backend would after a lost commit
                self.inner.increment(partition).await?;
                return Err(StoreError::Conflict {
                    key: partition.to_string(),
                });
            }

            self.inner.increment(partition).await
        }
    }

    #[async_trait]
    impl CertificateStore for FlakyStore {
        async fn register_course(&self, course_id: u64, code: &str) -> Result<(), StoreError> {
            self.inner.register_course(course_id, code).await
        }

        async fn course_code(&self, course_id: u64) -> Result<Option<String>, StoreError> {
            self.inner.course_code(course_id).await
        }

        async fn active_certificate(
            &self,
            student_id: u64,
            course_id: u64,
        ) -> Result<Option<String>, StoreError> {
            self.inner.active_certificate(student_id, course_id).await
        }

        async fn insert_certificate(&self, record: &CertificateRecord) -> Result<(), StoreError> {
            self.inner.insert_certificate(record).await
        }

        async fn find_by_core(&self, core: &str) -> Result<Option<CertificateRecord>, StoreError> {
            self.inner.find_by_core(core).await
        }

        async fn transition(
            &self,
            core: &str,
            change: &StatusChange,
        ) -> Result<CertificateRecord, StoreError> {
            self.inner.transition(core, change).await
        }

        async fn stats(&self, year: u32) -> Result<YearStats, StoreError> {
            self.inner.stats(year).await
        }
    }

    #[tokio::test]
    async fn test_issue_then_verify() {
        let service = service().await;
        let issued = service.issue(42, 1, 7).await.unwrap();

        assert!(issued.csl.starts_with("2025-WD-0001-"));
        assert_eq!(issued.sequence, 1);
        assert_eq!(
            issued.verify_url,
            format!("https://certs.example.org/verify?csl={}", issued.csl)
        );

        let verdict = service.verify(&issued.csl).await.unwrap();
        assert!(verdict.valid);
        assert_eq!(verdict.reason, Reason::Valid);
    }

    #[tokio::test]
    async fn test_matches_codec_mint() {
        let service = service().await;
        let issued = service.issue(42, 1, 7).await.unwrap();

        assert_eq!(issued.csl, mint(2025, "wd", 1, 42, &pepper("p")).unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_rejected() {
        let service = service().await;
        service.issue(42, 1, 7).await.unwrap();

        let err = service.issue(42, 1, 7).await.unwrap_err();
        assert!(matches!(
            err,
            IssueError::Duplicate {
                student_id: 42,
                course_id: 1
            }
        ));

        // other course, other student are fine
        service.issue(42, 2, 7).await.unwrap();
        service.issue(43, 1, 7).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_course() {
        let service = service().await;

        assert!(matches!(
            service.issue(42, 99, 7).await,
            Err(IssueError::CourseNotFound(99))
        ));
    }

    #[tokio::test]
    async fn test_invalid_stored_course_code() {
        let service = service().await;
        service.store().register_course(5, "W1").await.unwrap();

        assert!(matches!(
            service.issue(42, 5, 7).await,
            Err(IssueError::InvalidInput(CodecError::InvalidCourseCode(_)))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_issue_unique_sequences() {
        let service = Arc::new(service().await);

        let handles: Vec<_> = (0..5)
            .map(|student_id| {
                let service = service.clone();
                tokio::spawn(async move { service.issue(student_id, 1, 7).await.unwrap() })
            })
            .collect();

        let mut sequences = HashSet::new();
        for handle in handles {
            let issued = handle.await.unwrap();
            assert!(sequences.insert(issued.sequence));
            assert!(service.verify(&issued.csl).await.unwrap().valid);
        }

        assert_eq!(sequences.len(), 5);
        assert_eq!(service.stats(2025).await.unwrap().total, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_student_single_winner() {
        let service = Arc::new(service().await);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.issue(42, 1, 7).await })
            })
            .collect();

        let mut issued = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => issued += 1,
                Err(IssueError::Duplicate { .. }) => {}
                Err(err) => panic!("unexpected error: {err}"),
            }
        }

        assert_eq!(issued, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once_with_fresh_sequence() {
        let service = service_with(FlakyStore::new(1)).await;
        let issued = service.issue(42, 1, 7).await.unwrap();

        // sequence 1 was burned by the failed attempt
        assert_eq!(issued.sequence, 2);
    }

    #[tokio::test]
    async fn test_second_failure_surfaces() {
        let service = service_with(FlakyStore::new(2)).await;

        assert!(matches!(
            service.issue(42, 1, 7).await,
            Err(IssueError::Allocation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let service = service_with(FlakyStore::slow(Duration::from_secs(5))).await;

        let err = service.issue(42, 1, 7).await.unwrap_err();
        assert!(matches!(
            err,
            IssueError::Allocation(AllocationError {
                source: StoreError::Timeout,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_partition_exhausted() {
        let service = service().await;
        let partition = Partition {
            year: 2025,
            course_code: "WD".to_string(),
        };
        for _ in 0..MAX_SEQUENCE {
            service.store().increment(&partition).await.unwrap();
        }

        assert!(matches!(
            service.issue(42, 1, 7).await,
            Err(IssueError::PartitionExhausted { year: 2025, .. })
        ));
    }

    #[tokio::test]
    async fn test_revoked_is_not_tampered() {
        let service = service().await;
        let issued = service.issue(42, 1, 7).await.unwrap();

        let record = service
            .set_status(&issued.csl, Status::Revoked, 1, Some("fraud".to_string()))
            .await
            .unwrap();
        assert_eq!(record.status, Status::Revoked);
        assert_eq!(record.status_changed_by, Some(1));
        assert_eq!(record.status_reason.as_deref(), Some("fraud"));

        let verdict = service.verify(&issued.csl).await.unwrap();
        assert!(!verdict.valid);
        assert_eq!(verdict.reason, Reason::Revoked);
    }

    #[tokio::test]
    async fn test_revocation_frees_slot() {
        let service = service().await;
        let first = service.issue(42, 1, 7).await.unwrap();
        service
            .set_status(&first.csl, Status::Revoked, 1, None)
            .await
            .unwrap();

        let second = service.issue(42, 1, 7).await.unwrap();
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn test_invalid_transition() {
        let service = service().await;
        let issued = service.issue(42, 1, 7).await.unwrap();
        service
            .set_status(&issued.csl, Status::Expired, 1, None)
            .await
            .unwrap();

        assert!(matches!(
            service.set_status(&issued.csl, Status::Active, 1, None).await,
            Err(LifecycleError::InvalidTransition {
                from: Status::Expired,
                to: Status::Active
            })
        ));
    }

    #[tokio::test]
    async fn test_suspend_and_reinstate() {
        let service = service().await;
        let issued = service.issue(42, 1, 7).await.unwrap();

        service
            .set_status(&issued.csl, Status::Suspended, 1, None)
            .await
            .unwrap();
        assert_eq!(
            service.verify(&issued.csl).await.unwrap().reason,
            Reason::Suspended
        );

        service
            .set_status(&issued.csl, Status::Active, 1, None)
            .await
            .unwrap();
        assert!(service.verify(&issued.csl).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_status_change_needs_exact_csl() {
        let service = service().await;
        let issued = service.issue(42, 1, 7).await.unwrap();
        let forged = format!("{}-ZZZZZZ", &issued.csl[..issued.csl.len() - 7]);

        assert!(matches!(
            service.set_status(&forged, Status::Revoked, 1, None).await,
            Err(LifecycleError::NotFound(_))
        ));
        assert!(matches!(
            service.set_status("garbage", Status::Revoked, 1, None).await,
            Err(LifecycleError::Malformed)
        ));
    }

    #[tokio::test]
    async fn test_verify_outcomes() {
        let service = service().await;
        let issued = service.issue(42, 1, 7).await.unwrap();
        let forged = format!("{}-ZZZZZZ", &issued.csl[..issued.csl.len() - 7]);

        assert_eq!(
            service.verify("2025-wd-0001-ABC123").await.unwrap().reason,
            Reason::Malformed
        );
        assert_eq!(
            service.verify("2025-WD-0099-ABC123").await.unwrap().reason,
            Reason::NotFound
        );
        assert_eq!(
            service.verify(&forged).await.unwrap().reason,
            Reason::Tampered
        );
    }

    #[tokio::test]
    async fn test_retired_pepper_verifies_old_certificates() {
        let store: Arc<dyn CertificateStore> = MemoryStore::new();
        let old = service_with(store.clone()).await;
        let issued = old.issue(42, 1, 7).await.unwrap();

        let rotated = CertificateService::new(
            store.clone(),
            pepper("p2"),
            vec![pepper("p")],
            clock(),
            Duration::from_millis(200),
            "https://certs.example.org",
        );
        assert!(rotated.verify(&issued.csl).await.unwrap().valid);

        let fresh = rotated.issue(43, 1, 7).await.unwrap();
        assert_ne!(fresh.csl, mint(2025, "WD", 2, 43, &pepper("p")).unwrap());
        assert_eq!(fresh.csl, mint(2025, "WD", 2, 43, &pepper("p2")).unwrap());

        let dropped = CertificateService::new(
            store,
            pepper("p2"),
            Vec::new(),
            clock(),
            Duration::from_millis(200),
            "https://certs.example.org",
        );
        assert_eq!(
            dropped.verify(&issued.csl).await.unwrap().reason,
            Reason::Tampered
        );
    }

    #[tokio::test]
    async fn test_stats_track_status() {
        let service = service().await;
        let first = service.issue(42, 1, 7).await.unwrap();
        service.issue(43, 1, 7).await.unwrap();
        service.issue(42, 2, 7).await.unwrap();
        service
            .set_status(&first.csl, Status::Revoked, 1, None)
            .await
            .unwrap();

        let stats = service.stats(2025).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_course.get("WD"), Some(&2));
        assert_eq!(stats.by_course.get("DS"), Some(&1));
        assert_eq!(stats.by_status.get(&Status::Active), Some(&2));
        assert_eq!(stats.by_status.get(&Status::Revoked), Some(&1));

        assert_eq!(service.stats(2024).await.unwrap().total, 0);
    }
}
