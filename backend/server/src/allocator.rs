//! Sequence numbers per (year, course code) partition.
//!
//! A thin wrapper over [`SequenceStore::increment`]: no retries, no local batching, no
//! business rules. Whatever it returns has never been returned before for that partition.
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::store::{Partition, SequenceStore, StoreError};

#[derive(Error, Debug)]
#[error("Sequence allocation failed for {partition}: {source}")]
pub struct AllocationError {
    pub partition: String,
    #[source]
    pub source: StoreError,
}

pub struct SequenceAllocator<S: SequenceStore + ?Sized> {
    store: Arc<S>,
}

impl<S: SequenceStore + ?Sized> SequenceAllocator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn next_sequence(&self, partition: &Partition) -> Result<u64, AllocationError> {
        let sequence = self
            .store
            .increment(partition)
            .await
            .map_err(|source| AllocationError {
                partition: partition.to_string(),
                source,
            })?;

        debug!(partition = %partition, sequence, "allocated sequence");

        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;

    use super::*;
    use crate::memory::MemoryStore;

    struct Unreachable;

    #[async_trait]
    impl SequenceStore for Unreachable {
        async fn increment(&self, partition: &Partition) -> Result<u64, StoreError> {
            Err(StoreError::Conflict {
                key: partition.to_string(),
            })
        }
    }

    fn partition(code: &str) -> Partition {
        Partition {
            year: 2025,
            course_code: code.to_string(),
        }
    }

    #[tokio::test]
    async fn test_sequence_basic() {
        let allocator = SequenceAllocator::new(MemoryStore::new());

        assert_eq!(allocator.next_sequence(&partition("WD")).await.unwrap(), 1);
        assert_eq!(allocator.next_sequence(&partition("WD")).await.unwrap(), 2);
        assert_eq!(allocator.next_sequence(&partition("DS")).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sequence_concurrent() {
        let allocator = Arc::new(SequenceAllocator::new(MemoryStore::new()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move {
                    let mut ids = Vec::new();
                    for _ in 0..20 {
                        ids.push(allocator.next_sequence(&partition("WD")).await.unwrap());
                    }
                    ids
                })
            })
            .collect();

        let mut all_ids = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(all_ids.insert(id), "Duplicate ID: {id}");
            }
        }

        assert_eq!(all_ids.len(), 100);
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let allocator = SequenceAllocator::new(Arc::new(Unreachable));
        let err = allocator.next_sequence(&partition("WD")).await.unwrap_err();

        assert_eq!(err.partition, "2025:WD");
        assert!(err.source.is_transient());
    }
}
