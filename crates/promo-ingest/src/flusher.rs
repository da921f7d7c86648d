//! Writes confirmed batches to the membership store: filter first, then the exact set.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::{FlushStage, IngestError, Result};
use crate::store::MembershipStore;

/// What one flush did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Codes in the batch
    pub codes: usize,
    /// Codes newly added to the filter
    pub filter_added: usize,
    /// The filter add reported an already-present item (ignored)
    pub filter_duplicate: bool,
    /// Codes newly added to the exact set
    pub set_added: usize,
}

/// Batch writer bound to one filter key and one set key.
pub struct Flusher<S: MembershipStore + ?Sized> {
    store: Arc<S>,
    filter_key: String,
    set_key: String,
}

impl<S: MembershipStore + ?Sized> Flusher<S> {
    /// Writer for `filter_key` and `set_key` on `store`.
    pub fn new(store: Arc<S>, filter_key: impl Into<String>, set_key: impl Into<String>) -> Self {
        Self {
            store,
            filter_key: filter_key.into(),
            set_key: set_key.into(),
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Write `batch` to both tiers.
    ///
    /// An "already exists" error on the filter is logged and skipped; any other
    /// filter error, and every exact-set error, fails the flush.
    #[instrument(skip(self, batch), fields(batch = batch.len()))]
    pub async fn flush(&self, batch: &[String]) -> Result<FlushOutcome> {
        let mut outcome = FlushOutcome {
            codes: batch.len(),
            ..FlushOutcome::default()
        };
        if batch.is_empty() {
            return Ok(outcome);
        }

        match self.store.filter_add_many(&self.filter_key, batch).await {
            Ok(added) => outcome.filter_added = added,
            Err(e) if e.is_benign() => {
                warn!(key = %self.filter_key, "filter reported existing items, continuing");
                outcome.filter_duplicate = true;
            }
            Err(source) => {
                return Err(IngestError::Flush {
                    stage: FlushStage::Filter,
                    source,
                })
            }
        }

        outcome.set_added = self
            .store
            .set_add_many(&self.set_key, batch)
            .await
            .map_err(|source| IngestError::Flush {
                stage: FlushStage::ExactSet,
                source,
            })?;

        debug!(
            filter_added = outcome.filter_added,
            set_added = outcome.set_added,
            "batch flushed"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryMembershipStore;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    /// Store wrapper that injects errors into either tier and records calls.
    pub(crate) struct FaultyStore {
        pub inner: MemoryMembershipStore,
        pub filter_error: Option<StoreError>,
        pub set_error: Option<StoreError>,
        pub calls: Mutex<Vec<&'static str>>,
        pub batches: Mutex<Vec<Vec<String>>>,
    }

    impl FaultyStore {
        pub(crate) fn new(filter_error: Option<StoreError>, set_error: Option<StoreError>) -> Self {
            Self {
                inner: MemoryMembershipStore::new(),
                filter_error,
                set_error,
                calls: Mutex::new(Vec::new()),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MembershipStore for FaultyStore {
        async fn filter_add_many(&self, key: &str, codes: &[String]) -> std::result::Result<usize, StoreError> {
            self.calls.lock().await.push("filter");
            self.inner.filter_add_many(key, codes).await?;
            match &self.filter_error {
                Some(e) => Err(e.clone()),
                None => Ok(codes.len()),
            }
        }

        async fn set_add_many(&self, key: &str, codes: &[String]) -> std::result::Result<usize, StoreError> {
            self.calls.lock().await.push("set");
            if let Some(e) = &self.set_error {
                return Err(e.clone());
            }
            self.batches.lock().await.push(codes.to_vec());
            self.inner.set_add_many(key, codes).await
        }

        async fn filter_contains(&self, key: &str, code: &str) -> std::result::Result<bool, StoreError> {
            self.inner.filter_contains(key, code).await
        }

        async fn set_contains(&self, key: &str, code: &str) -> std::result::Result<bool, StoreError> {
            self.inner.set_contains(key, code).await
        }
    }

    fn batch() -> Vec<String> {
        vec!["ABCD1234".to_string(), "YYYY0000".to_string()]
    }

    #[tokio::test]
    async fn test_flush_writes_both_tiers() {
        let store = Arc::new(MemoryMembershipStore::new());
        let flusher = Flusher::new(store.clone(), "bf", "set");
        let outcome = flusher.flush(&batch()).await.unwrap();
        assert_eq!(outcome.codes, 2);
        assert_eq!(outcome.filter_added, 2);
        assert_eq!(outcome.set_added, 2);
        assert!(store.filter_contains("bf", "ABCD1234").await.unwrap());
        assert!(store.set_contains("set", "YYYY0000").await.unwrap());
    }

    #[tokio::test]
    async fn test_benign_filter_error_still_adds_to_set() {
        let store = Arc::new(FaultyStore::new(Some(StoreError::AlreadyExists), None));
        let flusher = Flusher::new(store.clone(), "bf", "set");
        let outcome = flusher.flush(&batch()).await.unwrap();
        assert!(outcome.filter_duplicate);
        assert_eq!(outcome.set_added, 2);
        assert_eq!(*store.calls.lock().await, vec!["filter", "set"]);
        assert_eq!(store.inner.set_len("set").await, 2);
    }

    #[tokio::test]
    async fn test_fatal_filter_error_aborts() {
        let store = Arc::new(FaultyStore::new(Some(StoreError::Backend("OOM".into())), None));
        let flusher = Flusher::new(store.clone(), "bf", "set");
        let err = flusher.flush(&batch()).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Flush {
                stage: FlushStage::Filter,
                ..
            }
        ));
        assert_eq!(*store.calls.lock().await, vec!["filter"]);
    }

    #[tokio::test]
    async fn test_set_error_is_fatal() {
        let store = Arc::new(FaultyStore::new(None, Some(StoreError::AlreadyExists)));
        let flusher = Flusher::new(store, "bf", "set");
        let err = flusher.flush(&batch()).await.unwrap_err();
        assert!(matches!(
            err,
            IngestError::Flush {
                stage: FlushStage::ExactSet,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let store = Arc::new(FaultyStore::new(None, None));
        let flusher = Flusher::new(store.clone(), "bf", "set");
        let outcome = flusher.flush(&[]).await.unwrap();
        assert_eq!(outcome, FlushOutcome::default());
        assert!(store.calls.lock().await.is_empty());
    }
}
