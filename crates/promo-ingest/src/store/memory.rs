//! In-process membership store: a Bloom filter plus an exact set per key.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bloom::{BloomFilter, ASMS};
use tokio::sync::Mutex;
use tracing::debug;

use super::MembershipStore;
use crate::error::StoreError;

const DEFAULT_EXPECTED_ITEMS: u32 = 1_000_000;
const FALSE_POSITIVE_RATE: f32 = 0.01;

struct Inner {
    filters: HashMap<String, BloomFilter>,
    sets: HashMap<String, HashSet<String>>,
}

/// Membership store held in memory. Used for dry runs and tests.
pub struct MemoryMembershipStore {
    inner: Mutex<Inner>,
    expected_items: u32,
}

impl MemoryMembershipStore {
    /// Store sized for one million codes per filter.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EXPECTED_ITEMS)
    }

    /// Size each filter for `expected_items` at a 1% false positive rate.
    pub fn with_capacity(expected_items: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                filters: HashMap::new(),
                sets: HashMap::new(),
            }),
            expected_items: expected_items.max(1),
        }
    }

    /// Snapshot of the exact set stored under `key`.
    pub async fn members(&self, key: &str) -> HashSet<String> {
        let inner = self.inner.lock().await;
        inner.sets.get(key).cloned().unwrap_or_default()
    }

    /// Number of codes in the exact set under `key`.
    pub async fn set_len(&self, key: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.sets.get(key).map_or(0, HashSet::len)
    }
}

impl Default for MemoryMembershipStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipStore for MemoryMembershipStore {
    async fn filter_add_many(&self, key: &str, codes: &[String]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let expected = self.expected_items;
        let filter = inner
            .filters
            .entry(key.to_string())
            .or_insert_with(|| BloomFilter::with_rate(FALSE_POSITIVE_RATE, expected));

        let added = codes.iter().filter(|code| filter.insert(*code)).count();
        debug!(key, added, total = codes.len(), "filter add");
        Ok(added)
    }

    async fn set_add_many(&self, key: &str, codes: &[String]) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let set = inner.sets.entry(key.to_string()).or_default();
        let added = codes.iter().filter(|code| set.insert((*code).clone())).count();
        debug!(key, added, total = codes.len(), "set add");
        Ok(added)
    }

    async fn filter_contains(&self, key: &str, code: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .filters
            .get(key)
            .is_some_and(|filter| filter.contains(&code.to_string())))
    }

    async fn set_contains(&self, key: &str, code: &str) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.sets.get(key).is_some_and(|set| set.contains(code)))
    }
}
