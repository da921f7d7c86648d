//! Two-tier membership store: a probabilistic filter for fast negatives and an
//! exact set that is the source of truth.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use tracing::debug;

use crate::error::StoreError;

pub use self::memory::MemoryMembershipStore;
pub use self::redis::RedisMembershipStore;

/// Remote membership store used by the flusher and the checkout query.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Add every code to the filter `key`. Returns how many were newly added.
    ///
    /// May fail with [`StoreError::AlreadyExists`], which callers treat as benign.
    async fn filter_add_many(&self, key: &str, codes: &[String]) -> Result<usize, StoreError>;

    /// Add every code to the exact set `key`. Returns how many were newly added.
    async fn set_add_many(&self, key: &str, codes: &[String]) -> Result<usize, StoreError>;

    /// Filter lookup. False positives are possible, false negatives are not.
    async fn filter_contains(&self, key: &str, code: &str) -> Result<bool, StoreError>;

    /// Exact set lookup.
    async fn set_contains(&self, key: &str, code: &str) -> Result<bool, StoreError>;
}

/// Checkout-side query: is `code` usable?
///
/// The filter answers first. With `strict`, a filter hit is confirmed against the exact set.
pub async fn check_code<S: MembershipStore + ?Sized>(
    store: &S,
    filter_key: &str,
    set_key: &str,
    code: &str,
    strict: bool,
) -> Result<bool, StoreError> {
    if !store.filter_contains(filter_key, code).await? {
        return Ok(false);
    }
    if !strict {
        return Ok(true);
    }
    let exact = store.set_contains(set_key, code).await?;
    if !exact {
        debug!(code, "filter false positive");
    }
    Ok(exact)
}
