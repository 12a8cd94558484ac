use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::model::ChatPayload;
use crate::text::normalize;

/// Normalized lookup key for the result cache.
///
/// Two semantically identical requests from the same user hash to the same
/// fingerprint, so retries and repeat questions inside the TTL window replay
/// the stored answer. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(user_id: &str, text: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(normalize(user_id).as_bytes());
        // Unit separator keeps ("ab", "c") distinct from ("a", "bc").
        hasher.update(&[0x1f]);
        hasher.update(normalize(text).as_bytes());
        Fingerprint(hasher.finalize().to_hex().to_string())
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

/// Expiring map from fingerprint to completed answer.
///
/// Writes are unconditional last-writer-wins; moka handles per-shard locking
/// and evicts expired entries both lazily on read and in its background
/// maintenance, so no sweep task is needed here.
#[derive(Clone)]
pub struct ResultCache {
    inner: Cache<Fingerprint, Arc<ChatPayload>>,
}

impl ResultCache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<ChatPayload>> {
        self.inner.get(fingerprint).await
    }

    pub async fn put(&self, fingerprint: Fingerprint, payload: ChatPayload) {
        self.inner.insert(fingerprint, Arc::new(payload)).await;
    }
}
