use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;
use tracing::info;

use crate::error::ChatError;
use crate::places::{DatasetSnapshot, Matcher, PlaceStore};

/// Process-wide cache of expensive-to-construct collaborators.
///
/// Entries are built lazily, exactly once even under concurrent first access
/// (moka serializes the init future per key), and are read-only afterwards. A
/// dataset-type entry carries a TTL and is rebuilt after expiry, never mutated
/// in place; passing no TTL makes the entry live for the process lifetime.
///
/// Factory failures are returned to every waiting caller and never cached, so
/// the next access retries construction.
pub struct SharedResourceCache<T: Send + Sync + 'static> {
    inner: Cache<String, ResourceEntry<T>>,
}

struct ResourceEntry<T> {
    value: Arc<T>,
    ttl: Option<Duration>,
}

impl<T> Clone for ResourceEntry<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            ttl: self.ttl,
        }
    }
}

struct PerEntryTtl;

impl<T> Expiry<String, ResourceEntry<T>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &ResourceEntry<T>,
        _created_at: Instant,
    ) -> Option<Duration> {
        entry.ttl
    }
}

impl<T: Send + Sync + 'static> SharedResourceCache<T> {
    pub fn new() -> Self {
        let inner = Cache::builder().expire_after(PerEntryTtl).build();
        Self { inner }
    }

    pub async fn get_or_create<F, Fut>(
        &self,
        name: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<Arc<T>, ChatError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let entry = self
            .inner
            .try_get_with(name.to_string(), async move {
                info!(resource = name, "constructing shared resource");
                let value = factory().await?;
                Ok::<_, anyhow::Error>(ResourceEntry {
                    value: Arc::new(value),
                    ttl,
                })
            })
            .await
            .map_err(|err: Arc<anyhow::Error>| ChatError::ResourceConstruction {
                name: name.to_string(),
                message: err.to_string(),
            })?;
        Ok(entry.value)
    }

    /// Drops the named entry so the next access rebuilds it.
    pub async fn invalidate(&self, name: &str) {
        self.inner.invalidate(&name.to_string()).await;
    }
}

impl<T: Send + Sync + 'static> Default for SharedResourceCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The two singletons every request shares: the matcher (permanent) and the
/// dataset snapshot (TTL, rebuilt from the store after expiry).
pub struct SharedResources {
    matchers: SharedResourceCache<Box<dyn Matcher>>,
    datasets: SharedResourceCache<DatasetSnapshot>,
    store: Arc<dyn PlaceStore>,
    matcher_factory: MatcherFactory,
    dataset_ttl: Duration,
}

type MatcherFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn Matcher>> + Send + Sync>;

impl SharedResources {
    pub fn new(
        store: Arc<dyn PlaceStore>,
        matcher_factory: MatcherFactory,
        dataset_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            matchers: SharedResourceCache::new(),
            datasets: SharedResourceCache::new(),
            store,
            matcher_factory,
            dataset_ttl,
        })
    }

    pub async fn matcher(&self) -> Result<Arc<Box<dyn Matcher>>, ChatError> {
        self.matchers
            .get_or_create("matcher", None, || async { (self.matcher_factory)() })
            .await
    }

    pub async fn dataset(&self) -> Result<Arc<DatasetSnapshot>, ChatError> {
        let store = Arc::clone(&self.store);
        self.datasets
            .get_or_create("dataset-snapshot", Some(self.dataset_ttl), move || async move {
                DatasetSnapshot::load(store.as_ref()).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_access_invokes_factory_once() {
        let cache = Arc::new(SharedResourceCache::<String>::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let builds = Arc::clone(&builds);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_create("matcher", None, || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok("expensive".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        for result in &results {
            assert!(Arc::ptr_eq(result, &results[0]));
        }
    }

    #[tokio::test]
    async fn factory_failure_is_not_cached() {
        let cache = SharedResourceCache::<String>::new();
        let attempts = AtomicUsize::new(0);

        let err = cache
            .get_or_create("dataset", None, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("db unreachable")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ResourceConstruction { .. }));

        let value = cache
            .get_or_create("dataset", None, || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok("recovered".to_string())
            })
            .await
            .unwrap();
        assert_eq!(*value, "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ttl_entries_are_rebuilt_after_expiry() {
        let cache = SharedResourceCache::<usize>::new();
        let builds = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_create("dataset", Some(Duration::from_millis(40)), || async {
                    Ok(builds.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let rebuilt = cache
            .get_or_create("dataset", Some(Duration::from_millis(40)), || async {
                Ok(builds.fetch_add(1, Ordering::SeqCst))
            })
            .await
            .unwrap();
        assert_eq!(*rebuilt, 1);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_entries_survive() {
        let cache = SharedResourceCache::<&'static str>::new();
        cache
            .get_or_create("matcher", None, || async { Ok("built") })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let again = cache
            .get_or_create("matcher", None, || async {
                Err(anyhow::anyhow!("must not rebuild a permanent resource"))
            })
            .await
            .unwrap();
        assert_eq!(*again, "built");
    }
}
