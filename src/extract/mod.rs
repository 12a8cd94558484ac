use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::warn;

use crate::model::RankedMatch;
use crate::places::{DatasetSnapshot, Matcher};

/// Joined output of the two independent analyses. `None` means that analysis
/// failed or timed out; the request proceeds with the other signal.
#[derive(Debug, Default)]
pub struct Features {
    pub keywords: Option<Vec<String>>,
    pub matches: Option<Vec<RankedMatch>>,
}

impl Features {
    pub fn is_degraded(&self) -> bool {
        self.keywords.is_none() || self.matches.is_none()
    }
}

/// Runs keyword scanning and matcher scoring concurrently on a process-wide
/// bounded pool. One extractor is built at composition time and shared by all
/// requests; the pool is never grown per call.
pub struct FeatureExtractor {
    permits: Arc<Semaphore>,
    per_analysis_timeout: Duration,
    keyword_limit: usize,
}

const POOL_SIZE: usize = 2;
const KEYWORD_LIMIT: usize = 3;

impl FeatureExtractor {
    pub fn new(per_analysis_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(POOL_SIZE)),
            per_analysis_timeout,
            keyword_limit: KEYWORD_LIMIT,
        }
    }

    pub async fn analyze(
        &self,
        query: &str,
        snapshot: Arc<DatasetSnapshot>,
        matcher: Arc<dyn Matcher>,
    ) -> Features {
        let keyword_query = query.to_string();
        let keyword_snapshot = Arc::clone(&snapshot);
        let keyword_limit = self.keyword_limit;
        let keywords = self.run_analysis("keyword_scan", move || {
            keyword_snapshot.scan_keywords(&keyword_query, keyword_limit)
        });

        let match_query = query.to_string();
        let matches = self.run_analysis("matcher_score", move || {
            matcher.score(&match_query, &snapshot.records)
        });

        let (keywords, matches) = tokio::join!(keywords, matches);
        Features { keywords, matches }
    }

    /// One bounded, timed analysis. Every failure mode (pool starvation,
    /// timeout, panic inside the analysis) degrades to `None`.
    async fn run_analysis<R, F>(&self, label: &'static str, analysis: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let budget = self.per_analysis_timeout;

        let run = async move {
            let permit = permits.acquire_owned().await.ok()?;
            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                analysis()
            });
            match handle.await {
                Ok(result) => Some(result),
                Err(join_err) => {
                    warn!(analysis = label, error = %join_err, "analysis panicked");
                    None
                }
            }
        };

        match timeout(budget, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(analysis = label, ?budget, "analysis timed out");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlaceRecord;
    use crate::places::{default_seed, KeywordMatcher};

    struct PanickyMatcher;

    impl Matcher for PanickyMatcher {
        fn score(&self, _query: &str, _candidates: &[PlaceRecord]) -> Vec<RankedMatch> {
            panic!("matcher exploded")
        }
    }

    struct SlowMatcher;

    impl Matcher for SlowMatcher {
        fn score(&self, _query: &str, _candidates: &[PlaceRecord]) -> Vec<RankedMatch> {
            std::thread::sleep(Duration::from_millis(200));
            Vec::new()
        }
    }

    fn snapshot() -> Arc<DatasetSnapshot> {
        Arc::new(DatasetSnapshot::from_records(default_seed()))
    }

    #[tokio::test]
    async fn both_signals_populated_on_success() {
        let extractor = FeatureExtractor::new(Duration::from_secs(3));
        let features = extractor
            .analyze(
                "amphawa floating market",
                snapshot(),
                Arc::new(KeywordMatcher::build()),
            )
            .await;

        assert!(!features.is_degraded());
        assert!(!features.keywords.unwrap().is_empty());
        assert!(!features.matches.unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_matcher_degrades_only_its_signal() {
        let extractor = FeatureExtractor::new(Duration::from_secs(3));
        let features = extractor
            .analyze("amphawa floating market", snapshot(), Arc::new(PanickyMatcher))
            .await;

        assert!(features.matches.is_none());
        let keywords = features.keywords.expect("keyword scan must survive");
        assert!(!keywords.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_matcher_times_out_without_blocking_keywords() {
        let extractor = FeatureExtractor::new(Duration::from_millis(50));
        let features = extractor
            .analyze("amphawa floating market", snapshot(), Arc::new(SlowMatcher))
            .await;

        assert!(features.matches.is_none());
        assert!(features.keywords.is_some());
    }
}
