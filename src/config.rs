use std::net::SocketAddr;
use std::time::Duration;

use tracing::warn;

/// Runtime tunables, loaded from `CHAT_EDGE_*` environment variables.
///
/// The cache TTL and heartbeat interval in the original deployment were
/// empirically chosen, so every interval here is overridable rather than
/// hard-coded.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the gateway binds to.
    pub bind_addr: SocketAddr,
    /// Endpoint of the text-generation upstream.
    pub upstream_endpoint: String,
    /// How long a completed answer is replayed for identical queries.
    pub result_cache_ttl: Duration,
    /// Max entries held by the result cache.
    pub result_cache_capacity: u64,
    /// Interval between keep-alive events while the upstream is quiet.
    pub heartbeat_interval: Duration,
    /// Hard ceiling on total request processing.
    pub request_deadline: Duration,
    /// Age past which an in-flight record is treated as abandoned.
    pub inflight_reclaim_after: Duration,
    /// Per-analysis timeout inside the feature extractor.
    pub extract_timeout: Duration,
    /// TTL of the dataset snapshot resource. The matcher itself never expires.
    pub dataset_ttl: Duration,
    /// Upper bound on structured attachments per response.
    pub max_attachments: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            upstream_endpoint: "http://localhost:3001/generate".to_string(),
            result_cache_ttl: Duration::from_secs(30),
            result_cache_capacity: 10_000,
            heartbeat_interval: Duration::from_secs(5),
            request_deadline: Duration::from_secs(90),
            inflight_reclaim_after: Duration::from_secs(300),
            extract_timeout: Duration::from_secs(3),
            dataset_ttl: Duration::from_secs(300),
            max_attachments: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("CHAT_EDGE_BIND_ADDR", defaults.bind_addr),
            upstream_endpoint: std::env::var("CHAT_EDGE_UPSTREAM_ENDPOINT")
                .unwrap_or(defaults.upstream_endpoint),
            result_cache_ttl: env_secs("CHAT_EDGE_CACHE_TTL_SECS", defaults.result_cache_ttl),
            result_cache_capacity: env_parse(
                "CHAT_EDGE_CACHE_CAPACITY",
                defaults.result_cache_capacity,
            ),
            heartbeat_interval: env_secs(
                "CHAT_EDGE_HEARTBEAT_SECS",
                defaults.heartbeat_interval,
            ),
            request_deadline: env_secs("CHAT_EDGE_DEADLINE_SECS", defaults.request_deadline),
            inflight_reclaim_after: env_secs(
                "CHAT_EDGE_RECLAIM_SECS",
                defaults.inflight_reclaim_after,
            ),
            extract_timeout: env_secs("CHAT_EDGE_EXTRACT_TIMEOUT_SECS", defaults.extract_timeout),
            dataset_ttl: env_secs("CHAT_EDGE_DATASET_TTL_SECS", defaults.dataset_ttl),
            max_attachments: env_parse("CHAT_EDGE_MAX_ATTACHMENTS", defaults.max_attachments),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("ignoring unparseable {name}={raw}");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}
