use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::*;
use crate::generate::{Chunk, ChunkStream, GenerateError};
use crate::places::{KeywordMatcher, Matcher, SeedPlaceStore};

struct ScriptedGenerator {
    deltas: Vec<&'static str>,
    first_chunk_delay: Duration,
    fail_after: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedGenerator {
    fn answering(deltas: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            deltas,
            first_chunk_delay: Duration::ZERO,
            fail_after: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(deltas: Vec<&'static str>, first_chunk_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            deltas,
            first_chunk_delay,
            fail_after: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing_after(deltas: Vec<&'static str>, fail_after: usize) -> Arc<Self> {
        Arc::new(Self {
            deltas,
            first_chunk_delay: Duration::ZERO,
            fail_after: Some(fail_after),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, _prompt: &GenerationPrompt) -> Result<ChunkStream, GenerateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let mut items: Vec<Result<Chunk, GenerateError>> = Vec::new();
        for (i, delta) in self.deltas.iter().enumerate() {
            if self.fail_after == Some(i) {
                break;
            }
            items.push(Ok(Chunk::Delta(delta.to_string())));
        }
        if self.fail_after.is_some() {
            items.push(Err(GenerateError::Provider("scripted failure".to_string())));
        } else {
            items.push(Ok(Chunk::Done));
        }

        let delay = self.first_chunk_delay;
        let stream = futures_util::stream::iter(items.into_iter().enumerate()).then(
            move |(i, chunk)| async move {
                if i == 0 {
                    tokio::time::sleep(delay).await;
                }
                chunk
            },
        );
        Ok(Box::pin(stream))
    }
}

/// Holds the stream open until the test says otherwise.
struct GatedGenerator {
    release: Arc<Notify>,
    calls: AtomicUsize,
}

impl GatedGenerator {
    fn new() -> (Arc<Self>, Arc<Notify>) {
        let release = Arc::new(Notify::new());
        (
            Arc::new(Self {
                release: Arc::clone(&release),
                calls: AtomicUsize::new(0),
            }),
            release,
        )
    }
}

#[async_trait]
impl Generator for GatedGenerator {
    async fn generate(&self, _prompt: &GenerationPrompt) -> Result<ChunkStream, GenerateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let release = Arc::clone(&self.release);
        let gated = futures_util::stream::once(async move {
            release.notified().await;
            Ok(Chunk::Delta("held answer".to_string()))
        })
        .chain(futures_util::stream::iter(vec![Ok(Chunk::Done)]));
        Ok(Box::pin(gated))
    }
}

fn test_config() -> Config {
    Config {
        heartbeat_interval: Duration::from_millis(50),
        request_deadline: Duration::from_secs(5),
        extract_timeout: Duration::from_millis(500),
        ..Config::default()
    }
}

fn build(generator: Arc<dyn Generator>, config: &Config) -> Arc<Orchestrator> {
    let store = Arc::new(SeedPlaceStore::with_default_seed());
    let resources = SharedResources::new(
        store,
        Box::new(|| Ok(Box::new(KeywordMatcher::build()) as Box<dyn Matcher>)),
        Duration::from_secs(300),
    );
    Orchestrator::new(config, resources, generator, Arc::new(UpstreamStats::new()))
}

fn request(request_id: &str, text: &str) -> ChatRequest {
    ChatRequest {
        text: text.to_string(),
        user_id: "u1".to_string(),
        request_id: request_id.to_string(),
    }
}

async fn collect(submission: Submission) -> Vec<StreamEvent> {
    match submission {
        Submission::Stream(events) => events.collect().await,
        Submission::Rejected { .. } => panic!("expected a stream, got rejection"),
    }
}

fn joined_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn generates_streams_and_caches() {
    let generator = ScriptedGenerator::answering(vec!["Wat ", "Bang Kung"]);
    let orchestrator = build(generator.clone(), &test_config());

    let events = collect(orchestrator.submit(request("r1", "temple")).await).await;
    assert_eq!(joined_text(&events), "Wat Bang Kung");
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::Content { attachments, .. } if !attachments.is_empty())));
    match events.last().unwrap() {
        StreamEvent::Done { source, .. } => assert_eq!(source, "data+ai"),
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(orchestrator.registry().in_flight(), 0);
    assert_eq!(generator.calls(), 1);

    // Same user and text with a fresh request id inside the TTL window:
    // replayed from cache, upstream untouched.
    let events = collect(orchestrator.submit(request("r2", "temple")).await).await;
    assert_eq!(joined_text(&events), "Wat Bang Kung");
    match events.last().unwrap() {
        StreamEvent::Done { source, .. } => assert_eq!(source, "data+ai_cached"),
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn duplicate_submission_is_rejected_while_first_runs() {
    let (generator, release) = GatedGenerator::new();
    let orchestrator = build(generator.clone(), &test_config());

    let first = orchestrator.submit(request("r1", "temple")).await;
    let first_stream = match first {
        Submission::Stream(stream) => stream,
        Submission::Rejected { .. } => panic!("first submission must be accepted"),
    };

    // Retry of the same logical attempt while the original is in flight.
    match orchestrator.submit(request("r1", "temple")).await {
        Submission::Rejected { request_id } => assert_eq!(request_id, "r1"),
        Submission::Stream(_) => panic!("duplicate must be rejected"),
    }

    release.notify_one();
    let events: Vec<StreamEvent> = first_stream.collect().await;
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    assert_eq!(orchestrator.registry().in_flight(), 0);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn heartbeats_precede_slow_first_token() {
    let generator = ScriptedGenerator::slow(vec!["late answer"], Duration::from_millis(180));
    let mut config = test_config();
    config.heartbeat_interval = Duration::from_millis(50);
    let orchestrator = build(generator, &config);

    let events = collect(orchestrator.submit(request("r1", "temple")).await).await;

    let first_heartbeat = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Heartbeat));
    let first_text = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Content { text, .. } if !text.is_empty()));
    match (first_heartbeat, first_text) {
        (Some(hb), Some(text)) => assert!(hb < text, "heartbeat must precede first content"),
        other => panic!("expected both heartbeat and content, got {other:?}"),
    }
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test]
async fn upstream_failure_keeps_partial_output_and_releases() {
    let generator = ScriptedGenerator::failing_after(vec!["partial "], 1);
    let orchestrator = build(generator, &test_config());

    let events = collect(orchestrator.submit(request("r1", "temple")).await).await;
    assert_eq!(joined_text(&events), "partial ");
    match events.last().unwrap() {
        StreamEvent::Error { kind, .. } => assert_eq!(kind, "upstream_generation"),
        other => panic!("expected error, got {other:?}"),
    }

    assert_eq!(orchestrator.registry().in_flight(), 0);
    assert_eq!(orchestrator.stats().snapshot().error_count, 1);

    // The failed run was not cached; the id is begin-able again.
    match orchestrator.submit(request("r1", "temple")).await {
        Submission::Stream(_) => {}
        Submission::Rejected { .. } => panic!("request id must be released after error"),
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_forces_error_and_release() {
    let generator = ScriptedGenerator::slow(vec!["too late"], Duration::from_secs(60));
    let mut config = test_config();
    config.request_deadline = Duration::from_millis(300);
    let orchestrator = build(generator, &config);

    let events = collect(orchestrator.submit(request("r1", "temple")).await).await;
    match events.last().unwrap() {
        StreamEvent::Error { kind, .. } => assert_eq!(kind, "deadline_exceeded"),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Heartbeat)));
    assert_eq!(orchestrator.registry().in_flight(), 0);
}

#[tokio::test]
async fn greeting_answered_without_upstream() {
    let generator = ScriptedGenerator::answering(vec!["unused"]);
    let orchestrator = build(generator.clone(), &test_config());

    let events = collect(orchestrator.submit(request("r1", "hello")).await).await;
    assert!(joined_text(&events).contains("Nong Pla Too"));
    match events.last().unwrap() {
        StreamEvent::Done { source, .. } => assert_eq!(source, "greeting"),
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(generator.calls(), 0);

    // "hi" must not fire inside ordinary words.
    let events = collect(orchestrator.submit(request("r2", "history of amphawa")).await).await;
    assert!(!matches!(events.last(), Some(StreamEvent::Done { source, .. }) if source == "greeting"));
}

#[tokio::test]
async fn client_disconnect_releases_inflight_record() {
    let (generator, release) = GatedGenerator::new();
    let orchestrator = build(generator, &test_config());

    let submission = orchestrator.submit(request("r1", "temple")).await;
    assert_eq!(orchestrator.registry().in_flight(), 1);
    drop(submission);
    release.notify_one();

    // The pipeline notices the closed channel on its next send.
    let mut released = false;
    for _ in 0..100 {
        if orchestrator.registry().in_flight() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "disconnect must release the in-flight record");
}

#[tokio::test(start_paused = true)]
async fn query_surfaces_deadline_as_deadline_error() {
    let generator = ScriptedGenerator::slow(vec!["too late"], Duration::from_secs(60));
    let mut config = test_config();
    config.request_deadline = Duration::from_millis(300);
    let orchestrator = build(generator, &config);

    let error = orchestrator.query("temple", "u1").await.unwrap_err();
    assert!(
        matches!(error, ChatError::DeadlineExceeded(_)),
        "expected deadline error, got {error}"
    );
}

#[tokio::test]
async fn query_collects_stream_and_replays_cache() {
    let generator = ScriptedGenerator::answering(vec!["Don ", "Hoi Lot"]);
    let orchestrator = build(generator.clone(), &test_config());

    let payload = orchestrator.query("razor clams nature", "u1").await.unwrap();
    assert_eq!(payload.response, "Don Hoi Lot");
    assert_eq!(payload.source, "data+ai");

    let cached = orchestrator.query("razor clams nature", "u1").await.unwrap();
    assert_eq!(cached.response, "Don Hoi Lot");
    assert_eq!(cached.source, "data+ai_cached");
    assert_eq!(generator.calls(), 1);
}
