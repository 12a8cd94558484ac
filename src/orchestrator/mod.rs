use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant as TokioInstant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::cache::{Fingerprint, ResultCache};
use crate::config::Config;
use crate::dedup::{Begin, InFlightGuard, InFlightRegistry};
use crate::error::ChatError;
use crate::extract::FeatureExtractor;
use crate::generate::{Chunk, GenerationPrompt, Generator};
use crate::generate::stats::UpstreamStats;
use crate::model::{ChatPayload, ChatRequest, PlaceRecord, StreamEvent};
use crate::resources::SharedResources;
use crate::text::{detect_language, normalize, Language};

/// Events are buffered so a cached answer (content + done) never blocks, and
/// a slow SSE consumer applies backpressure to generation instead of piling
/// up unbounded output.
const EVENT_CHANNEL_CAPACITY: usize = 64;

const FALLBACK_KEYWORD_LIMIT: usize = 5;

/// Result of submitting a request: either a live event stream (also used for
/// cache replays) or a duplicate rejection.
pub enum Submission {
    Stream(ReceiverStream<StreamEvent>),
    Rejected { request_id: String },
}

/// Static persona answering greetings without touching the upstream.
#[derive(Debug, Clone)]
pub struct CharacterProfile {
    pub name: String,
    pub greeting_th: String,
    pub greeting_en: String,
}

impl Default for CharacterProfile {
    fn default() -> Self {
        Self {
            name: "NongPlaToo".to_string(),
            greeting_th: "สวัสดีค่ะ! น้องปลาทูพร้อมช่วยแนะนำทริปในสมุทรสงครามให้เลยค่ะ".to_string(),
            greeting_en: "Hello! I'm Nong Pla Too, happy to help plan your Samut Songkhram adventures!"
                .to_string(),
        }
    }
}

impl CharacterProfile {
    fn greeting(&self, language: Language) -> &str {
        match language {
            Language::Th => &self.greeting_th,
            Language::En => &self.greeting_en,
        }
    }
}

const GREETINGS_TH: &[&str] = &["สวัสดี", "หวัดดี", "ดีจ้า"];
const GREETINGS_EN: &[&str] = &["hello", "hi", "hey", "greetings"];

fn is_greeting(text: &str) -> bool {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return false;
    }
    // Thai greetings carry no word boundaries; English ones must stand alone
    // so "hi" does not fire inside e.g. "chiang mai history".
    GREETINGS_TH.iter().any(|g| normalized.contains(g))
        || normalized
            .split_whitespace()
            .any(|token| GREETINGS_EN.contains(&token))
}

/// Top-level request state machine. One orchestrator is built at composition
/// time; each submission runs as its own task writing tagged events into a
/// bounded channel.
pub struct Orchestrator {
    cache: ResultCache,
    registry: Arc<InFlightRegistry>,
    resources: Arc<SharedResources>,
    extractor: FeatureExtractor,
    generator: Arc<dyn Generator>,
    stats: Arc<UpstreamStats>,
    heartbeat_interval: Duration,
    request_deadline: Duration,
    max_attachments: usize,
    character: CharacterProfile,
}

impl Orchestrator {
    pub fn new(
        config: &Config,
        resources: Arc<SharedResources>,
        generator: Arc<dyn Generator>,
        stats: Arc<UpstreamStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: ResultCache::new(config.result_cache_capacity, config.result_cache_ttl),
            registry: InFlightRegistry::new(config.inflight_reclaim_after),
            resources,
            extractor: FeatureExtractor::new(config.extract_timeout),
            generator,
            stats,
            heartbeat_interval: config.heartbeat_interval,
            request_deadline: config.request_deadline,
            max_attachments: config.max_attachments,
            character: CharacterProfile::default(),
        })
    }

    pub fn registry(&self) -> &Arc<InFlightRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<UpstreamStats> {
        &self.stats
    }

    /// Entry point for one submission. Resolves the cache fast path and the
    /// duplicate check synchronously; everything slower runs in a spawned
    /// task behind the returned stream.
    pub async fn submit(self: &Arc<Self>, request: ChatRequest) -> Submission {
        let language = detect_language(&request.text);
        let fingerprint = Fingerprint::of(&request.user_id, &request.text);

        if let Some(cached) = self.cache.get(&fingerprint).await {
            debug!(request_id = %request.request_id, "cache hit, replaying stored answer");
            return Submission::Stream(emit_payload(cached.as_ref(), true, &fingerprint));
        }

        if is_greeting(&request.text) {
            let payload = ChatPayload {
                response: self.character.greeting(language).to_string(),
                attachments: Vec::new(),
                language,
                source: "greeting".to_string(),
                created_at: Utc::now(),
            };
            self.cache.put(fingerprint.clone(), payload.clone()).await;
            return Submission::Stream(emit_payload(&payload, false, &fingerprint));
        }

        let guard = match self.registry.try_begin(&request.request_id) {
            Begin::Accepted(guard) => guard,
            Begin::Duplicate => {
                info!(request_id = %request.request_id, "duplicate submission rejected");
                return Submission::Rejected {
                    request_id: request.request_id,
                };
            }
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator
                .run_pipeline(guard, tx, request, fingerprint, language)
                .await;
        });
        Submission::Stream(ReceiverStream::new(rx))
    }

    /// Non-streaming variant sharing the whole pipeline. The request id is
    /// derived from the fingerprint, so identical concurrent queries hit the
    /// same dedup slot.
    pub async fn query(self: &Arc<Self>, message: &str, user_id: &str) -> Result<ChatPayload, ChatError> {
        let fingerprint = Fingerprint::of(user_id, message);
        let request_id = format!("query-{}", fingerprint.as_hex());
        let request = ChatRequest {
            text: message.to_string(),
            user_id: user_id.to_string(),
            request_id: request_id.clone(),
        };

        let mut events = match self.submit(request).await {
            Submission::Stream(events) => events,
            Submission::Rejected { request_id } => {
                return Err(ChatError::DuplicateRequest(request_id))
            }
        };

        let mut response = String::new();
        let mut attachments = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Heartbeat => {}
                StreamEvent::Content { text, attachments: more } => {
                    response.push_str(&text);
                    attachments.extend(more);
                }
                StreamEvent::Done { language, source, .. } => {
                    return Ok(ChatPayload {
                        response,
                        attachments,
                        language,
                        source,
                        created_at: Utc::now(),
                    });
                }
                StreamEvent::Error { kind, message } => {
                    // Reconstruct the error class so the HTTP mapping is the
                    // same as if the pipeline had run inline.
                    return Err(if kind == "deadline_exceeded" {
                        ChatError::DeadlineExceeded(self.request_deadline)
                    } else {
                        ChatError::UpstreamGeneration(format!("{kind}: {message}"))
                    });
                }
                StreamEvent::Rejected { .. } => {
                    return Err(ChatError::DuplicateRequest(request_id.clone()));
                }
            }
        }
        Err(ChatError::UpstreamGeneration(
            "stream ended without a terminal event".to_string(),
        ))
    }

    /// EXTRACT_FEATURES → GENERATE → STREAM → FINALIZE, bounded by the hard
    /// deadline. The in-flight guard is dropped on every path out of here.
    async fn run_pipeline(
        self: Arc<Self>,
        guard: InFlightGuard,
        tx: mpsc::Sender<StreamEvent>,
        request: ChatRequest,
        fingerprint: Fingerprint,
        language: Language,
    ) {
        let _guard = guard;
        let outcome = timeout(
            self.request_deadline,
            self.drive(&tx, &request, &fingerprint, language),
        )
        .await;

        let error = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(error)) => error,
            Err(_) => ChatError::DeadlineExceeded(self.request_deadline),
        };
        warn!(request_id = %request.request_id, %error, "request terminated with error");
        // Receiver may already be gone; partial output is never retracted.
        let _ = tx
            .send(StreamEvent::Error {
                kind: error.kind().to_string(),
                message: error.to_string(),
            })
            .await;
    }

    async fn drive(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        request: &ChatRequest,
        fingerprint: &Fingerprint,
        language: Language,
    ) -> Result<(), ChatError> {
        let matcher = self.resources.matcher().await?;
        let snapshot = self.resources.dataset().await?;

        let features = self
            .extractor
            .analyze(&request.text, Arc::clone(&snapshot), matcher)
            .await;
        if features.is_degraded() {
            debug!(request_id = %request.request_id, "feature extraction degraded");
        }
        let mut keywords = features.keywords.unwrap_or_default();
        let matches = features.matches.unwrap_or_default();
        if keywords.is_empty() && matches.is_empty() {
            keywords = snapshot.scan_keywords(&request.text, FALLBACK_KEYWORD_LIMIT);
        }

        let attachments: Vec<PlaceRecord> = matches
            .into_iter()
            .take(self.max_attachments)
            .map(|m| m.record)
            .collect();
        if !attachments.is_empty()
            && !send(tx, StreamEvent::attachments(attachments.clone())).await
        {
            return Ok(());
        }

        let prompt = GenerationPrompt::new(&request.text, language, keywords, &attachments);
        let started = Instant::now();
        let mut chunks = match self.generator.generate(&prompt).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.stats.record_failure();
                return Err(ChatError::UpstreamGeneration(e.to_string()));
            }
        };

        let mut full_text = String::new();
        let mut ticker = interval_at(
            TokioInstant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                chunk = chunks.next() => match chunk {
                    Some(Ok(Chunk::Delta(text))) => {
                        full_text.push_str(&text);
                        if !send(tx, StreamEvent::content(text)).await {
                            // Client went away mid-stream; release and stop.
                            return Ok(());
                        }
                        ticker.reset();
                    }
                    Some(Ok(Chunk::Done)) => break,
                    Some(Err(e)) => {
                        self.stats.record_failure();
                        return Err(ChatError::UpstreamGeneration(e.to_string()));
                    }
                    None => {
                        self.stats.record_failure();
                        return Err(ChatError::UpstreamGeneration(
                            "upstream closed without done marker".to_string(),
                        ));
                    }
                },
                _ = ticker.tick() => {
                    if !send(tx, StreamEvent::Heartbeat).await {
                        return Ok(());
                    }
                }
            }
        }
        self.stats.record_success(started.elapsed());

        let payload = ChatPayload {
            response: full_text,
            attachments,
            language,
            source: "data+ai".to_string(),
            created_at: Utc::now(),
        };
        self.cache.put(fingerprint.clone(), payload).await;
        send(
            tx,
            StreamEvent::Done {
                result_id: result_id(fingerprint),
                language,
                source: "data+ai".to_string(),
            },
        )
        .await;
        Ok(())
    }
}

async fn send(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Replays a completed payload as a two-event stream. The cached flag adds a
/// "_cached" source suffix so clients can tell the fast path apart; content
/// is byte-identical to a fresh generation.
fn emit_payload(
    payload: &ChatPayload,
    cached: bool,
    fingerprint: &Fingerprint,
) -> ReceiverStream<StreamEvent> {
    let source = if cached {
        format!("{}_cached", payload.source)
    } else {
        payload.source.clone()
    };
    let (tx, rx) = mpsc::channel(2);
    // Capacity 2, so these sends never block.
    let _ = tx.try_send(StreamEvent::Content {
        text: payload.response.clone(),
        attachments: payload.attachments.clone(),
    });
    let _ = tx.try_send(StreamEvent::Done {
        result_id: result_id(fingerprint),
        language: payload.language,
        source,
    });
    ReceiverStream::new(rx)
}

/// Opaque id correlating an answer with later feedback. Mixes the
/// fingerprint with the emission time, so every emission gets a fresh id,
/// cached replays included.
fn result_id(fingerprint: &Fingerprint) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(fingerprint.as_hex().as_bytes());
    hasher.update(&Utc::now().timestamp_subsec_nanos().to_le_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests;
