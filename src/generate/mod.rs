pub mod stats;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::PlaceRecord;
use crate::text::Language;

/// One unit of incremental upstream output. `Done` is the explicit
/// end-of-stream marker; a connection that closes without it is a protocol
/// error, not a normal completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Delta(String),
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, GenerateError>> + Send>>;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("upstream transport error: {0}")]
    Http(String),
    #[error("upstream provider error: {0}")]
    Provider(String),
    #[error("malformed upstream stream: {0}")]
    Protocol(String),
}

/// Everything the upstream needs to produce an answer. Built once per request
/// from the query and the extracted features.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationPrompt {
    pub query: String,
    pub language: Language,
    pub keywords: Vec<String>,
    pub context: Vec<String>,
}

impl GenerationPrompt {
    pub fn new(
        query: &str,
        language: Language,
        keywords: Vec<String>,
        attachments: &[PlaceRecord],
    ) -> Self {
        let context = attachments
            .iter()
            .map(|place| {
                let district = place.district.as_deref().unwrap_or("-");
                format!(
                    "{} ({}, {}): {}",
                    place.name, place.category, district, place.description
                )
            })
            .collect();
        Self {
            query: query.to_string(),
            language,
            keywords,
            context,
        }
    }
}

/// The black-box text-generation collaborator.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<ChunkStream, GenerateError>;
}

/// HTTP upstream speaking newline-delimited JSON:
/// `{"delta":"..."}` per chunk, `{"done":true}` as the terminator, and
/// `{"error":"..."}` for provider-side failures.
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<ChunkStream, GenerateError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(prompt)
            .send()
            .await
            .map_err(|e| GenerateError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GenerateError::Provider(format!("HTTP {}", resp.status())));
        }

        let body = resp.bytes_stream().map(|result| result.map(|bytes| bytes.to_vec()));
        let state = DecodeState {
            body: body.boxed(),
            decoder: LineDecoder::default(),
            finished: false,
        };
        let chunks = futures_util::stream::try_unfold(state, |mut state| async move {
            if state.finished {
                return Ok(None);
            }
            loop {
                if let Some(line) = state.decoder.next_line()? {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let chunk = parse_chunk(&line)?;
                    state.finished = matches!(chunk, Chunk::Done);
                    return Ok(Some((chunk, state)));
                }
                match state.body.next().await {
                    Some(Ok(bytes)) => state.decoder.push(&bytes),
                    Some(Err(e)) => return Err(GenerateError::Http(e.to_string())),
                    None => {
                        if let Some(line) = state.decoder.take_remainder()? {
                            let chunk = parse_chunk(&line)?;
                            state.finished = matches!(chunk, Chunk::Done);
                            return Ok(Some((chunk, state)));
                        }
                        return Err(GenerateError::Protocol(
                            "stream closed without done marker".to_string(),
                        ));
                    }
                }
            }
        });
        Ok(Box::pin(chunks))
    }
}

struct DecodeState {
    body: Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>,
    decoder: LineDecoder,
    finished: bool,
}

/// Splits a byte stream into UTF-8 lines across arbitrary chunk boundaries.
#[derive(Default)]
struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn next_line(&mut self) -> Result<Option<String>, GenerateError> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        String::from_utf8(line.to_vec())
            .map(Some)
            .map_err(|e| GenerateError::Protocol(e.to_string()))
    }

    fn take_remainder(&mut self) -> Result<Option<String>, GenerateError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let rest = std::mem::take(&mut self.buf);
        let rest = String::from_utf8(rest).map_err(|e| GenerateError::Protocol(e.to_string()))?;
        if rest.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(rest))
        }
    }
}

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_chunk(line: &str) -> Result<Chunk, GenerateError> {
    let wire: WireChunk =
        serde_json::from_str(line).map_err(|e| GenerateError::Protocol(e.to_string()))?;
    if let Some(message) = wire.error {
        return Err(GenerateError::Provider(message));
    }
    if wire.done.unwrap_or(false) {
        return Ok(Chunk::Done);
    }
    match wire.delta {
        Some(text) => Ok(Chunk::Delta(text)),
        None => Err(GenerateError::Protocol(format!(
            "chunk carries neither delta nor done: {line}"
        ))),
    }
}
