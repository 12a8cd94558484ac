use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text::Language;

/// One chat submission from the client.
///
/// `request_id` identifies the logical attempt: transport-level retries of the
/// same attempt must reuse it, which is what makes deduplication possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    pub user_id: String,
    pub request_id: String,
}

/// Non-streaming query body (no request id; one is derived from the
/// fingerprint so identical concurrent queries still deduplicate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub message: String,
    #[serde(default = "default_user")]
    pub user_id: String,
}

fn default_user() -> String {
    "default".to_string()
}

/// A place row as served to clients, already trimmed of storage concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_th: Option<String>,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<String>,
    pub description: String,
}

/// A candidate record with the matcher's relevance score attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedMatch {
    pub record: PlaceRecord,
    pub score: f64,
}

/// The complete answer for one request, as stored in the result cache and
/// returned by the non-streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub response: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<PlaceRecord>,
    pub language: Language,
    /// Provenance tag: "greeting", "data+ai", etc. Cached replays get a
    /// "_cached" suffix so clients can tell latency classes apart.
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// One event on the streamed boundary.
///
/// A tagged enum rather than an ad hoc `"type"` field so consumer dispatch is
/// exhaustive. Heartbeats carry no payload and must never be rendered as
/// content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Heartbeat,
    Content {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<PlaceRecord>,
    },
    Done {
        /// Opaque id correlating this answer with later feedback.
        result_id: String,
        language: Language,
        source: String,
    },
    Error {
        kind: String,
        message: String,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::Content {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn attachments(attachments: Vec<PlaceRecord>) -> Self {
        StreamEvent::Content {
            text: String::new(),
            attachments,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(StreamEvent::Heartbeat).unwrap();
        assert_eq!(json, serde_json::json!({"type": "heartbeat"}));

        let json = serde_json::to_value(StreamEvent::content("hello")).unwrap();
        assert_eq!(json["type"], "content");
        assert_eq!(json["text"], "hello");
        assert!(json.get("attachments").is_none());

        let json = serde_json::to_value(StreamEvent::Rejected {
            reason: RejectReason::Duplicate,
        })
        .unwrap();
        assert_eq!(json["reason"], "duplicate");
    }

    #[test]
    fn empty_content_fields_are_omitted() {
        let json = serde_json::to_string(&StreamEvent::attachments(vec![])).unwrap();
        assert_eq!(json, r#"{"type":"content"}"#);
    }
}
