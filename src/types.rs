use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A webhook delivery captured by the ingest path.
///
/// The bridge treats the request body as opaque bytes; schema management is
/// the sender's and receiver's business. Everything needed to reproduce the
/// delivery downstream (body, headers, receive path) travels with the
/// message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Random 128-bit identifier, hex-encoded. Assigned once at ingest.
    pub id: String,

    /// HTTP path the webhook was received on.
    pub path: String,

    /// Logical destination: a Kafka topic, or a tag forwarded to the
    /// remote endpoint.
    pub queue: String,

    /// Original request body, verbatim.
    pub body: Vec<u8>,

    /// Request headers, one value per name. When a request supplied a
    /// header more than once only the first value is retained.
    pub headers: HashMap<String, String>,

    /// Instant the ingest path observed the request.
    pub timestamp: DateTime<Utc>,

    /// Delivery attempts already made.
    pub retries: u32,

    /// Lifecycle state.
    pub status: MessageStatus,

    /// Last transient error text, empty when none.
    pub error: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When set, the scheduler must not attempt this message before it.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a freshly ingested message: `pending`, zero retries, all
    /// timestamps now.
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        queue: impl Into<String>,
        body: impl Into<Vec<u8>>,
        headers: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            path: path.into(),
            queue: queue.into(),
            body: body.into(),
            headers,
            timestamp: now,
            retries: 0,
            status: MessageStatus::Pending,
            error: String::new(),
            created_at: now,
            updated_at: now,
            next_retry_at: None,
        }
    }
}

/// Lifecycle state of a stored message.
///
/// `Sent` and `Failed` are terminal: a message in either state is never
/// transmitted again. The scheduler deletes on success rather than marking
/// `Sent`; the variant exists for external writers and is honored by the
/// retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Retrying,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Retrying => "retrying",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MessageStatus::Pending),
            "retrying" => Some(MessageStatus::Retrying),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body returned to the webhook sender on a successful ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub message_id: String,
    pub status: String,
    pub timestamp: String,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub version: String,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub timestamp: String,
    pub routes: Vec<crate::config::RouteConfig>,
    pub server: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_message_is_pending_with_zero_retries() {
        let msg = Message::new("ab12", "/hook/a", "q1", b"{}".to_vec(), HashMap::new());
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retries, 0);
        assert!(msg.next_retry_at.is_none());
        assert!(msg.error.is_empty());
        assert_eq!(msg.created_at, msg.updated_at);
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Retrying,
            MessageStatus::Sent,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("bogus"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&MessageStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
    }
}
