use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::config::RemoteUrlConfig;
use crate::error::{BridgeError, Result};
use crate::sink::Sink;
use crate::types::Message;

/// Deadline for the HEAD health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote HTTP sink: forwards each message as a POST to one configured URL,
/// body verbatim, with the original webhook headers plus delivery metadata.
#[derive(Debug)]
pub struct HttpSink {
    client: reqwest::Client,
    config: RemoteUrlConfig,
}

impl HttpSink {
    pub fn new(config: &RemoteUrlConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|err| BridgeError::Http(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Merged header set: original request headers, delivery metadata, and
    /// a JSON content type unless the sender supplied one. Header names the
    /// HTTP layer cannot represent are dropped.
    fn delivery_headers(msg: &Message) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(msg.headers.len() + 5);

        for (key, value) in &msg.headers {
            match (
                HeaderName::try_from(key.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(header = %key, "skipping unrepresentable header"),
            }
        }

        let metadata = [
            ("x-webhook-id", msg.id.clone()),
            ("x-webhook-path", msg.path.clone()),
            ("x-webhook-queue", msg.queue.clone()),
            ("x-webhook-timestamp", msg.timestamp.to_rfc3339()),
        ];
        for (name, value) in metadata {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        headers
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn kind(&self) -> &'static str {
        "remote_url"
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let response = self
            .client
            .post(&self.config.url)
            .headers(Self::delivery_headers(msg))
            .body(msg.body.clone())
            .send()
            .await
            .map_err(|err| BridgeError::Http(format!("failed to send http request: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Http(format!(
                "http request failed with status {}: {body}",
                status.as_u16()
            )));
        }

        debug!(message_id = %msg.id, status = status.as_u16(), "message forwarded to remote url");
        Ok(())
    }

    async fn send_with_retry(&self, msg: &Message) -> Result<()> {
        let mut last_err = None;

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                let backoff = Duration::from_secs(u64::from(attempt) * u64::from(attempt));
                debug!(
                    message_id = %msg.id,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    "retrying http send"
                );
                tokio::time::sleep(backoff).await;
            }

            match self.send(msg).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(message_id = %msg.id, attempt = attempt + 1, error = %err, "http send failed");
                    last_err = Some(err);
                }
            }
        }

        let attempts = self.config.retries + 1;
        let last = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(BridgeError::Http(format!(
            "failed to send message after {attempts} attempts: {last}"
        )))
    }

    /// HEAD against the delivery URL. Only a 5xx (or no answer at all)
    /// counts as unhealthy: a 4xx still proves the endpoint is routable.
    async fn health_probe(&self) -> Result<()> {
        let response = self
            .client
            .head(&self.config.url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|err| BridgeError::Http(format!("health check failed: {err}")))?;

        if response.status().is_server_error() {
            return Err(BridgeError::Http(format!(
                "remote url returned server error: {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn message_with_headers(headers: HashMap<String, String>) -> Message {
        Message::new("cafe01", "/hook/a", "q1", b"{}".to_vec(), headers)
    }

    #[test]
    fn metadata_headers_are_attached() {
        let mut original = HashMap::new();
        original.insert("X-Custom".to_string(), "abc".to_string());
        let msg = message_with_headers(original);

        let headers = HttpSink::delivery_headers(&msg);
        assert_eq!(headers.get("x-webhook-id").unwrap(), "cafe01");
        assert_eq!(headers.get("x-webhook-path").unwrap(), "/hook/a");
        assert_eq!(headers.get("x-webhook-queue").unwrap(), "q1");
        assert!(headers.contains_key("x-webhook-timestamp"));
        assert_eq!(headers.get("x-custom").unwrap(), "abc");
    }

    #[test]
    fn content_type_defaults_to_json() {
        let msg = message_with_headers(HashMap::new());
        let headers = HttpSink::delivery_headers(&msg);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn supplied_content_type_is_preserved() {
        let mut original = HashMap::new();
        original.insert("Content-Type".to_string(), "text/plain".to_string());
        let msg = message_with_headers(original);

        let headers = HttpSink::delivery_headers(&msg);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn timestamp_header_is_rfc3339() {
        let msg = message_with_headers(HashMap::new());
        let headers = HttpSink::delivery_headers(&msg);
        let value = headers.get("x-webhook-timestamp").unwrap().to_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(value).is_ok());
    }
}
