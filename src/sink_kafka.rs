use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, warn};

use crate::config::KafkaConfig;
use crate::error::{BridgeError, Result};
use crate::sink::Sink;
use crate::types::Message;

/// Deadline for metadata fetches during health probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Broker sink: produces one record per message to the topic named by the
/// message's queue, keyed by message id so a given webhook always lands on
/// the same partition.
pub struct KafkaSink {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl std::fmt::Debug for KafkaSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaSink")
            .field("config", &self.config)
            .finish()
    }
}

impl KafkaSink {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let client = client_config(config)?;
        let producer: FutureProducer = client.create()?;
        Ok(Self {
            producer,
            config: config.clone(),
        })
    }
}

/// Translate the bridge's Kafka block into librdkafka properties.
///
/// Reliability settings mirror the delivery model: full-ISR acks, snappy
/// compression, one-second linger with the configured batch threshold.
fn client_config(config: &KafkaConfig) -> Result<ClientConfig> {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers.join(","))
        .set("acks", "all")
        .set("compression.type", "snappy")
        .set("linger.ms", "1000")
        .set("batch.num.messages", config.batch_size.to_string())
        .set("message.send.max.retries", config.retry_max.to_string())
        .set(
            "retry.backoff.ms",
            config.retry_backoff.as_millis().to_string(),
        )
        .set("socket.timeout.ms", config.timeout.as_millis().to_string())
        .set("message.timeout.ms", config.timeout.as_millis().to_string());

    let mut protocol = match config.security_protocol.as_str() {
        "" => None,
        "SSL" => Some("ssl"),
        "SASL_PLAINTEXT" => Some("sasl_plaintext"),
        "SASL_SSL" => Some("sasl_ssl"),
        other => {
            warn!(security_protocol = other, "ignoring unknown security protocol");
            None
        }
    };

    if config.tls_enabled {
        protocol = Some(match protocol {
            Some("sasl_plaintext") | Some("sasl_ssl") => "sasl_ssl",
            _ => "ssl",
        });
    }

    if !config.sasl_mechanism.is_empty() {
        let mechanism = match config.sasl_mechanism.as_str() {
            "PLAIN" => "PLAIN",
            "SCRAM-SHA-256" => "SCRAM-SHA-256",
            "SCRAM-SHA-512" => "SCRAM-SHA-512",
            other => {
                return Err(BridgeError::Broker(format!(
                    "unsupported SASL mechanism: {other}"
                )))
            }
        };
        client
            .set("sasl.mechanisms", mechanism)
            .set("sasl.username", &config.sasl_username)
            .set("sasl.password", &config.sasl_password);

        protocol = Some(match protocol {
            Some("ssl") | Some("sasl_ssl") => "sasl_ssl",
            _ => "sasl_plaintext",
        });
    }

    if let Some(protocol) = protocol {
        client.set("security.protocol", protocol);
    }

    Ok(client)
}

/// Build the outgoing record: key = message id, value = body, headers =
/// original webhook headers plus delivery metadata.
fn delivery_record(msg: &Message) -> FutureRecord<'_, String, Vec<u8>> {
    let mut headers = OwnedHeaders::new_with_capacity(msg.headers.len() + 2);
    for (key, value) in &msg.headers {
        headers = headers.insert(Header {
            key,
            value: Some(value),
        });
    }
    headers = headers
        .insert(Header {
            key: "X-Webhook-ID",
            value: Some(&msg.id),
        })
        .insert(Header {
            key: "X-Webhook-Path",
            value: Some(&msg.path),
        });

    FutureRecord::to(&msg.queue)
        .key(&msg.id)
        .payload(&msg.body)
        .headers(headers)
        .timestamp(msg.timestamp.timestamp_millis())
}

#[async_trait]
impl Sink for KafkaSink {
    fn kind(&self) -> &'static str {
        "kafka"
    }

    async fn send(&self, msg: &Message) -> Result<()> {
        let record = delivery_record(msg);
        match self.producer.send(record, self.config.timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    message_id = %msg.id,
                    topic = %msg.queue,
                    partition,
                    offset,
                    "message produced to kafka"
                );
                Ok(())
            }
            Err((err, _)) => Err(BridgeError::Broker(format!(
                "failed to produce message to kafka: {err}"
            ))),
        }
    }

    async fn send_with_retry(&self, msg: &Message) -> Result<()> {
        let mut last_err = None;

        for attempt in 0..=self.config.retry_max {
            if attempt > 0 {
                let backoff = self.config.retry_backoff * attempt;
                debug!(
                    message_id = %msg.id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying kafka send"
                );
                tokio::time::sleep(backoff).await;
            }

            match self.send(msg).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(message_id = %msg.id, attempt = attempt + 1, error = %err, "kafka send failed");
                    last_err = Some(err);
                }
            }
        }

        let attempts = self.config.retry_max + 1;
        let last = last_err.map(|e| e.to_string()).unwrap_or_default();
        Err(BridgeError::Broker(format!(
            "failed to send message after {attempts} attempts: {last}"
        )))
    }

    async fn health_probe(&self) -> Result<()> {
        let producer = self.producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            producer.client().fetch_metadata(None, PROBE_TIMEOUT)
        })
        .await
        .map_err(|err| BridgeError::Internal(format!("metadata probe task failed: {err}")))?
        .map_err(|err| BridgeError::Broker(format!("kafka health check failed: {err}")))?;

        if metadata.brokers().is_empty() {
            return Err(BridgeError::Broker("no kafka brokers available".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let timeout = self.config.timeout;
        let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout)).await;
        match flushed {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "kafka producer flush failed during close"),
            Err(err) => warn!(error = %err, "kafka flush task failed during close"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rdkafka::message::Headers;

    use super::*;

    fn kafka_config() -> KafkaConfig {
        KafkaConfig {
            brokers: vec!["localhost:9092".into()],
            security_protocol: String::new(),
            sasl_mechanism: String::new(),
            sasl_username: String::new(),
            sasl_password: String::new(),
            tls_enabled: false,
            retry_max: 3,
            retry_backoff: Duration::from_secs(2),
            batch_size: 100,
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn record_carries_id_key_body_and_metadata_headers() {
        let mut headers = HashMap::new();
        headers.insert("X-Custom".to_string(), "abc".to_string());
        let msg = Message::new("deadbeef", "/hook/a", "q1", b"{\"x\":1}".to_vec(), headers);

        let record = delivery_record(&msg);
        assert_eq!(record.topic, "q1");
        assert_eq!(record.key, Some(&msg.id));
        assert_eq!(record.payload, Some(&msg.body));

        let headers = record.headers.as_ref().unwrap();
        let mut found = HashMap::new();
        for header in headers.iter() {
            found.insert(
                header.key.to_string(),
                String::from_utf8_lossy(header.value.unwrap()).to_string(),
            );
        }
        assert_eq!(found.get("X-Webhook-ID").map(String::as_str), Some("deadbeef"));
        assert_eq!(found.get("X-Webhook-Path").map(String::as_str), Some("/hook/a"));
        assert_eq!(found.get("X-Custom").map(String::as_str), Some("abc"));
    }

    #[test]
    fn reliability_settings_are_applied() {
        let client = client_config(&kafka_config()).unwrap();
        assert_eq!(client.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("compression.type"), Some("snappy"));
        assert_eq!(client.get("retry.backoff.ms"), Some("2000"));
        assert_eq!(client.get("security.protocol"), None);
    }

    #[test]
    fn sasl_scram_enables_sasl_transport() {
        let mut config = kafka_config();
        config.sasl_mechanism = "SCRAM-SHA-512".into();
        config.sasl_username = "user".into();
        config.sasl_password = "pass".into();

        let client = client_config(&config).unwrap();
        assert_eq!(client.get("sasl.mechanisms"), Some("SCRAM-SHA-512"));
        assert_eq!(client.get("security.protocol"), Some("sasl_plaintext"));

        config.tls_enabled = true;
        let client = client_config(&config).unwrap();
        assert_eq!(client.get("security.protocol"), Some("sasl_ssl"));
    }

    #[test]
    fn explicit_protocols_map_to_librdkafka_names() {
        let mut config = kafka_config();
        config.security_protocol = "SSL".into();
        let client = client_config(&config).unwrap();
        assert_eq!(client.get("security.protocol"), Some("ssl"));

        config.security_protocol = "SASL_SSL".into();
        config.sasl_mechanism = "PLAIN".into();
        let client = client_config(&config).unwrap();
        assert_eq!(client.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(client.get("sasl.mechanisms"), Some("PLAIN"));
    }

    #[test]
    fn unknown_sasl_mechanism_fails_construction() {
        let mut config = kafka_config();
        config.sasl_mechanism = "GSSAPI".into();
        let err = KafkaSink::new(&config).unwrap_err();
        assert!(err.to_string().contains("unsupported SASL mechanism"));
    }
}
