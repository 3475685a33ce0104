//! A durable webhook store-and-forward bridge.
//!
//! The bridge accepts HTTP POST callbacks on configured paths, records each
//! delivery in a local SQLite queue, and forwards every message to either a
//! Kafka topic or a configured remote HTTP endpoint.
//!
//! ## Guarantees
//! - At-least-once delivery, driven by a persistent retry queue
//! - Bounded ingest latency: acknowledgement costs one durable local write
//! - Delivery backpressure never reaches the webhook sender
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across messages
//! - Cross-process coordination (the store is single-node)
//!
//! The ingest path never talks to a sink. A webhook is acknowledged once it
//! is on disk; the retry scheduler owns every delivery attempt and the
//! lifecycle state machine that goes with it.

mod config;
mod error;
mod scheduler;
mod server;
mod sink;
mod sink_http;
mod sink_kafka;
mod storage;
mod supervisor;
mod telemetry;
mod types;

pub use config::{
    Config, KafkaConfig, RemoteUrlConfig, RouteConfig, ServerConfig, SqliteConfig, WorkerConfig,
};
pub use error::{BridgeError, Result};
pub use scheduler::RetryScheduler;
pub use server::{router, IngestState};
pub use sink::Sink;
pub use sink_http::HttpSink;
pub use sink_kafka::KafkaSink;
pub use storage::{MessageStore, SqliteStore};
pub use supervisor::{Bridge, Shutdown};
pub use telemetry::init_tracing;
pub use types::{
    HealthResponse, IngestResponse, Message, MessageStatus, ServerInfo, StatusResponse,
};
