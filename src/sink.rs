use async_trait::async_trait;

use crate::error::Result;
use crate::types::Message;

/// A delivery destination for messages.
///
/// The bridge carries at most two sinks, a Kafka producer and a remote HTTP
/// forwarder; the scheduler picks one per attempt based on configuration.
/// Every send failure is treated as transient: permanence is only reached
/// through the scheduler's retry ceiling, never through error
/// classification here.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short label used in logs and health reports.
    fn kind(&self) -> &'static str;

    /// Attempt a single synchronous delivery.
    async fn send(&self, msg: &Message) -> Result<()>;

    /// Deliver with a bounded in-process retry loop. Not used by the
    /// scheduler, which persists between attempts instead; this exists for
    /// callers that want to publish without going through the store.
    async fn send_with_retry(&self, msg: &Message) -> Result<()>;

    /// Lightweight availability check.
    async fn health_probe(&self) -> Result<()>;

    /// Release the sink's resources, flushing anything in flight.
    async fn close(&self);
}
