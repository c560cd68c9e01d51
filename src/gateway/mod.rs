//! Broker gateway: the façade's view of the message broker.
//!
//! This module contains:
//! - `BrokerGateway` trait: consumer lifecycle + publish against broker
//!   primitives
//! - `DeliverySink` trait: where incoming broker messages are handed off
//! - Implementations: AMQP (RabbitMQ), in-memory (tests/local dev)

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpGateway;
pub use memory::MemoryGateway;

/// Whether a processed delivery should be acknowledged or rejected.
///
/// Rejected messages are not requeued; with a dead-letter exchange
/// configured the broker routes them there instead of discarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkVerdict {
    Ack,
    Reject,
}

/// Receives raw message bytes from a gateway's consumer loop.
///
/// One sink serves every channel; the façade implements it to fan the
/// message out to the channel's registered handlers.
pub trait DeliverySink: Send + Sync {
    fn deliver(&self, channel: String, payload: Vec<u8>) -> BoxFuture<'static, SinkVerdict>;
}

/// Consumer lifecycle and publish operations against the broker.
///
/// The gateway owns exactly one broker-level consumer per distinct channel,
/// reference-counted across the subscriptions sharing it; fan-out to the
/// individual handlers happens above, in the façade.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Start (or retain) the consumer for a channel.
    ///
    /// Idempotent: the first call per channel sets up broker resources and
    /// is consuming by the time it returns; later calls only increment the
    /// reference count. A setup failure on the first call surfaces here and
    /// leaves no consumer behind.
    async fn ensure_consumer(&self, channel: &str) -> Result<()>;

    /// Release one reference to a channel's consumer.
    ///
    /// At zero the consumer stops and its broker resources are torn down.
    /// Releasing a channel with no live consumer fails with
    /// [`PubSubError::InvalidRelease`](crate::PubSubError::InvalidRelease).
    async fn release_consumer(&self, channel: &str) -> Result<()>;

    /// Publish raw payload bytes to a channel.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
}
