//! Error types for bridge operations.

use crate::registry::SubscriptionId;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, PubSubError>;

/// Errors that can occur during subscribe/unsubscribe/publish.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    /// `unsubscribe` was called with an id that is not currently registered.
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// A consumer was released for a channel that has no live consumer.
    /// Reference counts only reach zero through matching releases, so this
    /// is a programming error, not a broker condition.
    #[error("Invalid consumer release: {0}")]
    InvalidRelease(String),
}

/// Errors delivered to a subscription handler instead of a payload.
///
/// These are never returned from bridge operations; they travel through the
/// handler's `Delivery` argument so one bad message cannot crash the process.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    /// The broker message body could not be decoded as a payload.
    #[error("Failed to decode message payload: {0}")]
    Deserialization(String),
}
