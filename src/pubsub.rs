//! The PubSub façade: subscribe, unsubscribe, publish.
//!
//! Orchestrates the namer, registry, and gateway. Incoming broker messages
//! arrive through a [`DeliverySink`] the façade installs at construction;
//! each message is decoded once and enqueued into the mailbox of every
//! subscription currently bound to its channel. Per-subscription workers
//! invoke the handlers, so dispatch never waits on handler code and a slow
//! or stalled handler cannot hold up siblings or the channel's consumer.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::AmqpConfig;
use crate::error::{DeliveryError, PubSubError, Result};
use crate::gateway::{AmqpGateway, BrokerGateway, DeliverySink, SinkVerdict};
use crate::namer::{ChannelNamer, TriggerOptions};
use crate::registry::{SubscriptionId, SubscriptionRegistry};

/// What a subscription handler receives: the published payload, or the
/// error that kept it from decoding. Never both.
pub type Delivery = std::result::Result<Value, DeliveryError>;

/// Handler invoked once per message delivered to a subscription's channel.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()>;
}

impl<F> MessageHandler for F
where
    F: Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync,
{
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()> {
        (self)(delivery)
    }
}

/// Sink that fans incoming messages out to the registry's subscriptions.
struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl DeliverySink for Dispatcher {
    fn deliver(&self, channel: String, payload: Vec<u8>) -> BoxFuture<'static, SinkVerdict> {
        let registry = Arc::clone(&self.registry);
        Box::pin(async move {
            // Snapshot first: subscriptions deregistered before this point
            // never see the message; a subscription deregistered after it
            // has its queued delivery dropped by its worker.
            let senders = registry.senders_for(&channel).await;
            if senders.is_empty() {
                debug!(channel = %channel, "No subscriptions bound, dropping message");
                return SinkVerdict::Ack;
            }

            match serde_json::from_slice::<Value>(&payload) {
                Ok(value) => {
                    debug!(
                        channel = %channel,
                        subscriptions = senders.len(),
                        "Dispatching message"
                    );
                    for sender in &senders {
                        let _ = sender.send(Ok(value.clone()));
                    }
                    SinkVerdict::Ack
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "Failed to decode payload");
                    let err = DeliveryError::Deserialization(e.to_string());
                    for sender in &senders {
                        let _ = sender.send(Err(err.clone()));
                    }
                    SinkVerdict::Reject
                }
            }
        })
    }
}

/// AMQP-backed PubSub engine for GraphQL subscriptions.
///
/// One instance per process, constructed once with an explicit lifecycle
/// and injected into the subscription engine.
pub struct AmqpPubSub {
    gateway: Arc<dyn BrokerGateway>,
    registry: Arc<SubscriptionRegistry>,
    namer: ChannelNamer,
}

impl AmqpPubSub {
    /// Connect to the broker with the identity trigger transform.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        Self::connect_with_namer(config, ChannelNamer::identity()).await
    }

    /// Connect to the broker with a custom trigger transform.
    pub async fn connect_with_namer(config: AmqpConfig, namer: ChannelNamer) -> Result<Self> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sink: Arc<dyn DeliverySink> = Arc::new(Dispatcher {
            registry: Arc::clone(&registry),
        });
        let gateway = Arc::new(AmqpGateway::connect(config, sink).await?);

        Ok(Self {
            gateway,
            registry,
            namer,
        })
    }

    /// Build a façade over an arbitrary gateway.
    ///
    /// The closure receives the façade's delivery sink and returns the
    /// gateway to drive it. Used with [`MemoryGateway`](crate::gateway::MemoryGateway)
    /// in tests and broker-less development.
    pub fn with_gateway<F>(namer: ChannelNamer, build: F) -> Self
    where
        F: FnOnce(Arc<dyn DeliverySink>) -> Arc<dyn BrokerGateway>,
    {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sink: Arc<dyn DeliverySink> = Arc::new(Dispatcher {
            registry: Arc::clone(&registry),
        });

        Self {
            gateway: build(sink),
            registry,
            namer,
        }
    }

    /// Register a handler for a trigger.
    ///
    /// Returns once the broker consumer for the resolved channel is
    /// established; a gateway failure fails the call and leaves no partial
    /// registration behind.
    pub async fn subscribe(
        &self,
        trigger: &str,
        handler: Arc<dyn MessageHandler>,
        options: Option<&TriggerOptions>,
    ) -> Result<SubscriptionId> {
        let channel = self.namer.resolve(trigger, options);

        self.gateway.ensure_consumer(&channel).await?;
        let id = self.registry.register(&channel, handler).await;

        debug!(trigger = %trigger, channel = %channel, id = %id, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription.
    ///
    /// Fails with [`PubSubError::UnknownSubscription`] if the id is not
    /// currently registered. Once this returns, the handler is never
    /// invoked again.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        // Deregister before releasing the consumer so no delivery started
        // after this point can reach the handler.
        let binding = self.registry.deregister(id).await?;
        self.gateway.release_consumer(&binding.channel).await?;

        debug!(channel = %binding.channel, id = %id, "Unsubscribed");
        Ok(())
    }

    /// Publish a payload for a trigger.
    ///
    /// The channel is resolved with the same transform subscribers use;
    /// callers must pass matching options to reach them.
    pub async fn publish(
        &self,
        trigger: &str,
        payload: &Value,
        options: Option<&TriggerOptions>,
    ) -> Result<()> {
        let channel = self.namer.resolve(trigger, options);
        let bytes = serde_json::to_vec(payload)
            .map_err(|e| PubSubError::Publish(format!("Failed to serialize payload: {}", e)))?;

        self.gateway.publish(&channel, &bytes).await
    }

    /// Release every remaining subscription and its consumer.
    ///
    /// A failed release is logged and does not stop the remaining releases;
    /// the first error is returned after every consumer has been attempted.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;

        for binding in self.registry.drain().await {
            if let Err(e) = self.gateway.release_consumer(&binding.channel).await {
                error!(channel = %binding.channel, error = %e, "Failed to release consumer");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
