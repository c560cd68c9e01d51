//! AMQP (RabbitMQ) PubSub engine for GraphQL subscriptions.
//!
//! A subscription execution engine registers interest in a named trigger;
//! when a matching event is published, every registered handler for that
//! trigger receives the payload, routed through the broker so publishers
//! and subscribers can live in different processes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::future::BoxFuture;
//! use graphql_amqp_pubsub::{AmqpConfig, AmqpPubSub, Delivery};
//!
//! # async fn run() -> graphql_amqp_pubsub::Result<()> {
//! let pubsub = AmqpPubSub::connect(AmqpConfig::new("amqp://localhost:5672")).await?;
//!
//! let handler = Arc::new(|delivery: Delivery| -> BoxFuture<'static, ()> {
//!     Box::pin(async move {
//!         if let Ok(payload) = delivery {
//!             println!("got {payload}");
//!         }
//!     })
//! });
//!
//! let id = pubsub.subscribe("commentAdded", handler, None).await?;
//! pubsub
//!     .publish("commentAdded", &serde_json::json!({"body": "hi"}), None)
//!     .await?;
//! pubsub.unsubscribe(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod namer;
pub mod pubsub;
pub mod registry;

pub use config::AmqpConfig;
pub use error::{DeliveryError, PubSubError, Result};
pub use gateway::{AmqpGateway, BrokerGateway, DeliverySink, MemoryGateway, SinkVerdict};
pub use namer::{ChannelNamer, TriggerOptions};
pub use pubsub::{AmqpPubSub, Delivery, MessageHandler};
pub use registry::SubscriptionId;
