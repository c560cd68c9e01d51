//! AMQP (RabbitMQ) gateway implementation.
//!
//! Publishes to a topic exchange with routing key = channel name and runs
//! one reference-counted consumer task per distinct channel. Consumer
//! tasks reconnect with exponential backoff and re-declare their queue and
//! binding on re-attach, so registered subscriptions survive broker
//! outages without the façade re-subscribing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use super::{BrokerGateway, DeliverySink, SinkVerdict};
use crate::config::AmqpConfig;
use crate::error::{PubSubError, Result};

/// Queue argument for dead-letter routing.
const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// One live broker consumer shared by every subscription on its channel.
struct ConsumerEntry {
    refcount: usize,
    shutdown: watch::Sender<bool>,
}

/// AMQP gateway over a pooled lapin connection.
pub struct AmqpGateway {
    pool: Pool,
    config: AmqpConfig,
    sink: Arc<dyn DeliverySink>,
    consumers: RwLock<HashMap<String, ConsumerEntry>>,
}

impl AmqpGateway {
    /// Connect to the broker and declare the exchange.
    pub async fn connect(config: AmqpConfig, sink: Arc<dyn DeliverySink>) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| PubSubError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let conn = pool
            .get()
            .await
            .map_err(|e| PubSubError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| PubSubError::Connection(format!("Failed to create channel: {}", e)))?;

        Self::declare_exchange(&channel, &config.exchange).await?;

        info!(
            exchange = %config.exchange,
            url = %config.url,
            "Connected to AMQP"
        );

        Ok(Self {
            pool,
            config,
            sink,
            consumers: RwLock::new(HashMap::new()),
        })
    }

    /// Get a channel from the pool.
    async fn get_channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            PubSubError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| PubSubError::Connection(format!("Failed to create channel: {}", e)))
    }

    async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PubSubError::Connection(format!("Failed to declare exchange: {}", e)))
    }

    /// Consumer loop with automatic reconnection and exponential backoff
    /// with jitter. Takes over a consumer already established by
    /// `ensure_consumer` and runs until the channel's last reference is
    /// released.
    async fn consume_with_reconnect(
        pool: Pool,
        config: AmqpConfig,
        channel_name: String,
        sink: Arc<dyn DeliverySink>,
        mut shutdown: watch::Receiver<bool>,
        mut consumer: lapin::Consumer,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        loop {
            info!(
                channel = %channel_name,
                "Consumer connected, processing messages"
            );

            loop {
                tokio::select! {
                    // Fires on shutdown signal or sender drop.
                    _ = shutdown.changed() => {
                        info!(channel = %channel_name, "Consumer stopped");
                        return;
                    }
                    delivery = consumer.next() => match delivery {
                        Some(Ok(delivery)) => {
                            Self::process_delivery(delivery, &channel_name, &sink).await;
                        }
                        Some(Err(e)) => {
                            error!(
                                channel = %channel_name,
                                error = %e,
                                "Consumer delivery error, will reconnect"
                            );
                            break;
                        }
                        None => {
                            info!(
                                channel = %channel_name,
                                "Consumer stream ended, reconnecting..."
                            );
                            break;
                        }
                    }
                }
            }

            // Re-establish the consumer, backing off between attempts.
            // Backoff restarts per outage so a recovered connection gets a
            // fresh budget.
            let mut backoff_iter = backoff_builder.build();
            consumer = loop {
                let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                match Self::setup_consumer(&pool, &config, &channel_name).await {
                    Ok(consumer) => break consumer,
                    Err(e) => {
                        error!(
                            channel = %channel_name,
                            error = %e,
                            "Failed to re-establish consumer, retrying after backoff"
                        );
                    }
                }
            };
        }
    }

    /// Declare the channel's queue, bind it to the exchange, and start
    /// consuming. Re-declares the exchange too: on reconnect the broker may
    /// be a fresh instance.
    async fn setup_consumer(
        pool: &Pool,
        config: &AmqpConfig,
        channel_name: &str,
    ) -> Result<lapin::Consumer> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            PubSubError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| PubSubError::Connection(format!("Failed to create channel: {}", e)))?;

        Self::declare_exchange(&channel, &config.exchange).await?;

        let queue = config.queue_for_channel(channel_name);

        let mut arguments = FieldTable::default();
        if let Some(dlx) = &config.dead_letter_exchange {
            arguments.insert(
                DEAD_LETTER_EXCHANGE_ARG.into(),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }

        channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: config.durable_queues,
                    auto_delete: config.auto_delete_queues,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| PubSubError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &queue,
                &config.exchange,
                channel_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| PubSubError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        debug!(
            queue = %queue,
            channel = %channel_name,
            "Bound queue to exchange"
        );

        let consumer = channel
            .basic_consume(
                &queue,
                &format!("{}-consumer", queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| PubSubError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer)
    }

    /// Hand one delivery to the sink and acknowledge per its verdict.
    async fn process_delivery(
        delivery: lapin::message::Delivery,
        channel_name: &str,
        sink: &Arc<dyn DeliverySink>,
    ) {
        debug!(
            channel = %channel_name,
            bytes = delivery.data.len(),
            "Received message"
        );

        let data = delivery.data.clone();
        match sink.deliver(channel_name.to_string(), data).await {
            SinkVerdict::Ack => {
                if let Err(e) = delivery.ack(Default::default()).await {
                    error!(channel = %channel_name, error = %e, "Failed to ack message");
                }
            }
            SinkVerdict::Reject => {
                // Not requeued; dead-letters when the queue is configured for it.
                if let Err(e) = delivery.reject(Default::default()).await {
                    error!(channel = %channel_name, error = %e, "Failed to reject message");
                }
            }
        }
    }

    /// Delete the channel's queue after the last reference is released.
    async fn delete_queue(&self, channel_name: &str) {
        let queue = self.config.queue_for_channel(channel_name);
        match self.get_channel().await {
            Ok(channel) => {
                if let Err(e) = channel
                    .queue_delete(&queue, QueueDeleteOptions::default())
                    .await
                {
                    warn!(queue = %queue, error = %e, "Failed to delete queue");
                } else {
                    debug!(queue = %queue, "Deleted queue");
                }
            }
            Err(e) => {
                warn!(queue = %queue, error = %e, "Failed to delete queue");
            }
        }
    }
}

#[async_trait]
impl BrokerGateway for AmqpGateway {
    async fn ensure_consumer(&self, channel: &str) -> Result<()> {
        let mut consumers = self.consumers.write().await;

        if let Some(entry) = consumers.get_mut(channel) {
            entry.refcount += 1;
            debug!(
                channel = %channel,
                refcount = entry.refcount,
                "Retained existing consumer"
            );
            return Ok(());
        }

        // Establish the consumer before returning so the queue exists and
        // is bound by the time the caller's subscribe completes; a broker
        // failure here fails the subscribe instead of being swallowed by a
        // background task.
        let consumer = Self::setup_consumer(&self.pool, &self.config, channel).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(Self::consume_with_reconnect(
            self.pool.clone(),
            self.config.clone(),
            channel.to_string(),
            Arc::clone(&self.sink),
            shutdown_rx,
            consumer,
        ));

        consumers.insert(
            channel.to_string(),
            ConsumerEntry {
                refcount: 1,
                shutdown: shutdown_tx,
            },
        );

        info!(channel = %channel, "Started consumer");
        Ok(())
    }

    async fn release_consumer(&self, channel: &str) -> Result<()> {
        let entry = {
            let mut consumers = self.consumers.write().await;

            let entry = consumers.get_mut(channel).ok_or_else(|| {
                PubSubError::InvalidRelease(format!(
                    "Channel '{}' has no live consumer",
                    channel
                ))
            })?;

            entry.refcount -= 1;
            if entry.refcount > 0 {
                debug!(
                    channel = %channel,
                    refcount = entry.refcount,
                    "Released consumer reference"
                );
                return Ok(());
            }

            consumers.remove(channel)
        };

        if let Some(entry) = entry {
            // Stop the consumer loop, then tear down the queue.
            let _ = entry.shutdown.send(true);
            self.delete_queue(channel).await;
            info!(channel = %channel, "Stopped consumer");
        }

        Ok(())
    }

    #[tracing::instrument(name = "gateway.publish", skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        const MAX_RETRIES: usize = 5;

        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Get fresh channel for each attempt (handles reconnection)
            let amqp_channel = match self.get_channel().await {
                Ok(ch) => ch,
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Failed to get channel, retrying..."
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2); // persistent

            match amqp_channel
                .basic_publish(
                    &self.config.exchange,
                    channel,
                    BasicPublishOptions::default(),
                    payload,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(
                            exchange = %self.config.exchange,
                            channel = %channel,
                            "Published message"
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        error!(
                            attempt = attempt + 1,
                            max_retries = MAX_RETRIES,
                            error = %e,
                            "Publish confirmation failed, retrying..."
                        );
                        last_error = Some(PubSubError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_retries = MAX_RETRIES,
                        error = %e,
                        "Publish failed, retrying..."
                    );
                    last_error = Some(PubSubError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PubSubError::Publish("Max retries exceeded".to_string())))
    }
}
