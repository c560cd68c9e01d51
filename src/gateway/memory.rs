//! In-memory gateway for testing and broker-less local development.
//!
//! Routes published payloads straight to the sink, but only for channels
//! that currently hold a live (reference-counted) consumer, mirroring the
//! AMQP gateway's delivery contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BrokerGateway, DeliverySink, SinkVerdict};
use crate::error::{PubSubError, Result};

/// In-memory [`BrokerGateway`].
pub struct MemoryGateway {
    sink: Arc<dyn DeliverySink>,
    refcounts: RwLock<HashMap<String, usize>>,
    published: RwLock<Vec<(String, Vec<u8>)>>,
    fail_on_publish: RwLock<bool>,
    fail_on_ensure: RwLock<bool>,
    fail_on_release: RwLock<bool>,
    release_calls: RwLock<Vec<String>>,
    verdicts: RwLock<Vec<SinkVerdict>>,
}

impl MemoryGateway {
    pub fn new(sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            sink,
            refcounts: RwLock::new(HashMap::new()),
            published: RwLock::new(Vec::new()),
            fail_on_publish: RwLock::new(false),
            fail_on_ensure: RwLock::new(false),
            fail_on_release: RwLock::new(false),
            release_calls: RwLock::new(Vec::new()),
            verdicts: RwLock::new(Vec::new()),
        }
    }

    /// Make subsequent publishes fail with a connection error.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    /// Make subsequent `ensure_consumer` calls fail with a connection error.
    pub async fn set_fail_on_ensure(&self, fail: bool) {
        *self.fail_on_ensure.write().await = fail;
    }

    /// Make subsequent `release_consumer` calls fail with a connection
    /// error (the refcount is still recorded as attempted).
    pub async fn set_fail_on_release(&self, fail: bool) {
        *self.fail_on_release.write().await = fail;
    }

    /// Channels passed to `release_consumer`, in call order.
    pub async fn release_calls(&self) -> Vec<String> {
        self.release_calls.read().await.clone()
    }

    /// Number of payloads accepted by `publish`.
    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    /// Drain the record of published payloads.
    pub async fn take_published(&self) -> Vec<(String, Vec<u8>)> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Current consumer reference count for a channel.
    pub async fn refcount(&self, channel: &str) -> usize {
        self.refcounts.read().await.get(channel).copied().unwrap_or(0)
    }

    /// Verdicts the sink returned for delivered messages, in order.
    pub async fn take_verdicts(&self) -> Vec<SinkVerdict> {
        std::mem::take(&mut *self.verdicts.write().await)
    }
}

#[async_trait]
impl BrokerGateway for MemoryGateway {
    async fn ensure_consumer(&self, channel: &str) -> Result<()> {
        if *self.fail_on_ensure.read().await {
            return Err(PubSubError::Connection(
                "Injected consumer failure".to_string(),
            ));
        }

        let mut refcounts = self.refcounts.write().await;
        *refcounts.entry(channel.to_string()).or_insert(0) += 1;
        Ok(())
    }

    async fn release_consumer(&self, channel: &str) -> Result<()> {
        self.release_calls.write().await.push(channel.to_string());

        if *self.fail_on_release.read().await {
            return Err(PubSubError::Connection(
                "Injected release failure".to_string(),
            ));
        }

        let mut refcounts = self.refcounts.write().await;
        let count = refcounts.get_mut(channel).ok_or_else(|| {
            PubSubError::InvalidRelease(format!(
                "Channel '{}' has no live consumer",
                channel
            ))
        })?;

        *count -= 1;
        if *count == 0 {
            refcounts.remove(channel);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(PubSubError::Connection(
                "Injected publish failure".to_string(),
            ));
        }

        self.published
            .write()
            .await
            .push((channel.to_string(), payload.to_vec()));

        let has_consumer = self.refcounts.read().await.contains_key(channel);
        if has_consumer {
            let verdict = self
                .sink
                .deliver(channel.to_string(), payload.to_vec())
                .await;
            self.verdicts.write().await.push(verdict);
        }

        Ok(())
    }
}
