//! Subscription bookkeeping.
//!
//! Maps subscription ids to their channel + handler binding and keeps a
//! per-channel index for fan-out lookups. Each subscription owns a mailbox
//! drained by its own worker task: deliveries reach a handler in queue
//! order, and a slow handler only backs up its own mailbox, never a
//! sibling's. All mutation goes through one write lock so a deregister
//! racing a dispatch can never leave a handler reachable after removal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::{PubSubError, Result};
use crate::pubsub::{Delivery, MessageHandler};

/// Opaque unique token identifying one active subscription.
///
/// Ids are never reused while registered; unsubscribing produces a fresh
/// id on re-subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One live subscription: its resolved channel and its mailbox.
#[derive(Debug)]
pub(crate) struct Binding {
    pub channel: String,
    tx: mpsc::UnboundedSender<Delivery>,
    closed: Arc<AtomicBool>,
}

impl Binding {
    /// Stop the worker before it starts any further handler invocation.
    /// Deliveries still queued in the mailbox are dropped.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct RegistryInner {
    by_id: HashMap<SubscriptionId, Binding>,
    by_channel: HashMap<String, Vec<SubscriptionId>>,
}

/// Registry of active subscriptions.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a binding, spawn its worker, and issue its id.
    pub async fn register(&self, channel: &str, handler: Arc<dyn MessageHandler>) -> SubscriptionId {
        let id = SubscriptionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let worker_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if worker_closed.load(Ordering::Acquire) {
                    break;
                }
                handler.handle(delivery).await;
            }
        });

        let mut inner = self.inner.write().await;
        inner.by_id.insert(
            id,
            Binding {
                channel: channel.to_string(),
                tx,
                closed,
            },
        );
        inner
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .push(id);
        id
    }

    /// Remove a binding. No handler invocation starts for it once this
    /// returns; queued deliveries are dropped.
    pub async fn deregister(&self, id: SubscriptionId) -> Result<Binding> {
        let mut inner = self.inner.write().await;
        let binding = inner
            .by_id
            .remove(&id)
            .ok_or(PubSubError::UnknownSubscription(id))?;

        if let Some(ids) = inner.by_channel.get_mut(&binding.channel) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                inner.by_channel.remove(&binding.channel);
            }
        }

        binding.close();
        Ok(binding)
    }

    /// Snapshot of the mailbox senders bound to a channel, in insertion
    /// order.
    ///
    /// Taken under the read lock; dispatch enqueues into each mailbox and
    /// never waits on a handler, so no lock is held across handler work.
    pub async fn senders_for(&self, channel: &str) -> Vec<mpsc::UnboundedSender<Delivery>> {
        let inner = self.inner.read().await;
        inner
            .by_channel
            .get(channel)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.by_id.get(id))
                    .map(|binding| binding.tx.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every binding, returning them for consumer release.
    pub async fn drain(&self) -> Vec<Binding> {
        let mut inner = self.inner.write().await;
        inner.by_channel.clear();
        let bindings: Vec<Binding> = inner.by_id.drain().map(|(_, binding)| binding).collect();
        for binding in &bindings {
            binding.close();
        }
        bindings
    }

    /// Number of active subscriptions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }
}
