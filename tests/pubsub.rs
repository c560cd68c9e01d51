//! End-to-end bridge behavior over the in-memory gateway.
//!
//! These cover the full subscribe → publish → dispatch → unsubscribe path
//! without a broker; the AMQP transport itself is exercised by the ignored
//! integration tests in the gateway module.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use graphql_amqp_pubsub::{
    AmqpPubSub, ChannelNamer, Delivery, MemoryGateway, MessageHandler, PubSubError,
};
use serde_json::json;
use tokio::sync::mpsc;

fn memory_pubsub(namer: ChannelNamer) -> (AmqpPubSub, Arc<MemoryGateway>) {
    let mut captured = None;
    let pubsub = AmqpPubSub::with_gateway(namer, |sink| {
        let gateway = Arc::new(MemoryGateway::new(sink));
        captured = Some(Arc::clone(&gateway));
        gateway
    });
    (pubsub, captured.unwrap())
}

/// Handler that forwards every delivery to an mpsc channel.
fn forwarding_handler(tx: mpsc::UnboundedSender<Delivery>) -> Arc<dyn MessageHandler> {
    Arc::new(move |delivery: Delivery| -> BoxFuture<'static, ()> {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(delivery);
        })
    })
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Handler channel closed")
}

fn assert_no_delivery(rx: &mut mpsc::UnboundedReceiver<Delivery>) {
    assert!(
        rx.try_recv().is_err(),
        "Handler received a message it should not have"
    );
}

#[tokio::test]
async fn test_subscribe_publish_unsubscribe() {
    let (pubsub, _gateway) = memory_pubsub(ChannelNamer::identity());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let id = pubsub
        .subscribe("testSubscription", forwarding_handler(tx), None)
        .await
        .unwrap();

    pubsub
        .publish("testSubscription", &json!("good"), None)
        .await
        .unwrap();

    let delivery = recv(&mut rx).await;
    assert_eq!(delivery.unwrap(), json!("good"));
    assert_no_delivery(&mut rx);

    pubsub.unsubscribe(id).await.unwrap();

    pubsub
        .publish("testSubscription", &json!("bad"), None)
        .await
        .unwrap();
    assert_no_delivery(&mut rx);
}

#[tokio::test]
async fn test_fan_out_to_sibling_subscriptions() {
    let (pubsub, _gateway) = memory_pubsub(ChannelNamer::identity());
    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();

    // Subscribe order must not matter for fan-out.
    let first = pubsub
        .subscribe("orders", forwarding_handler(first_tx), None)
        .await
        .unwrap();
    let second = pubsub
        .subscribe("orders", forwarding_handler(second_tx), None)
        .await
        .unwrap();

    pubsub.publish("orders", &json!({"n": 1}), None).await.unwrap();

    assert_eq!(recv(&mut first_rx).await.unwrap(), json!({"n": 1}));
    assert_eq!(recv(&mut second_rx).await.unwrap(), json!({"n": 1}));

    // Removing one must not disturb the other.
    pubsub.unsubscribe(first).await.unwrap();
    pubsub.publish("orders", &json!({"n": 2}), None).await.unwrap();

    assert_no_delivery(&mut first_rx);
    assert_eq!(recv(&mut second_rx).await.unwrap(), json!({"n": 2}));

    pubsub.unsubscribe(second).await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_unknown_id_always_fails() {
    let (pubsub, _gateway) = memory_pubsub(ChannelNamer::identity());
    let (tx, _rx) = mpsc::unbounded_channel();

    let id = pubsub
        .subscribe("orders", forwarding_handler(tx), None)
        .await
        .unwrap();
    pubsub.unsubscribe(id).await.unwrap();

    for _ in 0..3 {
        let err = pubsub.unsubscribe(id).await.unwrap_err();
        assert!(matches!(err, PubSubError::UnknownSubscription(bad) if bad == id));
    }
}

#[tokio::test]
async fn test_multi_trigger_fan_in() {
    let (pubsub, _gateway) = memory_pubsub(ChannelNamer::identity());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = forwarding_handler(tx);

    // One logical subscription bound to two triggers, sharing a handler.
    let first = pubsub
        .subscribe("Trigger1", Arc::clone(&handler), None)
        .await
        .unwrap();
    let second = pubsub.subscribe("Trigger2", handler, None).await.unwrap();

    pubsub.publish("Trigger1", &json!(1), None).await.unwrap();
    pubsub.publish("Trigger2", &json!(2), None).await.unwrap();
    pubsub.publish("NotATrigger", &json!(3), None).await.unwrap();

    // Each subscription delivers independently, so cross-trigger arrival
    // order is unspecified.
    let mut seen = vec![
        recv(&mut rx).await.unwrap(),
        recv(&mut rx).await.unwrap(),
    ];
    seen.sort_by_key(|value| value.as_i64());
    assert_eq!(seen, vec![json!(1), json!(2)]);
    assert_no_delivery(&mut rx);

    pubsub.unsubscribe(first).await.unwrap();
    pubsub.unsubscribe(second).await.unwrap();
}

#[tokio::test]
async fn test_custom_namer_separates_sub_streams() {
    let (pubsub, gateway) = memory_pubsub(ChannelNamer::dotted_path());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let options = json!({"path": ["repoA"]});
    pubsub
        .subscribe("comments", forwarding_handler(tx), Some(&options))
        .await
        .unwrap();

    // A publisher applying the same transform with matching arguments
    // reaches the subscriber.
    pubsub
        .publish("comments", &json!("on repoA"), Some(&options))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await.unwrap(), json!("on repoA"));

    // Plain "comments" resolves to a different channel.
    pubsub
        .publish("comments", &json!("elsewhere"), None)
        .await
        .unwrap();
    assert_no_delivery(&mut rx);

    let published = gateway.take_published().await;
    assert_eq!(published[0].0, "comments.repoA");
    assert_eq!(published[1].0, "comments");
}

#[tokio::test]
async fn test_resubscribe_yields_fresh_id() {
    let (pubsub, _gateway) = memory_pubsub(ChannelNamer::identity());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = pubsub
        .subscribe("orders", forwarding_handler(tx.clone()), None)
        .await
        .unwrap();
    pubsub.unsubscribe(first).await.unwrap();

    let second = pubsub
        .subscribe("orders", forwarding_handler(tx), None)
        .await
        .unwrap();
    assert_ne!(first, second);

    pubsub.publish("orders", &json!("again"), None).await.unwrap();
    assert_eq!(recv(&mut rx).await.unwrap(), json!("again"));

    pubsub.unsubscribe(second).await.unwrap();
}

#[tokio::test]
async fn test_slow_handler_does_not_stall_siblings() {
    let (pubsub, _gateway) = memory_pubsub(ChannelNamer::identity());
    let (tx, mut rx) = mpsc::unbounded_channel();

    // A handler that never completes must only back up its own mailbox.
    let stalled: Arc<dyn MessageHandler> =
        Arc::new(|_delivery: Delivery| -> BoxFuture<'static, ()> {
            Box::pin(std::future::pending())
        });
    pubsub.subscribe("orders", stalled, None).await.unwrap();
    pubsub
        .subscribe("orders", forwarding_handler(tx), None)
        .await
        .unwrap();

    pubsub.publish("orders", &json!("first"), None).await.unwrap();
    assert_eq!(recv(&mut rx).await.unwrap(), json!("first"));

    // Publishing again must not wait on the stalled handler either.
    tokio::time::timeout(
        Duration::from_secs(1),
        pubsub.publish("orders", &json!("second"), None),
    )
    .await
    .expect("Publish stalled behind a slow handler")
    .unwrap();
    assert_eq!(recv(&mut rx).await.unwrap(), json!("second"));
}

#[tokio::test]
async fn test_payload_round_trips_unchanged() {
    let (pubsub, _gateway) = memory_pubsub(ChannelNamer::identity());
    let (tx, mut rx) = mpsc::unbounded_channel();

    pubsub
        .subscribe("shapes", forwarding_handler(tx), None)
        .await
        .unwrap();

    let payload = json!({
        "nested": {"list": [1, 2, 3], "flag": true},
        "text": "unicode ✓",
        "nothing": null,
    });
    pubsub.publish("shapes", &payload, None).await.unwrap();

    assert_eq!(recv(&mut rx).await.unwrap(), payload);
}
