use std::time::Duration;

use rust_rabbit_rpc::rabbitmq::invoke_action_with_routing_key_and_payload;
use rust_rabbit_rpc::{
    ExchangeType, MemoryBroker, MessagePayload, ReceiveOptions, RpcClient, RpcServer, SendOptions,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::support::connected;

#[tokio::test(start_paused = true)]
async fn broadcast_reaches_every_listener_once() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut listeners = Vec::new();
    for listener in 0..4 {
        let tx = tx.clone();
        let subscription = client
            .listen(
                "announcements",
                move |_routing_key: String, payload: MessagePayload| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send((listener, payload.data().clone()));
                        Ok::<_, anyhow::Error>(None)
                    }
                },
                ReceiveOptions::default(),
            )
            .await
            .unwrap();
        listeners.push(subscription);
    }
    drop(tx);

    assert!(broker.has_exchange("announcements"));
    for subscription in &listeners {
        assert_eq!(broker.is_durable(subscription.queue()), Some(false));
    }

    let correlation_id = client
        .broadcast("announcements", &MessagePayload::ok("hello"), SendOptions::default())
        .await
        .unwrap();
    assert!(!correlation_id.is_empty());

    let mut seen = Vec::new();
    for _ in 0..4 {
        let (listener, data) = rx.recv().await.unwrap();
        assert_eq!(data, json!("hello"));
        seen.push(listener);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);

    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "a listener saw the broadcast twice");

    for subscription in listeners {
        subscription.close().await.unwrap();
    }
    assert_eq!(client.connection().channel_count(), 0);
}

#[tokio::test]
async fn topic_patterns_select_deliveries() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let orders_tx = tx.clone();
    let orders = client
        .receive_from_topic(
            "events",
            &["orders.*.created"],
            move |routing_key: String, _payload: MessagePayload| {
                let tx = orders_tx.clone();
                async move {
                    let _ = tx.send(("orders", routing_key));
                    Ok::<_, anyhow::Error>(None)
                }
            },
            ReceiveOptions::default(),
        )
        .await
        .unwrap();

    let audit_tx = tx.clone();
    let audit = client
        .receive_from_topic(
            "events",
            &["audit.#"],
            move |routing_key: String, _payload: MessagePayload| {
                let tx = audit_tx.clone();
                async move {
                    let _ = tx.send(("audit", routing_key));
                    Ok::<_, anyhow::Error>(None)
                }
            },
            ReceiveOptions::default(),
        )
        .await
        .unwrap();
    drop(tx);

    for key in [
        "orders.eu.created",
        "orders.eu.shipped",
        "orders.created",
        "audit",
        "audit.login.failed",
    ] {
        client
            .send_to_topic("events", key, &MessagePayload::ok(key), SendOptions::default())
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(rx.recv().await.unwrap());
    }
    received.sort();
    assert_eq!(
        received,
        vec![
            ("audit", "audit".to_string()),
            ("audit", "audit.login.failed".to_string()),
            ("orders", "orders.eu.created".to_string()),
        ]
    );

    orders.close().await.unwrap();
    audit.close().await.unwrap();
}

#[tokio::test]
async fn direct_exchange_rpc_passes_the_routing_key() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;

    let server = RpcServer::new(client.clone());
    let subscription = server
        .receive_from_direct_exchange(
            "orders",
            &["orders.get", "orders.count"],
            invoke_action_with_routing_key_and_payload(|routing_key: String, id: u64| async move {
                Ok::<_, anyhow::Error>(json!({ "route": routing_key, "id": id }))
            }),
            ReceiveOptions::default(),
        )
        .await
        .unwrap();

    let rpc = RpcClient::new(client.clone());
    let reply = rpc
        .send_to_direct_exchange("orders", "orders.count", &MessagePayload::ok(9), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, MessagePayload::ok(json!({ "route": "orders.count", "id": 9 })));

    let reply = rpc
        .send_to_exchange(
            "orders",
            ExchangeType::Direct,
            "orders.get",
            &MessagePayload::ok(json!("not a number")),
            SendOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply.error().map(|e| e.name.as_str()), Some("InvalidPayload"));

    subscription.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unmatched_direct_keys_are_dropped() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let subscription = client
        .receive_from_direct_exchange(
            "jobs",
            &["resize"],
            move |_routing_key: String, payload: MessagePayload| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload.data().clone());
                    Ok::<_, anyhow::Error>(None)
                }
            },
            ReceiveOptions::default(),
        )
        .await
        .unwrap();

    client
        .send_to_direct_exchange("jobs", "crop", &MessagePayload::ok(1), SendOptions::default())
        .await
        .unwrap();
    client
        .send_to_direct_exchange("jobs", "resize", &MessagePayload::ok(2), SendOptions::default())
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), json!(2));
    let extra = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err());

    subscription.close().await.unwrap();
}
