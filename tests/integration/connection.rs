use std::time::Duration;

use rust_rabbit_rpc::rabbitmq::{ConnectionEvent, ConnectionState};
use rust_rabbit_rpc::{MemoryBroker, MessagePayload, SendOptions, SendOutcome};

use crate::support::{client, connected};

#[tokio::test(start_paused = true)]
async fn reconnects_after_a_forced_drop() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let mut events = client.connection().subscribe();

    broker.drop_connections();

    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnect);
    assert!(!client.is_connected());
    assert_eq!(broker.connection_count(), 0);

    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connect);
    assert!(client.is_connected());
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn keeps_retrying_while_the_broker_is_down() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let mut events = client.connection().subscribe();

    broker.set_available(false);
    broker.drop_connections();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnect);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_ne!(client.state(), ConnectionState::Connected);

    broker.set_available(true);
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Connect);
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn publishing_works_again_after_reconnect() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let mut events = client.connection().subscribe();

    broker.drop_connections();
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Disconnect);

    // waits for the reconnect instead of failing
    let outcome = client
        .send_to_queue("jobs", &MessagePayload::ok(1), SendOptions::default())
        .await
        .unwrap();

    assert!(matches!(outcome, SendOutcome::Published(_)));
    assert_eq!(broker.queue_depth("jobs"), 1);
}

#[tokio::test]
async fn operations_wait_for_the_first_connection() {
    let broker = MemoryBroker::new();
    let client = client(&broker);

    let pending = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .send_to_queue("jobs", &MessagePayload::ok("early"), SendOptions::default())
                .await
        }
    });
    tokio::task::yield_now().await;
    assert_eq!(broker.queue_depth("jobs"), 0);

    client.connect().await.unwrap();
    pending.await.unwrap().unwrap();
    assert_eq!(broker.queue_depth("jobs"), 1);
}

#[tokio::test]
async fn blocked_and_unblocked_are_reported() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let mut events = client.connection().subscribe();

    broker.block("disk alarm");
    broker.unblock();

    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::Blocked {
            reason: "disk alarm".to_string()
        }
    );
    assert_eq!(events.recv().await.unwrap(), ConnectionEvent::Unblocked);
}

#[tokio::test]
async fn disconnect_waits_for_the_disconnect_event() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    client.create_channel().await.unwrap();

    client.disconnect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.connection().channel_count(), 0);
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(broker.channel_count(), 0);

    client.shutdown().await;
}
