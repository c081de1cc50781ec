use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rust_rabbit_rpc::rabbitmq::transport::{MessageProperties, QueueOptions};
use rust_rabbit_rpc::{AmqpClient, MemoryBroker, MessagePayload, ReceiveOptions, SendOptions};
use tokio::sync::Semaphore;

use crate::support::{connected, eventually};

fn counting_handler(
    calls: &Arc<AtomicUsize>,
) -> impl Fn(MessagePayload) -> futures::future::Ready<anyhow::Result<Option<MessagePayload>>>
       + Send
       + Sync
       + 'static {
    let calls = Arc::clone(calls);
    move |_payload: MessagePayload| {
        calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(None))
    }
}

async fn publish(client: &AmqpClient, queue: &str, n: i64) {
    client
        .send_to_queue(queue, &MessagePayload::ok(n), SendOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn handled_messages_are_acknowledged() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = client
        .receive_from_queue("tasks", counting_handler(&calls), ReceiveOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("tasks"), 1);

    for n in 0..3 {
        publish(&client, "tasks", n).await;
    }

    eventually(|| calls.load(Ordering::SeqCst) == 3).await;
    eventually(|| broker.unacked_count() == 0).await;
    assert_eq!(broker.queue_depth("tasks"), 0);

    subscription.close().await.unwrap();
}

#[tokio::test]
async fn failed_handlers_are_not_redelivered() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let subscription = client
        .receive_from_queue(
            "tasks",
            move |_payload: MessagePayload| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Option<MessagePayload>, _>(anyhow::anyhow!("cannot process")) }
            },
            ReceiveOptions::default(),
        )
        .await
        .unwrap();

    publish(&client, "tasks", 1).await;

    eventually(|| calls.load(Ordering::SeqCst) == 1).await;
    eventually(|| broker.unacked_count() == 0).await;
    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.queue_depth("tasks"), 0);

    subscription.close().await.unwrap();
}

#[tokio::test]
async fn non_json_deliveries_are_left_unacknowledged() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = client
        .receive_from_queue("tasks", counting_handler(&calls), ReceiveOptions::default())
        .await
        .unwrap();

    let channel = client.create_channel().await.unwrap();
    channel
        .assert_queue(
            "tasks",
            QueueOptions {
                durable: true,
                exclusive: false,
            },
        )
        .await
        .unwrap();
    channel
        .publish(
            "",
            "tasks",
            b"plain words",
            MessageProperties::default().with_content_type("text/plain"),
        )
        .await
        .unwrap();
    channel.close().await.unwrap();

    eventually(|| broker.unacked_count() == 1).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // closing the consumer's channel hands the message back to the queue
    subscription.close().await.unwrap();
    assert_eq!(broker.queue_depth("tasks"), 1);
}

#[tokio::test]
async fn prefetch_limits_messages_in_flight() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let gate = Arc::new(Semaphore::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let subscription = client
        .receive_from_queue(
            "slow",
            {
                let gate = Arc::clone(&gate);
                let done = Arc::clone(&done);
                move |_payload: MessagePayload| {
                    let gate = Arc::clone(&gate);
                    let done = Arc::clone(&done);
                    async move {
                        gate.acquire().await?.forget();
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(None)
                    }
                }
            },
            ReceiveOptions::default().with_prefetch(1),
        )
        .await
        .unwrap();

    for n in 0..3 {
        publish(&client, "slow", n).await;
    }

    eventually(|| broker.unacked_count() == 1).await;
    assert_eq!(broker.queue_depth("slow"), 2);
    assert_eq!(done.load(Ordering::SeqCst), 0);

    gate.add_permits(3);
    eventually(|| done.load(Ordering::SeqCst) == 3).await;
    eventually(|| broker.unacked_count() == 0).await;
    assert_eq!(broker.queue_depth("slow"), 0);

    subscription.close().await.unwrap();
}

#[tokio::test]
async fn auto_close_channel_stops_after_one_message() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = client
        .receive_from_queue(
            "once",
            counting_handler(&calls),
            ReceiveOptions::default().with_auto_close_channel(true),
        )
        .await
        .unwrap();

    publish(&client, "once", 1).await;
    eventually(|| !subscription.is_active()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.connection().channel_count(), 0);

    publish(&client, "once", 2).await;
    assert_eq!(broker.queue_depth("once"), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn without_ack_failures_do_not_hold_messages() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let subscription = client
        .receive_from_queue(
            "fire-and-forget",
            move |_payload: MessagePayload| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<Option<MessagePayload>, _>(anyhow::anyhow!("ignored")) }
            },
            ReceiveOptions::default().with_ack(false),
        )
        .await
        .unwrap();

    for n in 0..2 {
        publish(&client, "fire-and-forget", n).await;
    }

    eventually(|| calls.load(Ordering::SeqCst) == 2).await;
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("fire-and-forget"), 0);

    subscription.close().await.unwrap();
}

#[tokio::test]
async fn closed_subscriptions_stop_consuming() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    let calls = Arc::new(AtomicUsize::new(0));

    let subscription = client
        .receive_from_queue("tasks", counting_handler(&calls), ReceiveOptions::default())
        .await
        .unwrap();
    assert!(subscription.is_active());
    assert_eq!(subscription.queue(), "tasks");

    subscription.close().await.unwrap();
    assert_eq!(broker.consumer_count("tasks"), 0);
    assert_eq!(client.connection().channel_count(), 0);

    publish(&client, "tasks", 1).await;
    tokio::task::yield_now().await;
    assert_eq!(broker.queue_depth("tasks"), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_durable_queues_must_match_their_declaration() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;

    publish(&client, "durable-only", 1).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let result = client
        .receive_from_queue(
            "durable-only",
            counting_handler(&calls),
            ReceiveOptions::default().with_durable(false),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(client.connection().channel_count(), 0);
}
