use std::time::Duration;

use futures::StreamExt;
use rust_rabbit_rpc::rabbitmq::transport::{MessageProperties, QueueOptions};
use rust_rabbit_rpc::{
    MemoryBroker, MessagePayload, RabbitMQError, ReceiveOptions, ReplyTo, RpcClient, RpcServer,
    SendOptions, SendOutcome, SerializedError, JSON_CONTENT_TYPE,
};
use serde_json::json;

use crate::support::{client, connected};

async fn serve_times_ten(server: &RpcServer, queue: &str) {
    server
        .receive_from_queue(
            queue,
            |payload: MessagePayload| async move {
                let n = payload.data().as_i64().unwrap_or_default();
                Ok::<_, anyhow::Error>(Some(MessagePayload::ok(n * 10)))
            },
            ReceiveOptions::default(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_replies_are_matched_by_correlation_id() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    serve_times_ten(&RpcServer::new(client.clone()), "math").await;

    let rpc = RpcClient::new(client.clone());
    let (first, second) = (MessagePayload::ok(1), MessagePayload::ok(2));
    let (one, two) = tokio::join!(
        rpc.send_to_queue("math", &first, SendOptions::default()),
        rpc.send_to_queue("math", &second, SendOptions::default()),
    );

    assert_eq!(one.unwrap(), MessagePayload::ok(10));
    assert_eq!(two.unwrap(), MessagePayload::ok(20));
    assert_eq!(client.pending_replies(), 0);
}

#[tokio::test]
async fn many_in_flight_requests_each_get_their_own_reply() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    serve_times_ten(&RpcServer::new(client.clone()), "math").await;

    let rpc = RpcClient::new(client.clone());
    let requests = (0..20).map(|n| {
        let rpc = rpc.clone();
        async move {
            let reply = rpc
                .send_to_queue("math", &MessagePayload::ok(n), SendOptions::default())
                .await
                .unwrap();
            (n, reply)
        }
    });

    for (n, reply) in futures::future::join_all(requests).await {
        assert_eq!(reply, MessagePayload::ok(n * 10));
    }
    assert_eq!(broker.channel_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_fails_and_closes_the_channel() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;

    let err = client
        .send_to_queue(
            "nobody-home",
            &MessagePayload::ok(1),
            SendOptions::default()
                .expect_reply()
                .with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RabbitMQError::Timeout(limit) if limit == Duration::from_millis(50)));
    assert_eq!(client.connection().channel_count(), 0);
    assert_eq!(broker.channel_count(), 0);
    assert_eq!(client.pending_replies(), 0);
}

#[tokio::test]
async fn handler_errors_come_back_as_error_envelopes() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    RpcServer::new(client.clone())
        .receive_from_queue(
            "fragile",
            |_payload: MessagePayload| async move {
                Err::<Option<MessagePayload>, _>(anyhow::anyhow!("boom"))
            },
            ReceiveOptions::default(),
        )
        .await
        .unwrap();

    let raw = client
        .send_to_queue(
            "fragile",
            &MessagePayload::ok(1),
            SendOptions::default().expect_reply(),
        )
        .await
        .unwrap()
        .into_reply()
        .unwrap();
    assert_eq!(raw["data"], json!(null));
    assert_eq!(raw["error"]["message"], json!("boom"));

    let reply = RpcClient::new(client.clone())
        .send_to_queue("fragile", &MessagePayload::ok(2), SendOptions::default())
        .await
        .unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.data(), &json!(null));

    // failed deliveries are dropped, not requeued
    assert_eq!(broker.queue_depth("fragile"), 0);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn handler_panics_come_back_as_error_envelopes() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    RpcServer::new(client.clone())
        .receive_from_queue(
            "panicky",
            |payload: MessagePayload| async move {
                if payload.data().is_number() {
                    panic!("unexpected number");
                }
                Ok::<_, anyhow::Error>(None)
            },
            ReceiveOptions::default(),
        )
        .await
        .unwrap();

    let reply = RpcClient::new(client.clone())
        .send_to_queue("panicky", &MessagePayload::ok(1), SendOptions::default())
        .await
        .unwrap();

    let error = reply.error().unwrap();
    assert_eq!(error.name, "HandlerFailure");
    assert!(error.message.contains("unexpected number"));
}

#[tokio::test]
async fn handlers_returning_nothing_reply_with_an_empty_envelope() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    RpcServer::new(client.clone())
        .receive_from_queue(
            "sink",
            |_payload: MessagePayload| async move { Ok::<_, anyhow::Error>(None) },
            ReceiveOptions::default(),
        )
        .await
        .unwrap();

    let reply = RpcClient::new(client)
        .send_to_queue("sink", &MessagePayload::ok("x"), SendOptions::default())
        .await
        .unwrap();
    assert_eq!(reply, MessagePayload::make(None));
}

#[tokio::test]
async fn malformed_replies_are_rejected() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;

    let channel = client.create_channel().await.unwrap();
    channel
        .assert_queue(
            "weird",
            QueueOptions {
                durable: true,
                exclusive: false,
            },
        )
        .await
        .unwrap();
    let mut requests = channel.consume("weird", true).await.unwrap();
    tokio::spawn(async move {
        let request = requests.next().await.unwrap().unwrap();
        let properties = MessageProperties::default()
            .with_content_type(JSON_CONTENT_TYPE)
            .with_correlation_id(request.properties.correlation_id.clone().unwrap());
        channel
            .publish(
                "",
                request.properties.reply_to.as_deref().unwrap(),
                br#"{"result":1}"#,
                properties,
            )
            .await
            .unwrap();
    });

    let err = RpcClient::new(client)
        .send_to_queue("weird", &MessagePayload::ok(1), SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::InvalidReply(_)));
}

#[tokio::test]
async fn replies_for_other_requests_are_skipped() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;

    let channel = client.create_channel().await.unwrap();
    for queue in ["lookups", "replies"] {
        channel
            .assert_queue(
                queue,
                QueueOptions {
                    durable: true,
                    exclusive: false,
                },
            )
            .await
            .unwrap();
    }
    let mut requests = channel.consume("lookups", true).await.unwrap();
    tokio::spawn(async move {
        let request = requests.next().await.unwrap().unwrap();
        let reply_to = request.properties.reply_to.clone().unwrap();
        let own_id = request.properties.correlation_id.clone().unwrap();

        for (correlation_id, body) in [
            ("other".to_string(), br#"{"data":"wrong"}"#),
            (own_id, br#"{"data":"right"}"#),
        ] {
            let properties = MessageProperties::default()
                .with_content_type(JSON_CONTENT_TYPE)
                .with_correlation_id(correlation_id);
            channel.publish("", &reply_to, body, properties).await.unwrap();
        }
    });

    let outcome = client
        .send_to_queue(
            "lookups",
            &MessagePayload::ok("key"),
            SendOptions::default()
                .with_correlation_id("mine")
                .with_reply_to(ReplyTo::Queue("replies".to_string()))
                .with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(outcome, SendOutcome::Reply(json!({ "data": "right" })));
    assert_eq!(client.pending_replies(), 0);
    assert_eq!(broker.queue_depth("replies"), 0);
}

#[tokio::test]
async fn invalid_payloads_fail_before_any_channel_is_opened() {
    let broker = MemoryBroker::new();
    // never connected: a channel request would wait forever
    let client = client(&broker);

    let err = client
        .send_to_queue(
            "jobs",
            &MessagePayload::err(SerializedError::new("", "")),
            SendOptions::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RabbitMQError::InvalidPayload(_)));
    assert_eq!(broker.channel_count(), 0);
}

#[tokio::test]
async fn typed_calls_round_trip() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    serve_times_ten(&RpcServer::new(client.clone()), "math").await;

    let rpc = RpcClient::new(client).with_timeout(Duration::from_secs(1));
    let result: i64 = rpc.call("math", &4).await.unwrap();
    assert_eq!(result, 40);
}

#[tokio::test]
async fn without_reply_the_correlation_id_is_returned() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;

    let outcome = client
        .send_to_queue(
            "jobs",
            &MessagePayload::default(),
            SendOptions::default().with_correlation_id("job-1"),
        )
        .await
        .unwrap();

    assert_eq!(outcome, SendOutcome::Published("job-1".to_string()));
    assert_eq!(broker.channel_count(), 0);
}

#[tokio::test]
async fn reusing_a_pending_correlation_id_is_rejected() {
    let broker = MemoryBroker::new();
    let client = connected(&broker).await;
    serve_times_ten(&RpcServer::new(client.clone()), "math").await;

    let rpc = RpcClient::new(client.clone());
    let options = SendOptions::default().with_correlation_id("same");
    let (one, two) = (MessagePayload::ok(1), MessagePayload::ok(2));
    let (a, b) = tokio::join!(
        rpc.send_to_queue("math", &one, options.clone()),
        rpc.send_to_queue("math", &two, options),
    );

    let results = [a, b];
    let duplicates = results
        .iter()
        .filter(|r| matches!(r, Err(RabbitMQError::DuplicateCorrelationId(_))))
        .count();
    assert_eq!(duplicates, 1);
    assert!(results.iter().any(|r| r.is_ok()));
}
