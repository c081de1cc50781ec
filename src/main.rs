use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rust_rabbit_rpc::config::resolve_config;
use rust_rabbit_rpc::rabbitmq::lapin_transport::LapinTransport;
use rust_rabbit_rpc::rabbitmq::transport::Transport;
use rust_rabbit_rpc::rabbitmq::{invoke_action_with_payload, ConnectionEvent};
use rust_rabbit_rpc::{
    AmqpClient, MemoryBroker, MessagePayload, ReceiveOptions, RpcClient, RpcServer, SendOptions,
};

const RPC_QUEUE: &str = "rpc.multiply";
const EVENTS_EXCHANGE: &str = "demo.events";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = resolve_config().context("Failed to load broker configuration")?;

    // `--memory` runs against the in-process broker instead of RabbitMQ.
    let transport: Arc<dyn Transport> = if std::env::args().any(|arg| arg == "--memory") {
        info!("Using the in-process broker");
        Arc::new(MemoryBroker::new().transport())
    } else {
        info!("Using RabbitMQ at {}", config.url);
        Arc::new(LapinTransport::new().with_connection_name("rust-rabbit-rpc-demo"))
    };

    let client = AmqpClient::connect_from_config(&config, transport);
    let mut events = client.connection().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Blocked { reason } => info!("Broker blocked the connection: {}", reason),
                other => info!("Connection event: {:?}", other),
            }
        }
    });

    let server = RpcServer::new(client.clone());
    let multiply = server
        .receive_from_queue(
            RPC_QUEUE,
            invoke_action_with_payload(|value: i64| async move { Ok::<_, anyhow::Error>(value * 10) }),
            ReceiveOptions::default(),
        )
        .await?;

    let listener = client
        .listen(
            EVENTS_EXCHANGE,
            |routing_key: String, payload: MessagePayload| async move {
                info!(routing_key = %routing_key, data = %payload.data(), "Received broadcast");
                Ok::<Option<MessagePayload>, anyhow::Error>(None)
            },
            ReceiveOptions::default(),
        )
        .await?;

    let rpc = RpcClient::new(client.clone()).with_timeout(Duration::from_secs(5));
    let (one, two) = (MessagePayload::ok(1), MessagePayload::ok(2));
    let (a, b) = tokio::join!(
        rpc.send_to_queue(RPC_QUEUE, &one, SendOptions::default()),
        rpc.send_to_queue(RPC_QUEUE, &two, SendOptions::default()),
    );
    info!("1 * 10 = {}", a?.data());
    info!("2 * 10 = {}", b?.data());

    let product: Value = rpc.call(RPC_QUEUE, &json!(7)).await?;
    info!("7 * 10 = {}", product);

    let correlation_id = client
        .broadcast(EVENTS_EXCHANGE, &MessagePayload::ok("hello"), SendOptions::default())
        .await?;
    info!(correlation_id = %correlation_id, "Broadcast sent");

    tokio::time::sleep(Duration::from_millis(200)).await;

    multiply.close().await?;
    listener.close().await?;
    client.shutdown().await;
    info!("Done");
    Ok(())
}
