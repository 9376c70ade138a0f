//! Minimal end-to-end demonstration of the EPCP client: configure an HTTP
//! endpoint, publish a blocking and a non-blocking item, watch subscription
//! events, then shut down cleanly.
//!
//! Run with `cargo run --example publish_demo -- https://api.example.com/`.

use std::sync::Arc;

use epcp_client::{ConfigEntry, Format, Item, Orchestrator, SubscriptionEvent, Value};
use tracing::info;

struct JsonBody {
    text: String,
}

impl Format for JsonBody {
    fn name(&self) -> String {
        "json".to_owned()
    }

    fn export(&self) -> Value {
        let mut value = Value::map();
        value.insert("text", Value::Text(self.text.clone()));
        value
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let uri = std::env::args().nth(1).unwrap_or_else(|| "https://api.example.com/".to_owned());

    let orchestrator = Orchestrator::new();
    orchestrator.set_sub_callback(Arc::new(|event: SubscriptionEvent| match event {
        SubscriptionEvent::Sub(channel) => info!(channel, "channel now has at least one subscriber"),
        SubscriptionEvent::Unsub(channel) => info!(channel, "channel has no more subscribers"),
    }));

    orchestrator
        .apply_config(vec![ConfigEntry {
            uri: Some(uri),
            require_subscribers: false,
            ..Default::default()
        }])
        .await
        .expect("invalid demo configuration");

    let item = Item::new(vec![Box::new(JsonBody { text: "hello from the demo".to_owned() })]);
    orchestrator
        .publish("demo-channel", Arc::new(item), true, None)
        .await
        .expect("blocking publish failed");
    info!("blocking publish acknowledged");

    let item = Item::new(vec![Box::new(JsonBody { text: "fire and forget".to_owned() })]);
    orchestrator
        .publish(
            "demo-channel",
            Arc::new(item),
            false,
            Some(Box::new(|success, message| {
                info!(success, message, "async publish settled");
            })),
        )
        .await
        .expect("non-blocking publish failed to enqueue");

    orchestrator.wait_all_sent().await;
    orchestrator.close().await.expect("close failed");
}
