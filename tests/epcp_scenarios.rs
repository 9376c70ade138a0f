//! End-to-end scenarios for the EPCP client, driven against the mock HTTP
//! endpoint and discovery responder in `epcp-test-utils`. Mirrors the
//! end-to-end suite style of `tests/integration/e2e_export.rs`: spin up real
//! in-process peers, drive the client through its public API, assert on what
//! the peers actually observed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use epcp_client::{ConfigEntry, EpcpError, Format, Item, Orchestrator, SubscriptionEvent, Value};
use epcp_test_utils::{MockDiscoveryResponder, MockEpcpServer};

struct TextFormat {
    name: String,
    body: String,
}

impl Format for TextFormat {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn export(&self) -> Value {
        let mut value = Value::map();
        value.insert("body", Value::Text(self.body.clone()));
        value
    }
}

fn text_item(name: &str, body: &str) -> Item {
    Item::new(vec![Box::new(TextFormat { name: name.to_owned(), body: body.to_owned() })])
}

/// S1: a single unauthenticated HTTP endpoint, one blocking publish.
#[tokio::test]
async fn blocking_publish_reaches_the_single_configured_endpoint() {
    let server = MockEpcpServer::start().await;
    let orchestrator = Orchestrator::new();
    orchestrator
        .apply_config(vec![ConfigEntry { uri: Some(server.base_url()), ..Default::default() }])
        .await
        .unwrap();

    orchestrator
        .publish("room", Arc::new(text_item("name", "v")), true, None)
        .await
        .unwrap();

    let items = server.received_items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["channel"], "room");
    assert_eq!(items[0]["name"]["body"], "v");
    assert_eq!(server.received_auth_headers(), vec![None]);

    orchestrator.close().await.unwrap();
}

/// S2: a bearer-authenticated endpoint, 25 non-blocking publishes batching
/// into POSTs of [10, 10, 5], every one carrying the bearer header.
#[tokio::test]
async fn async_publishes_batch_by_ten_and_all_carry_the_bearer_header() {
    let server = MockEpcpServer::start().await;
    let orchestrator = Orchestrator::new();
    orchestrator
        .apply_config(vec![ConfigEntry {
            uri: Some(server.base_url()),
            iss: Some("my-issuer".to_owned()),
            key: Some("signing-secret".to_owned()),
            ..Default::default()
        }])
        .await
        .unwrap();

    for i in 0..25 {
        orchestrator
            .publish("c", Arc::new(text_item("name", &format!("v{i}"))), false, None)
            .await
            .unwrap();
    }
    orchestrator.wait_all_sent().await;

    assert_eq!(server.received_items().len(), 25);
    let auth_headers = server.received_auth_headers();
    assert_eq!(auth_headers.len(), 25);
    assert!(auth_headers.iter().all(|h| matches!(h, Some(v) if v.starts_with("Bearer "))));

    orchestrator.close().await.unwrap();
}

/// S3: three HTTP endpoints, one of which fails; the aggregate callback
/// fires exactly once with the first failure's message.
#[tokio::test]
async fn aggregate_callback_fires_once_with_the_first_failure_message() {
    let server1 = MockEpcpServer::start().await;
    let server2 = MockEpcpServer::start().await;
    let server3 = MockEpcpServer::start().await;
    server1.set_publish_status(500);
    server3.set_publish_status(500);

    let orchestrator = Orchestrator::new();
    orchestrator
        .apply_config(vec![
            ConfigEntry { uri: Some(server1.base_url()), ..Default::default() },
            ConfigEntry { uri: Some(server2.base_url()), ..Default::default() },
            ConfigEntry { uri: Some(server3.base_url()), ..Default::default() },
        ])
        .await
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let outcome: Arc<Mutex<Option<(bool, String)>>> = Arc::new(Mutex::new(None));
    let calls2 = calls.clone();
    let outcome2 = outcome.clone();
    orchestrator
        .publish(
            "room",
            Arc::new(text_item("name", "v")),
            false,
            Some(Box::new(move |success, message| {
                calls2.fetch_add(1, Ordering::SeqCst);
                *outcome2.lock().unwrap() = Some((success, message));
            })),
        )
        .await
        .unwrap();

    orchestrator.wait_all_sent().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let (success, message) = outcome.lock().unwrap().clone().unwrap();
    assert!(!success);
    assert!(message.contains("500"));

    orchestrator.close().await.unwrap();
}

/// S4: `require_subscribers` gates publishes on the monitor's known set —
/// publishes to a subscribed channel reach the server, publishes to an
/// unsubscribed one are dropped with a synthetic success callback.
#[tokio::test]
async fn require_subscribers_gates_publishes_on_known_channels() {
    let server = MockEpcpServer::start().await;
    server.push_subscription_event("a", true);

    let orchestrator = Orchestrator::new();
    orchestrator
        .apply_config(vec![ConfigEntry {
            uri: Some(server.base_url()),
            require_subscribers: true,
            ..Default::default()
        }])
        .await
        .unwrap();

    // Give the background monitor time to run its initial catch-up fetch.
    tokio::time::sleep(Duration::from_millis(200)).await;

    orchestrator
        .publish("a", Arc::new(text_item("name", "v")), true, None)
        .await
        .unwrap();

    let dropped = Arc::new(Mutex::new(None));
    let dropped2 = dropped.clone();
    orchestrator
        .publish(
            "b",
            Arc::new(text_item("name", "v")),
            true,
            Some(Box::new(move |success, message| {
                *dropped2.lock().unwrap() = Some((success, message));
            })),
        )
        .await
        .unwrap();

    assert_eq!(server.received_items().len(), 1);
    assert_eq!(server.received_items()[0]["channel"], "a");
    let (success, message) = dropped.lock().unwrap().clone().unwrap();
    assert!(success);
    assert!(message.is_empty());

    orchestrator.close().await.unwrap();
}

/// The orchestrator's sub-callback fires exactly once per channel as it goes
/// from "no configured endpoint reports a subscriber" to "at least one does",
/// even though the lone configured monitor itself already de-duplicates.
#[tokio::test]
async fn sub_callback_fires_once_for_a_channels_first_subscriber() {
    let server = MockEpcpServer::start().await;

    let orchestrator = Orchestrator::new();
    let events: Arc<Mutex<Vec<SubscriptionEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events2 = events.clone();
    orchestrator.set_sub_callback(Arc::new(move |event| events2.lock().unwrap().push(event)));

    orchestrator
        .apply_config(vec![ConfigEntry {
            uri: Some(server.base_url()),
            require_subscribers: true,
            ..Default::default()
        }])
        .await
        .unwrap();

    server.push_subscription_event("room", true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.push_subscription_event("room", false);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let seen = events.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![SubscriptionEvent::Sub("room".to_owned()), SubscriptionEvent::Unsub("room".to_owned())]
    );

    orchestrator.close().await.unwrap();
}

/// Closing an orchestrator rejects any further calls.
#[tokio::test]
async fn closed_orchestrator_rejects_further_publishes() {
    let orchestrator = Orchestrator::new();
    orchestrator.close().await.unwrap();
    let err = orchestrator.publish("room", Arc::new(Item::new(vec![])), true, None).await.unwrap_err();
    assert!(matches!(err, EpcpError::UseAfterClose));
}

/// S6: a command-only bus endpoint resolves its push URI through the
/// discovery handshake, substituting the command host into the wildcard
/// data URI the discovery responder advertises.
#[tokio::test]
async fn bus_endpoint_resolves_push_uri_via_discovery() {
    let responder = MockDiscoveryResponder::start(
        Some("tcp://*:5560".to_owned()),
        Some("tcp://*:5561".to_owned()),
    );

    let orchestrator = Orchestrator::new();
    orchestrator
        .apply_config(vec![ConfigEntry {
            zmq_uri: Some(responder.uri().to_owned()),
            ..Default::default()
        }])
        .await
        .unwrap();

    // A successful `apply_config` with only a `zmq_uri` proves discovery
    // resolved a usable `publish_pull` URI (push mode); `resolve_bus_plan`
    // would otherwise have failed the whole call with `InvalidConfig`.
    orchestrator.close().await.unwrap();
}
