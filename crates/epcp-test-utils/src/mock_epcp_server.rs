// mock_epcp_server: An in-process HTTP endpoint speaking the EPCP wire
// protocol (`/publish/`, `/subscriptions/items/`, `/subscriptions/stream/`),
// for integration-testing the client's C3/C4 components without a real
// EPCP server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use epcp_protocol::{BulkItemsResponse, Cursor, StreamRecord, SubscriptionItem};
use tokio::sync::broadcast;

struct HistoryEntry {
    cursor_raw: String,
    item: SubscriptionItem,
}

struct Inner {
    history: Mutex<Vec<HistoryEntry>>,
    history_lost: AtomicBool,
    next_index: AtomicU64,
    publish_status: AtomicU16,
    received_items: Mutex<Vec<serde_json::Value>>,
    received_auth: Mutex<Vec<Option<String>>>,
    stream_tx: broadcast::Sender<String>,
}

/// A mock EPCP HTTP endpoint for integration testing.
///
/// Binds to a random local port. Tests drive the subscription side with
/// [`MockEpcpServer::push_subscription_event`] and inspect the publish side
/// with [`MockEpcpServer::received_items`]/[`MockEpcpServer::received_auth_headers`].
pub struct MockEpcpServer {
    addr: std::net::SocketAddr,
    inner: Arc<Inner>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockEpcpServer {
    /// Start the server, binding to a random available port.
    pub async fn start() -> Self {
        let (stream_tx, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            history: Mutex::new(Vec::new()),
            history_lost: AtomicBool::new(false),
            next_index: AtomicU64::new(0),
            publish_status: AtomicU16::new(200),
            received_items: Mutex::new(Vec::new()),
            received_auth: Mutex::new(Vec::new()),
            stream_tx,
        });

        let app = Router::new()
            .route("/publish/", post(publish_handler))
            .route("/subscriptions/items/", get(bulk_items_handler))
            .route("/subscriptions/stream/", get(stream_handler))
            .with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock epcp server crashed");
        });

        MockEpcpServer { addr, inner, _task: task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Every item body received by `/publish/`, flattened across batches.
    pub fn received_items(&self) -> Vec<serde_json::Value> {
        self.inner.received_items.lock().expect("received_items mutex poisoned").clone()
    }

    /// The `Authorization` header (if any) attached to each `/publish/` POST,
    /// in arrival order.
    pub fn received_auth_headers(&self) -> Vec<Option<String>> {
        self.inner.received_auth.lock().expect("received_auth mutex poisoned").clone()
    }

    /// Make the next (and every subsequent) `/publish/` respond with `status`.
    pub fn set_publish_status(&self, status: u16) {
        self.inner.publish_status.store(status, Ordering::SeqCst);
    }

    /// Make `/subscriptions/items/` 404, simulating the server having lost
    /// its subscription history.
    pub fn set_history_lost(&self, lost: bool) {
        self.inner.history_lost.store(lost, Ordering::SeqCst);
    }

    /// Record a subscribe/unsubscribe transition, visible to a subsequent
    /// bulk fetch and to any already-connected stream client.
    pub fn push_subscription_event(&self, channel: impl Into<String>, subscribed: bool) {
        let idx = self.inner.next_index.fetch_add(1, Ordering::SeqCst);
        let cursor_raw = make_cursor(idx);
        let prev_cursor = if idx == 0 { None } else { Some(make_cursor(idx - 1)) };
        let item = SubscriptionItem {
            state: if subscribed { "subscribed".to_owned() } else { "unsubscribed".to_owned() },
            channel: channel.into(),
        };

        self.inner.history.lock().expect("history mutex poisoned").push(HistoryEntry {
            cursor_raw: cursor_raw.clone(),
            item: item.clone(),
        });

        let record = StreamRecord { item, prev_cursor, cursor: cursor_raw };
        let mut line = serde_json::to_string(&record).expect("stream record encoding failed");
        line.push('\n');
        // No subscribers is fine: the line is simply dropped.
        let _ = self.inner.stream_tx.send(line);
    }
}

fn make_cursor(idx: u64) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(format!("p{idx}_{idx}"))
}

async fn publish_handler(State(inner): State<Arc<Inner>>, headers: axum::http::HeaderMap, Json(body): Json<serde_json::Value>) -> Response {
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).map(str::to_owned);
    if let Some(items) = body.get("items").and_then(|v| v.as_array()) {
        let mut received = inner.received_items.lock().expect("received_items mutex poisoned");
        let mut received_auth = inner.received_auth.lock().expect("received_auth mutex poisoned");
        for item in items {
            received.push(item.clone());
            received_auth.push(auth.clone());
        }
    }

    let status = inner.publish_status.load(Ordering::SeqCst);
    StatusCode::from_u16(status).unwrap_or(StatusCode::OK).into_response()
}

async fn bulk_items_handler(State(inner): State<Arc<Inner>>, Query(params): Query<HashMap<String, String>>) -> Response {
    if inner.history_lost.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let since_cursor = params
        .get("since")
        .and_then(|s| s.strip_prefix("cursor:"))
        .map(Cursor::parse);

    let history = inner.history.lock().expect("history mutex poisoned");
    let start = match since_cursor {
        None => 0,
        Some(target) => history
            .iter()
            .position(|entry| Cursor::parse(&entry.cursor_raw) == target)
            .map_or(history.len(), |i| i + 1),
    };

    let items: Vec<SubscriptionItem> = history[start..].iter().map(|e| e.item.clone()).collect();
    let last_cursor = history.last().map(|e| e.cursor_raw.clone());
    Json(BulkItemsResponse { items, last_cursor }).into_response()
}

async fn stream_handler(State(inner): State<Arc<Inner>>) -> Response {
    let rx = inner.stream_tx.subscribe();
    let body_stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(line) => return Some((Ok::<_, std::io::Error>(Bytes::from(line)), rx)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Response::builder()
        .status(StatusCode::OK)
        .body(Body::from_stream(body_stream))
        .expect("building stream response failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_records_items_and_auth_header() {
        let server = MockEpcpServer::start().await;
        let client = reqwest::Client::new();
        client
            .post(format!("{}/publish/", server.base_url()))
            .header("Authorization", "Bearer test-token")
            .json(&serde_json::json!({"items": [{"channel": "room", "json": {"a": 1}}]}))
            .send()
            .await
            .unwrap();

        assert_eq!(server.received_items().len(), 1);
        assert_eq!(server.received_auth_headers(), vec![Some("Bearer test-token".to_owned())]);
    }

    #[tokio::test]
    async fn publish_status_is_configurable() {
        let server = MockEpcpServer::start().await;
        server.set_publish_status(503);
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/publish/", server.base_url()))
            .json(&serde_json::json!({"items": []}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 503);
    }

    #[tokio::test]
    async fn bulk_fetch_paginates_to_an_empty_page() {
        let server = MockEpcpServer::start().await;
        server.push_subscription_event("room", true);
        server.push_subscription_event("room", false);

        let client = reqwest::Client::new();
        let first: BulkItemsResponse = client
            .get(format!("{}/subscriptions/items/", server.base_url()))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);

        let cursor = first.last_cursor.unwrap();
        let second: BulkItemsResponse = client
            .get(format!("{}/subscriptions/items/", server.base_url()))
            .query(&[("since", format!("cursor:{cursor}"))])
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(second.items.is_empty());
    }

    #[tokio::test]
    async fn history_lost_flag_makes_bulk_fetch_404() {
        let server = MockEpcpServer::start().await;
        server.set_history_lost(true);
        let client = reqwest::Client::new();
        let response = client
            .get(format!("{}/subscriptions/items/", server.base_url()))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }
}
