//! HTTP publish worker (C3).
//!
//! Grounded in `original_source/src/pubcontrolclient.py`: a lazily-spawned
//! single worker task per endpoint batches up to `BATCH_LIMIT` pending
//! requests into one POST, draining in arrival order and flushing any
//! partial batch before honoring a `stop` sentinel. The surrounding Rust
//! idiom (owned `reqwest::Client`, `tokio::spawn`ed worker, `tracing` at
//! session boundaries) follows `services/forwarder/src/uplink.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthConfig;
use crate::error::{EpcpError, Result};
use crate::item::Item;
use crate::subscription_monitor::SubscriptionMonitor;

/// Max pending requests folded into a single POST. `spec.md` §4.3, §8 (I-7).
const BATCH_LIMIT: usize = 10;

/// Invoked exactly once with `(success, message)` after a publish is known
/// to have succeeded or failed.
pub type Callback = Box<dyn FnOnce(bool, String) + Send>;

enum WorkerMsg {
    Request {
        auth: Option<String>,
        item: Json,
        callback: Option<Callback>,
    },
    Stop,
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerMsg>,
    join: JoinHandle<()>,
}

/// A batching async publisher for one HTTP endpoint.
pub struct HttpPublisher {
    uri: String,
    client: reqwest::Client,
    auth: Arc<AuthConfig>,
    require_subscribers: bool,
    monitor: Option<Arc<SubscriptionMonitor>>,
    worker: Mutex<Option<WorkerHandle>>,
    closed: AtomicBool,
}

impl HttpPublisher {
    pub fn new(uri: impl Into<String>, require_subscribers: bool) -> Self {
        HttpPublisher {
            uri: uri.into(),
            client: reqwest::Client::new(),
            auth: Arc::new(AuthConfig::new()),
            require_subscribers,
            monitor: None,
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<SubscriptionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn require_subscribers(&self) -> bool {
        self.require_subscribers
    }

    pub fn monitor(&self) -> Option<&Arc<SubscriptionMonitor>> {
        self.monitor.as_ref()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn closed_flag(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publish `item` on `channel`. See `spec.md` §4.3 for the full contract.
    pub async fn publish(
        &self,
        channel: &str,
        item: &Item,
        blocking: bool,
        callback: Option<Callback>,
    ) -> Result<()> {
        if self.closed_flag() {
            return Err(EpcpError::UseAfterClose);
        }

        if self.require_subscribers {
            if let Some(monitor) = &self.monitor {
                if monitor.closed() {
                    return Self::settle(blocking, callback, EpcpError::SubscribersUnknown);
                }
                if !monitor.is_channel_subscribed_to(channel) {
                    debug!(channel, "dropping publish: no known subscribers");
                    if let Some(cb) = callback {
                        cb(true, String::new());
                    }
                    return Ok(());
                }
            }
        }

        // Snapshot uri/auth and inject `channel` at call time — never at
        // dispatch time. See `spec.md` §4.3 and §9 ("Auth header snapshotting").
        let auth = self.auth.current_header()?;
        let mut item_json = item.export(false, false)?.into_json();
        if let serde_json::Value::Object(map) = &mut item_json {
            map.insert("channel".to_owned(), serde_json::Value::String(channel.to_owned()));
        }

        if blocking {
            match post_items(&self.client, &self.uri, auth.as_deref(), vec![item_json]).await {
                Ok(()) => {
                    if let Some(cb) = callback {
                        cb(true, String::new());
                    }
                    Ok(())
                }
                Err(e) => {
                    if let Some(cb) = callback {
                        cb(false, e.to_string());
                        Ok(())
                    } else {
                        Err(e)
                    }
                }
            }
        } else {
            let tx = self.ensure_worker();
            let _ = tx.send(WorkerMsg::Request {
                auth,
                item: item_json,
                callback,
            });
            Ok(())
        }
    }

    fn settle(blocking: bool, callback: Option<Callback>, err: EpcpError) -> Result<()> {
        if blocking {
            return Err(err);
        }
        if let Some(cb) = callback {
            cb(false, err.to_string());
        }
        Ok(())
    }

    fn ensure_worker(&self) -> mpsc::UnboundedSender<WorkerMsg> {
        let mut guard = self.worker.lock().expect("worker mutex poisoned");
        if let Some(handle) = guard.as_ref() {
            return handle.tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let uri = self.uri.clone();
        let join = tokio::spawn(worker_loop(client, uri, rx));
        *guard = Some(WorkerHandle {
            tx: tx.clone(),
            join,
        });
        tx
    }

    /// Block until the worker has drained all requests ahead of a stop
    /// sentinel and exited. A subsequent async publish spawns a fresh worker.
    pub async fn wait_all_sent(&self) {
        let handle = {
            let mut guard = self.worker.lock().expect("worker mutex poisoned");
            guard.take()
        };
        if let Some(handle) = handle {
            let _ = handle.tx.send(WorkerMsg::Stop);
            let _ = handle.join.await;
        }
    }

    /// Mark closed (subsequent calls fail with `UseAfterClose`) and drain.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(EpcpError::UseAfterClose);
        }
        self.wait_all_sent().await;
        if let Some(monitor) = &self.monitor {
            monitor.close();
        }
        Ok(())
    }
}

async fn worker_loop(client: reqwest::Client, uri: String, mut rx: mpsc::UnboundedReceiver<WorkerMsg>) {
    info!(uri, "http publish worker started");
    loop {
        let first = match rx.recv().await {
            Some(m) => m,
            None => break,
        };

        let mut batch: Vec<(Option<String>, Json, Option<Callback>)> = Vec::new();
        let mut quit = false;
        match first {
            WorkerMsg::Stop => quit = true,
            WorkerMsg::Request { auth, item, callback } => batch.push((auth, item, callback)),
        }

        while !quit && batch.len() < BATCH_LIMIT {
            match rx.try_recv() {
                Ok(WorkerMsg::Stop) => {
                    quit = true;
                    break;
                }
                Ok(WorkerMsg::Request { auth, item, callback }) => {
                    batch.push((auth, item, callback))
                }
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            flush_batch(&client, &uri, batch).await;
        }

        if quit {
            break;
        }
    }
    info!(uri, "http publish worker stopped");
}

/// Post one batch. All items share one POST; per-request callbacks all see
/// the same all-or-nothing result. The auth header used is the first
/// request's snapshot, matching `_pubbatch` in the original implementation.
async fn flush_batch(
    client: &reqwest::Client,
    uri: &str,
    batch: Vec<(Option<String>, Json, Option<Callback>)>,
) {
    let auth = batch[0].0.clone();
    let items: Vec<Json> = batch.iter().map(|(_, item, _)| item.clone()).collect();
    let count = items.len();

    let result = post_items(client, uri, auth.as_deref(), items).await;
    let (success, message) = match &result {
        Ok(()) => (true, String::new()),
        Err(e) => (false, e.to_string()),
    };
    if !success {
        warn!(uri, count, error = %message, "http publish batch failed");
    } else {
        debug!(uri, count, "http publish batch sent");
    }

    for (_, _, callback) in batch {
        if let Some(cb) = callback {
            cb(success, message.clone());
        }
    }
}

/// Send `{"items": [...]}` to `<uri>/publish/`, with one automatic retry on
/// transport error or a server-class status in {500,502,503,504}.
/// `spec.md` §4.3 HTTP transport policy.
async fn post_items(
    client: &reqwest::Client,
    uri: &str,
    auth: Option<&str>,
    items: Vec<Json>,
) -> Result<()> {
    let url = format!("{}/publish/", uri.trim_end_matches('/'));
    let body = serde_json::json!({ "items": items });

    let mut attempt = 0;
    loop {
        let mut request = client.post(&url).json(&body);
        if let Some(auth) = auth {
            request = request.header("Authorization", auth);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(());
                }
                let retryable = matches!(status.as_u16(), 500 | 502 | 503 | 504);
                if retryable && attempt == 0 {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                let body_text = response.text().await.unwrap_or_default();
                return Err(EpcpError::Publish {
                    status: status.as_u16(),
                    body: body_text,
                });
            }
            Err(e) => {
                if attempt == 0 {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                return Err(EpcpError::PublishTransport(e.to_string()));
            }
        }
    }
}
