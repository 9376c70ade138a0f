//! Subscription monitor (C4).
//!
//! Grounded in `original_source/src/pubsubmonitor.py`: a background task
//! follows the HTTP subscription change stream, reconciling gaps with a bulk
//! catch-up fetch keyed by an opaque cursor (`epcp_protocol::Cursor`).
//! `HttpPublisher` consults the resulting set to decide whether a publish has
//! any known subscribers; the orchestrator (C7) consults the same set,
//! through [`SubscriptionSource`], to aggregate sub/unsub events across every
//! configured endpoint.
//!
//! Construction is two-phase ([`SubscriptionMonitor::new`] then
//! [`SubscriptionMonitor::start`]) so the orchestrator can register this
//! monitor as an event source *before* any network I/O can fire a callback —
//! see `spec.md` §3 ("Ownership": "the subscription monitor has a weak handle
//! to its callback; the orchestrator passes a bound callback down").

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use epcp_protocol::{BulkItemsResponse, Cursor, StreamRecord, SubscriptionItem};
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::subscription_event::{EventCallback, SubscriptionEvent, SubscriptionSource};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(64);
const CATCH_UP_TIMEOUT: Duration = Duration::from_secs(60);

/// Tracks which channels currently have at least one known subscriber on one
/// HTTP endpoint.
pub struct SubscriptionMonitor {
    subscribed: RwLock<HashSet<String>>,
    closed: AtomicBool,
}

enum Failure {
    /// 4xx, 501, or >=600: the endpoint will never recover. Shuts the
    /// monitor down permanently.
    Permanent(String),
    /// Transport errors, timeouts, and other 5xx: retry with backoff.
    Transient(String),
}

impl SubscriptionMonitor {
    /// Allocate a monitor with an empty subscription set and no background
    /// work yet. Safe to register as a [`SubscriptionSource`] immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(SubscriptionMonitor {
            subscribed: RwLock::new(HashSet::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawn the background stream/catch-up task. `on_event` is invoked for
    /// every observed subscribe/unsubscribe transition, respecting the
    /// sub-before-add / unsub-after-remove ordering of `spec.md` §4.4.
    pub fn start(self: &Arc<Self>, uri: impl Into<String>, client: reqwest::Client, on_event: EventCallback) {
        let uri = uri.into();
        let monitor = self.clone();
        tokio::spawn(async move {
            run(uri, client, monitor, on_event).await;
        });
    }

    /// Convenience for callers (and tests) that don't need the two-phase
    /// split: allocate and start in one call.
    pub fn spawn(uri: impl Into<String>, client: reqwest::Client, on_event: EventCallback) -> Arc<Self> {
        let monitor = Self::new();
        monitor.start(uri, client, on_event);
        monitor
    }

    pub fn is_channel_subscribed_to(&self, channel: &str) -> bool {
        self.subscribed.read().expect("subscription set poisoned").contains(channel)
    }

    /// True once the monitor has given up permanently. Gated publishers then
    /// fail with `SubscribersUnknown` rather than silently dropping.
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Every currently-known subscribed channel, snapshotted. Used to emit a
    /// bulk `unsub` on a 404 (`spec.md` §4.4 fetch task, step 2).
    fn known_channels(&self) -> Vec<String> {
        self.subscribed.read().expect("subscription set poisoned").iter().cloned().collect()
    }

    fn apply(&self, item: &SubscriptionItem, on_event: &EventCallback) {
        match item.state.as_str() {
            "subscribed" => {
                let already = self.subscribed.read().expect("subscription set poisoned").contains(&item.channel);
                if !already {
                    on_event(SubscriptionEvent::Sub(item.channel.clone()));
                    self.subscribed.write().expect("subscription set poisoned").insert(item.channel.clone());
                }
            }
            "unsubscribed" => {
                let present = self.subscribed.write().expect("subscription set poisoned").remove(&item.channel);
                if present {
                    on_event(SubscriptionEvent::Unsub(item.channel.clone()));
                }
            }
            other => warn!(state = other, channel = %item.channel, "subscription monitor saw unknown state"),
        }
    }

    /// Clear every known channel, firing `unsub` for each — used when the
    /// server reports (via 404) that it has lost the subscription history.
    fn clear_all(&self, on_event: &EventCallback) {
        for channel in self.known_channels() {
            let present = self.subscribed.write().expect("subscription set poisoned").remove(&channel);
            if present {
                on_event(SubscriptionEvent::Unsub(channel));
            }
        }
    }
}

impl SubscriptionSource for SubscriptionMonitor {
    fn is_channel_subscribed_to(&self, channel: &str) -> bool {
        SubscriptionMonitor::is_channel_subscribed_to(self, channel)
    }
}

fn classify_status(status: u16) -> bool {
    (status / 100 == 4) || status == 501 || status >= 600
}

async fn run(uri: String, client: reqwest::Client, monitor: Arc<SubscriptionMonitor>, on_event: EventCallback) {
    let mut cursor: Option<Cursor> = None;
    let mut backoff = INITIAL_BACKOFF;

    while !monitor.closed() {
        match bulk_catch_up(&client, &uri, &mut cursor, &monitor, &on_event).await {
            Ok(()) => {}
            Err(Failure::Permanent(msg)) => {
                warn!(uri, error = %msg, "subscription monitor permanently unhealthy");
                monitor.close();
                return;
            }
            Err(Failure::Transient(msg)) => {
                warn!(uri, error = %msg, backoff_secs = backoff.as_secs(), "subscription catch-up failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        }
        backoff = INITIAL_BACKOFF;

        match stream_updates(&client, &uri, &mut cursor, &monitor, &on_event).await {
            Ok(()) => {}
            Err(Failure::Permanent(msg)) => {
                warn!(uri, error = %msg, "subscription monitor permanently unhealthy");
                monitor.close();
                return;
            }
            Err(Failure::Transient(msg)) => {
                debug!(uri, error = %msg, "subscription stream ended, reconnecting");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Paginate `<base>/subscriptions/items/[?since=cursor:<c>]` until a page
/// comes back empty, applying every item in order. A 404 means the server
/// has lost the subscription history: unsub everything known and fail.
async fn bulk_catch_up(
    client: &reqwest::Client,
    uri: &str,
    cursor: &mut Option<Cursor>,
    monitor: &SubscriptionMonitor,
    on_event: &EventCallback,
) -> Result<(), Failure> {
    let base = format!("{}/subscriptions/items/", uri.trim_end_matches('/'));
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let mut request = client.get(&base);
        if let Some(c) = cursor.as_ref() {
            request = request.query(&[("since", format!("cursor:{}", c.raw()))]);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                if backoff >= MAX_BACKOFF {
                    return Err(Failure::Transient(e.to_string()));
                }
                continue;
            }
        };

        let status = response.status();
        if status.as_u16() == 404 {
            monitor.clear_all(on_event);
            *cursor = None;
            return Err(Failure::Transient("subscription history lost (404)".to_owned()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if classify_status(status.as_u16()) {
                return Err(Failure::Permanent(format!("HTTP {status}: {body}")));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            if backoff >= MAX_BACKOFF {
                return Err(Failure::Transient(format!("HTTP {status}: {body}")));
            }
            continue;
        }

        let parsed: BulkItemsResponse = response
            .json()
            .await
            .map_err(|e| Failure::Transient(e.to_string()))?;
        let page_empty = parsed.items.is_empty();
        for item in &parsed.items {
            monitor.apply(item, on_event);
        }
        if let Some(last) = parsed.last_cursor {
            *cursor = Some(Cursor::parse(&last));
        }
        if page_empty {
            return Ok(());
        }
        backoff = INITIAL_BACKOFF;
    }
}

/// Follow the real-time stream of newline-delimited [`StreamRecord`]s,
/// detecting cursor gaps and refetching instead of applying a record out of
/// order. The first records after a fresh catch-up are "catching up" — they
/// are consumed without being applied again until `prev_cursor` lines up with
/// the cursor the catch-up fetch left us at, bounded at 60s.
async fn stream_updates(
    client: &reqwest::Client,
    uri: &str,
    cursor: &mut Option<Cursor>,
    monitor: &SubscriptionMonitor,
    on_event: &EventCallback,
) -> Result<(), Failure> {
    let url = format!("{}/subscriptions/stream/", uri.trim_end_matches('/'));
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(60))
        .send()
        .await
        .map_err(|e| Failure::Transient(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify(status.as_u16(), body));
    }

    let catch_up_target = cursor.clone();
    let mut catching_up = catch_up_target.is_some();
    let catch_up_deadline = Instant::now() + CATCH_UP_TIMEOUT;

    let mut buf = Vec::new();
    let mut bytes = response.bytes_stream();
    while let Some(chunk) = bytes.next().await {
        if monitor.closed() {
            return Ok(());
        }
        if catching_up && Instant::now() > catch_up_deadline {
            return Err(Failure::Transient("stream catch-up phase timed out".to_owned()));
        }
        let chunk = chunk.map_err(|e| Failure::Transient(e.to_string()))?;
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line = buf.drain(..=pos).collect::<Vec<u8>>();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            let record: StreamRecord = match serde_json::from_slice(line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "dropping malformed subscription stream record");
                    continue;
                }
            };
            let record_prev = record.prev_cursor.as_deref().map(Cursor::parse);

            if catching_up {
                let reached_target = match (&record_prev, &catch_up_target) {
                    (Some(prev), Some(target)) => prev == target,
                    (None, None) => true,
                    _ => false,
                };
                if !reached_target {
                    continue;
                }
                catching_up = false;
            } else {
                let gap = match (&record_prev, cursor.as_ref()) {
                    (Some(prev), Some(known)) => prev != known,
                    (None, None) => false,
                    _ => true,
                };
                if gap {
                    debug!("subscription stream gap detected, resyncing via catch-up");
                    bulk_catch_up(client, uri, cursor, monitor, on_event).await?;
                    continue;
                }
            }

            monitor.apply(&record.item, on_event);
            *cursor = Some(Cursor::parse(&record.cursor));
        }
    }

    Err(Failure::Transient("stream closed by peer".to_owned()))
}

fn classify(status: u16, body: String) -> Failure {
    if classify_status(status) {
        Failure::Permanent(format!("HTTP {status}: {body}"))
    } else {
        Failure::Transient(format!("HTTP {status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recording_callback() -> (EventCallback, Arc<StdMutex<Vec<SubscriptionEvent>>>) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let events2 = events.clone();
        let cb: EventCallback = Arc::new(move |event| events2.lock().unwrap().push(event));
        (cb, events)
    }

    #[test]
    fn permanent_status_classification_matches_4xx_501_and_above_600() {
        assert!(classify_status(404));
        assert!(classify_status(501));
        assert!(classify_status(600));
        assert!(classify_status(422));
    }

    #[test]
    fn transient_status_classification_covers_other_5xx() {
        assert!(!classify_status(500));
        assert!(!classify_status(502));
        assert!(!classify_status(503));
        assert!(!classify_status(200));
    }

    #[tokio::test]
    async fn freshly_allocated_monitor_knows_no_subscribers() {
        let monitor = SubscriptionMonitor::new();
        assert!(!monitor.is_channel_subscribed_to("anything"));
        assert!(!monitor.closed());
    }

    #[test]
    fn apply_fires_sub_before_inserting_and_unsub_after_removing() {
        let monitor_arc = SubscriptionMonitor::new();
        let (cb, events) = recording_callback();

        monitor_arc.apply(
            &SubscriptionItem { state: "subscribed".to_owned(), channel: "room".to_owned() },
            &cb,
        );
        assert!(monitor_arc.is_channel_subscribed_to("room"));
        assert_eq!(events.lock().unwrap().as_slice(), &[SubscriptionEvent::Sub("room".to_owned())]);

        monitor_arc.apply(
            &SubscriptionItem { state: "unsubscribed".to_owned(), channel: "room".to_owned() },
            &cb,
        );
        assert!(!monitor_arc.is_channel_subscribed_to("room"));
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[SubscriptionEvent::Sub("room".to_owned()), SubscriptionEvent::Unsub("room".to_owned())]
        );
    }

    #[test]
    fn apply_is_a_no_op_for_redundant_transitions() {
        let monitor_arc = SubscriptionMonitor::new();
        let (cb, events) = recording_callback();
        monitor_arc.apply(
            &SubscriptionItem { state: "unsubscribed".to_owned(), channel: "room".to_owned() },
            &cb,
        );
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn clear_all_unsubs_every_known_channel() {
        let monitor_arc = SubscriptionMonitor::new();
        let (cb, events) = recording_callback();
        monitor_arc.apply(&SubscriptionItem { state: "subscribed".to_owned(), channel: "a".to_owned() }, &cb);
        monitor_arc.apply(&SubscriptionItem { state: "subscribed".to_owned(), channel: "b".to_owned() }, &cb);
        events.lock().unwrap().clear();

        monitor_arc.clear_all(&cb);
        assert!(!monitor_arc.is_channel_subscribed_to("a"));
        assert!(!monitor_arc.is_channel_subscribed_to("b"));
        assert_eq!(events.lock().unwrap().len(), 2);
    }
}
