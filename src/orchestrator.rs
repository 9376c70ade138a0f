//! Fan-out orchestrator (C7).
//!
//! Grounded in `original_source/src/pubcontrol.py`: holds a list of publish
//! clients built from a declarative config, dispatches one publish to all of
//! them, aggregates their individual outcomes into a single callback via
//! [`crate::aggregator::Aggregator`], and de-duplicates subscribe/unsubscribe
//! events from every HTTP monitor and the shared message-bus controller into
//! one logical per-channel signal (`_client_sub_callback` in the original).
//! Every live orchestrator also registers itself in a process-wide registry
//! so that process exit drains every outstanding worker — Rust has no
//! `atexit`, so this uses `ctor::dtor`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

use crate::aggregator::Aggregator;
use crate::bus_publisher::BusPublisher;
use crate::config::ConfigEntry;
use crate::discovery;
use crate::error::{EpcpError, Result};
use crate::framing::JsonFraming;
use crate::http_publisher::{Callback, HttpPublisher};
use crate::item::Item;
use crate::subscription_controller::SubscriptionController;
use crate::subscription_event::{EventCallback, SubscriptionEvent, SubscriptionSource};
use crate::subscription_monitor::SubscriptionMonitor;

#[derive(Clone)]
enum ClientKind {
    Http(Arc<HttpPublisher>),
    Bus(Arc<BusPublisher>),
}

/// Everything built by one `apply_config` call: the client list plus the
/// shared message-bus controller (if any entry needed PUB mode).
struct Generation {
    clients: Vec<ClientKind>,
    controller: Option<Arc<SubscriptionController>>,
}

/// Coordinates zero or more publish clients as one logical publisher.
pub struct Orchestrator {
    generation: RwLock<Generation>,
    /// The user's subscription-event callback. Shared (not owned) by the
    /// closures handed to every monitor/controller so it can be replaced
    /// without rebuilding the client list.
    sub_callback: Arc<RwLock<Option<EventCallback>>>,
    closed: AtomicBool,
}

fn registry() -> &'static Mutex<Vec<Weak<Orchestrator>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Weak<Orchestrator>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

impl Orchestrator {
    pub fn new() -> Arc<Self> {
        let orchestrator = Arc::new(Orchestrator {
            generation: RwLock::new(Generation { clients: Vec::new(), controller: None }),
            sub_callback: Arc::new(RwLock::new(None)),
            closed: AtomicBool::new(false),
        });
        registry()
            .lock()
            .expect("orchestrator registry poisoned")
            .push(Arc::downgrade(&orchestrator));
        orchestrator
    }

    /// Install the callback invoked once per channel whenever the aggregate
    /// "does any configured endpoint currently have a subscriber" state
    /// transitions, across every HTTP monitor and the shared message-bus
    /// controller (`spec.md` §4.7).
    pub fn set_sub_callback(&self, callback: EventCallback) {
        *self.sub_callback.write().expect("sub callback lock poisoned") = Some(callback);
    }

    /// Replace the client list wholesale. If any entry fails to build, the
    /// existing configuration is left untouched and every partially-built
    /// client and shared resource from this call is torn down before
    /// returning the error.
    pub async fn apply_config(&self, entries: Vec<ConfigEntry>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EpcpError::UseAfterClose);
        }
        for entry in &entries {
            entry.validate()?;
        }

        match Self::build_generation(&entries, &self.sub_callback).await {
            Ok(generation) => {
                let previous = {
                    let mut guard = self.generation.write().expect("generation lock poisoned");
                    std::mem::replace(&mut *guard, generation)
                };
                Self::shutdown_generation(previous).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Build every client and shared resource for one `apply_config` call.
    /// Sources (HTTP monitors + the shared controller, if any) are all
    /// registered into `sources` before any of them is started, so the
    /// aggregation closures handed to them always see the complete picture —
    /// no source can fire an event before every sibling source exists.
    async fn build_generation(
        entries: &[ConfigEntry],
        sub_callback: &Arc<RwLock<Option<EventCallback>>>,
    ) -> Result<Generation> {
        let sources: Arc<RwLock<Vec<Arc<dyn SubscriptionSource>>>> = Arc::new(RwLock::new(Vec::new()));
        let event_handler = make_event_handler(sources.clone(), sub_callback.clone());

        // Phase 1: allocate (but do not start) one monitor per HTTP entry
        // that gates on subscribers, and decide whether any entry needs the
        // shared PUB-mode controller.
        let mut monitors: Vec<Option<Arc<SubscriptionMonitor>>> = Vec::with_capacity(entries.len());
        let mut needs_controller = false;
        for entry in entries {
            let monitor = if entry.require_subscribers && entry.uri.is_some() {
                let m = SubscriptionMonitor::new();
                sources.write().expect("sources lock poisoned").push(m.clone() as Arc<dyn SubscriptionSource>);
                Some(m)
            } else {
                None
            };
            monitors.push(monitor);
            if entry.require_subscribers && entry.wants_bus_client() {
                needs_controller = true;
            }
        }

        // Phase 2: resolve each bus entry's transport (direct URI, or via
        // discovery), validating the URI table of `spec.md` §4.5 after
        // discovery fills in whatever was missing.
        let mut bus_plans: Vec<Option<BusPlan>> = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.wants_bus_client() {
                bus_plans.push(None);
                continue;
            }
            match resolve_bus_plan(entry).await {
                Ok(plan) => bus_plans.push(Some(plan)),
                Err(e) => {
                    shutdown_monitors(&monitors).await;
                    return Err(e);
                }
            }
        }

        // Phase 3: stand up the shared controller, if needed, and register
        // it as a source before connecting it to anything or starting any
        // monitor — see the doc comment above.
        let controller = if needs_controller {
            match SubscriptionController::spawn(event_handler.clone()) {
                Ok(c) => {
                    sources.write().expect("sources lock poisoned").push(c.clone() as Arc<dyn SubscriptionSource>);
                    Some(c)
                }
                Err(e) => {
                    shutdown_monitors(&monitors).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Phase 4: start every monitor now that `sources` is complete.
        for (entry, monitor) in entries.iter().zip(monitors.iter()) {
            if let Some(monitor) = monitor {
                let uri = entry.uri.clone().expect("monitor only allocated when uri is set");
                monitor.start(uri, reqwest::Client::new(), event_handler.clone());
            }
        }

        // Phase 5: build the actual publish clients, connecting the
        // controller to each PUB-mode entry's pub_uri as we go.
        let mut clients = Vec::with_capacity(entries.len() * 2);
        for ((entry, monitor), bus_plan) in entries.iter().zip(monitors.iter()).zip(bus_plans.iter()) {
            if let Some(uri) = &entry.uri {
                let mut publisher = HttpPublisher::new(uri.clone(), entry.require_subscribers);
                if let Some(monitor) = monitor {
                    publisher = publisher.with_monitor(monitor.clone());
                }
                if let Some(jwt) = entry.jwt_auth() {
                    publisher.auth().set_bearer(jwt.claim, jwt.key);
                }
                clients.push(ClientKind::Http(Arc::new(publisher)));
            }

            if let Some(plan) = bus_plan {
                let bus = match (&plan.pub_uri, entry.require_subscribers) {
                    (Some(pub_uri), true) => {
                        let controller = controller.clone().expect("controller built whenever a PUB entry exists");
                        if let Err(e) = controller.connect(pub_uri).await {
                            shutdown_clients(&clients).await;
                            shutdown_monitors(&monitors).await;
                            let _ = controller.stop().await;
                            return Err(e);
                        }
                        BusPublisher::via_controller(controller, Arc::new(JsonFraming))
                    }
                    _ => {
                        let push_uri = plan
                            .push_uri
                            .clone()
                            .expect("resolve_bus_plan validated a push uri for non-PUB entries");
                        match BusPublisher::connect_push(&push_uri, Arc::new(JsonFraming)) {
                            Ok(bus) => bus,
                            Err(e) => {
                                shutdown_clients(&clients).await;
                                shutdown_monitors(&monitors).await;
                                return Err(e);
                            }
                        }
                    }
                };
                clients.push(ClientKind::Bus(Arc::new(bus)));
            }
        }

        Ok(Generation { clients, controller })
    }

    async fn shutdown_generation(generation: Generation) {
        shutdown_clients(&generation.clients).await;
        if let Some(controller) = generation.controller {
            let _ = controller.stop().await;
        }
    }

    /// Publish to every configured client, aggregating their results per
    /// `spec.md` §4.7. `item` is shared, not copied, across clients.
    pub async fn publish(
        &self,
        channel: &str,
        item: Arc<Item>,
        blocking: bool,
        callback: Option<Callback>,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EpcpError::UseAfterClose);
        }

        let snapshot: Vec<ClientKind> = self.generation.read().expect("generation lock poisoned").clients.clone();
        let aggregator = Aggregator::new(snapshot.len(), callback);

        let mut futures: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = Vec::with_capacity(snapshot.len());
        for client in snapshot {
            let channel = channel.to_owned();
            let item = item.clone();
            let aggregator = aggregator.clone();

            match client {
                ClientKind::Http(http) => {
                    // `http.publish` invokes `cb` on every path except a
                    // handful of up-front errors (closed client, permanently
                    // unhealthy subscriber monitor) that return `Err`
                    // without ever touching the callback — those must still
                    // complete the aggregator or it never reaches zero.
                    let err_aggregator = aggregator.clone();
                    let cb: Callback = Box::new(move |success, message| {
                        aggregator.complete(success, message);
                    });
                    futures.push(Box::pin(async move {
                        if let Err(e) = http.publish(&channel, &item, blocking, Some(cb)).await {
                            err_aggregator.complete(false, e.to_string());
                        }
                    }));
                }
                ClientKind::Bus(bus) => {
                    futures.push(Box::pin(async move {
                        match bus.publish(&channel, &item).await {
                            Ok(()) => aggregator.complete(true, String::new()),
                            Err(e) => aggregator.complete(false, e.to_string()),
                        }
                    }));
                }
            }
        }

        if blocking {
            futures_util::future::join_all(futures).await;
        } else {
            for fut in futures {
                tokio::spawn(fut);
            }
        }
        Ok(())
    }

    pub async fn wait_all_sent(&self) {
        let snapshot: Vec<ClientKind> = self.generation.read().expect("generation lock poisoned").clients.clone();
        for client in snapshot {
            if let ClientKind::Http(http) = client {
                http.wait_all_sent().await;
            }
        }
    }

    /// Mark closed (further calls fail with `UseAfterClose`) and shut down
    /// every configured client and the shared controller.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(EpcpError::UseAfterClose);
        }
        let generation = {
            let mut guard = self.generation.write().expect("generation lock poisoned");
            std::mem::replace(&mut *guard, Generation { clients: Vec::new(), controller: None })
        };
        Self::shutdown_generation(generation).await;
        Ok(())
    }
}

struct BusPlan {
    push_uri: Option<String>,
    pub_uri: Option<String>,
}

/// Resolve an entry's message-bus transport: fill in whatever data URI is
/// missing via discovery against `zmq_uri`, then enforce `spec.md` §4.5's
/// URI-config validity table.
async fn resolve_bus_plan(entry: &ConfigEntry) -> Result<BusPlan> {
    let mut push_uri = entry.zmq_push_uri.clone();
    let mut pub_uri = entry.zmq_pub_uri.clone();

    let missing_needed_uri = if entry.require_subscribers { pub_uri.is_none() } else { push_uri.is_none() };
    if missing_needed_uri {
        if let Some(cmd_uri) = entry.zmq_uri.clone() {
            let uris = tokio::task::spawn_blocking(move || discovery::discover_zmq_uris(&cmd_uri))
                .await
                .map_err(|e| EpcpError::Discovery(format!("discovery task panicked: {e}")))??;
            if push_uri.is_none() {
                push_uri = uris.publish_pull;
            }
            if pub_uri.is_none() {
                pub_uri = uris.publish_sub;
            }
        }
    }

    if entry.require_subscribers {
        if pub_uri.is_none() {
            return Err(EpcpError::InvalidConfig(
                "require_subscribers is set but no pub_uri was configured or discovered".to_owned(),
            ));
        }
    } else if push_uri.is_none() {
        return Err(EpcpError::InvalidConfig(
            "no push_uri was configured or discovered".to_owned(),
        ));
    }

    Ok(BusPlan { push_uri, pub_uri })
}

fn make_event_handler(
    sources: Arc<RwLock<Vec<Arc<dyn SubscriptionSource>>>>,
    sub_callback: Arc<RwLock<Option<EventCallback>>>,
) -> EventCallback {
    Arc::new(move |event: SubscriptionEvent| {
        let held = sources
            .read()
            .expect("sources lock poisoned")
            .iter()
            .any(|source| source.is_channel_subscribed_to(event.channel()));
        if !held {
            if let Some(callback) = sub_callback.read().expect("sub callback lock poisoned").as_ref() {
                callback(event);
            }
        }
    })
}

async fn shutdown_clients(clients: &[ClientKind]) {
    for client in clients {
        if let ClientKind::Http(http) = client {
            let _ = http.close().await;
        }
    }
}

async fn shutdown_monitors(monitors: &[Option<Arc<SubscriptionMonitor>>]) {
    for monitor in monitors.iter().flatten() {
        monitor.close();
    }
}

/// Drain every live orchestrator at process exit, mirroring the Python
/// library's `atexit.register(_close_pubcontrols)`.
#[ctor::dtor]
fn close_all_orchestrators_at_exit() {
    let handles: Vec<Arc<Orchestrator>> = registry()
        .lock()
        .expect("orchestrator registry poisoned")
        .iter()
        .filter_map(Weak::upgrade)
        .collect();
    if handles.is_empty() {
        return;
    }
    if let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_all().build() {
        for orchestrator in handles {
            runtime.block_on(async {
                let _ = orchestrator.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn publish_with_no_configured_clients_succeeds_trivially() {
        let orchestrator = Orchestrator::new();
        let item = Arc::new(Item::new(vec![]));
        orchestrator.publish("room", item, true, None).await.unwrap();
    }

    #[tokio::test]
    async fn apply_config_rejects_an_entry_with_no_uri() {
        let orchestrator = Orchestrator::new();
        let bad = vec![ConfigEntry::default()];
        assert!(orchestrator.apply_config(bad).await.is_err());
    }

    #[tokio::test]
    async fn operations_after_close_fail_with_use_after_close() {
        let orchestrator = Orchestrator::new();
        orchestrator.close().await.unwrap();
        let item = Arc::new(Item::new(vec![]));
        assert!(matches!(
            orchestrator.publish("room", item, true, None).await.unwrap_err(),
            EpcpError::UseAfterClose
        ));
        assert!(matches!(
            orchestrator.apply_config(vec![]).await.unwrap_err(),
            EpcpError::UseAfterClose
        ));
    }

    /// A client whose `publish` returns `Err` without ever touching its
    /// callback (here, one already closed) must still complete the
    /// aggregator exactly once, alongside a sibling that succeeds normally.
    #[tokio::test]
    async fn aggregate_callback_fires_once_when_one_client_errors_before_its_own_callback_runs() {
        let orchestrator = Orchestrator::new();

        let closed_client = HttpPublisher::new("http://example.invalid/closed", false);
        closed_client.close().await.unwrap();
        let server = epcp_test_utils::MockEpcpServer::start().await;
        let healthy_client = HttpPublisher::new(server.base_url(), false);

        {
            let mut guard = orchestrator.generation.write().unwrap();
            guard.clients.push(ClientKind::Http(Arc::new(closed_client)));
            guard.clients.push(ClientKind::Http(Arc::new(healthy_client)));
        }

        let calls = Arc::new(StdMutex::new(Vec::new()));
        let calls2 = calls.clone();
        let item = Arc::new(Item::new(vec![]));
        orchestrator
            .publish(
                "room",
                item,
                true,
                Some(Box::new(move |success, message| {
                    calls2.lock().unwrap().push((success, message));
                })),
            )
            .await
            .unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1, "aggregate callback must fire exactly once");
        assert!(!calls[0].0, "one client errored, so the overall result must be failure");
    }

    #[tokio::test]
    async fn sub_callback_fires_once_for_the_first_source_and_once_for_the_last() {
        let sources: Arc<RwLock<Vec<Arc<dyn SubscriptionSource>>>> = Arc::new(RwLock::new(Vec::new()));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sub_callback: Arc<RwLock<Option<EventCallback>>> =
            Arc::new(RwLock::new(Some(Arc::new(move |event: SubscriptionEvent| {
                seen2.lock().unwrap().push(event);
            }))));
        let handler = make_event_handler(sources.clone(), sub_callback);

        let a = SubscriptionMonitor::new();
        let b = SubscriptionMonitor::new();
        sources.write().unwrap().push(a.clone() as Arc<dyn SubscriptionSource>);
        sources.write().unwrap().push(b.clone() as Arc<dyn SubscriptionSource>);

        // `a` sees the first subscriber: aggregate transitions from "nobody" to "somebody".
        handler(SubscriptionEvent::Sub("room".to_owned()));
        // simulate a's own set now holding it (monitor.apply would have done this already in real use)
        // `b` also reports a subscriber for the same channel: aggregate state doesn't change.
        handler(SubscriptionEvent::Sub("room".to_owned()));

        assert_eq!(seen.lock().unwrap().as_slice(), &[SubscriptionEvent::Sub("room".to_owned())]);
    }
}
