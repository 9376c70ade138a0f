//! Subscription controller (C6).
//!
//! Grounded in `original_source/src/zmqpubcontroller.py`: an XPUB socket
//! surfaces ZeroMQ's built-in subscribe/unsubscribe notifications as one
//! frame per event (a leading `0x01`/`0x00` byte followed by the topic). The
//! socket only tolerates being touched from the thread that owns it, so it
//! lives on a dedicated `std::thread` and every other call — connect,
//! disconnect, publish, stop — crosses over an inproc `PAIR` socket instead
//! of a `tokio::sync::mpsc` channel, keeping the poll loop entirely within
//! ZeroMQ's own reactor. There is exactly one controller per orchestrator,
//! shared by every message-bus client configured in PUB mode; `connect`/
//! `disconnect` attach and detach individual `pub_uri`s from it.
//!
//! Ordering invariant (`spec.md` §8, I-6 and §4.6): the subscribe callback
//! runs *before* the channel is added to the known-subscribers set; the
//! unsubscribe callback runs *after* it's removed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use tracing::warn;

use crate::error::{EpcpError, Result};
use crate::subscription_event::{EventCallback, SubscriptionEvent, SubscriptionSource};

enum ControlFlow {
    Continue,
    Stop,
}

/// Owns the one shared XPUB socket for an orchestrator. Construct with
/// [`SubscriptionController::spawn`]; `connect`/`disconnect` attach it to the
/// `pub_uri`s of individual message-bus clients.
pub struct SubscriptionController {
    cmd_client: Mutex<zmq::Socket>,
    subscribed: Arc<RwLock<HashSet<String>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SubscriptionController {
    /// Create the XPUB socket and start its owning thread. `on_event` is
    /// invoked synchronously on that thread for every subscribe/unsubscribe
    /// notification — keep it cheap (the orchestrator's use of it just reads
    /// a few atomics and optionally calls the user's sub-callback).
    pub fn spawn(on_event: EventCallback) -> Result<Arc<Self>> {
        let ctx = zmq::Context::new();
        let inproc_addr = format!("inproc://epcp-controller-{}", uuid::Uuid::new_v4());

        let cmd_server = ctx
            .socket(zmq::PAIR)
            .map_err(|e| EpcpError::Bus(format!("command socket create failed: {e}")))?;
        cmd_server
            .bind(&inproc_addr)
            .map_err(|e| EpcpError::Bus(format!("command socket bind failed: {e}")))?;

        let cmd_client = ctx
            .socket(zmq::PAIR)
            .map_err(|e| EpcpError::Bus(format!("command socket create failed: {e}")))?;
        cmd_client
            .connect(&inproc_addr)
            .map_err(|e| EpcpError::Bus(format!("command socket connect failed: {e}")))?;

        let xpub = ctx
            .socket(zmq::XPUB)
            .map_err(|e| EpcpError::Bus(format!("xpub socket create failed: {e}")))?;
        xpub.set_linger(0).map_err(|e| EpcpError::Bus(e.to_string()))?;
        // Unbounded: a slow controller must never drop a subscribe/unsubscribe
        // notification under load.
        xpub.set_rcvhwm(0).map_err(|e| EpcpError::Bus(e.to_string()))?;

        let subscribed = Arc::new(RwLock::new(HashSet::new()));
        let thread_subscribed = subscribed.clone();
        let thread = std::thread::spawn(move || controller_thread(xpub, cmd_server, thread_subscribed, on_event));

        Ok(Arc::new(SubscriptionController {
            cmd_client: Mutex::new(cmd_client),
            subscribed,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn is_channel_subscribed_to(&self, channel: &str) -> bool {
        self.subscribed.read().expect("subscribed set poisoned").contains(channel)
    }

    /// Connect the XPUB socket to a `pub_uri`. Idempotent per distinct URI.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        self.send_command(vec![b"connect".to_vec(), uri.as_bytes().to_vec()]).await
    }

    pub async fn disconnect(&self, uri: &str) -> Result<()> {
        self.send_command(vec![b"disconnect".to_vec(), uri.as_bytes().to_vec()]).await
    }

    pub async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        self.send_command(vec![b"publish".to_vec(), channel.as_bytes().to_vec(), payload])
            .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send_command(vec![b"stop".to_vec()]).await?;
        let handle = self.thread.lock().expect("thread handle mutex poisoned").take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        Ok(())
    }

    async fn send_command(&self, frames: Vec<Vec<u8>>) -> Result<()> {
        // `zmq::Socket` is not `Sync`; hold the mutex across the blocking
        // call rather than cloning the socket (ZeroMQ sockets aren't safe to
        // share between threads even briefly).
        let cmd_client = self.cmd_client.lock().expect("command socket mutex poisoned");
        cmd_client
            .send_multipart(frames, 0)
            .map_err(|e| EpcpError::Bus(format!("command send failed: {e}")))
    }
}

impl SubscriptionSource for SubscriptionController {
    fn is_channel_subscribed_to(&self, channel: &str) -> bool {
        SubscriptionController::is_channel_subscribed_to(self, channel)
    }
}

fn controller_thread(
    xpub: zmq::Socket,
    cmd: zmq::Socket,
    subscribed: Arc<RwLock<HashSet<String>>>,
    on_event: EventCallback,
) {
    loop {
        let mut items = [xpub.as_poll_item(zmq::POLLIN), cmd.as_poll_item(zmq::POLLIN)];
        if zmq::poll(&mut items, -1).is_err() {
            break;
        }

        if items[0].is_readable() {
            match xpub.recv_bytes(0) {
                Ok(bytes) => handle_xpub_event(&bytes, &subscribed, &on_event),
                Err(_) => break,
            }
        }

        if items[1].is_readable() {
            match handle_command(&xpub, &cmd) {
                ControlFlow::Continue => {}
                ControlFlow::Stop => break,
            }
        }
    }
}

fn handle_xpub_event(bytes: &[u8], subscribed: &RwLock<HashSet<String>>, on_event: &EventCallback) {
    if bytes.is_empty() {
        return;
    }
    let (kind, topic) = (bytes[0], &bytes[1..]);
    let channel = match std::str::from_utf8(topic) {
        Ok(s) => s.to_owned(),
        Err(_) => {
            warn!("dropping non-utf8 channel name in xpub subscription event");
            return;
        }
    };

    match kind {
        1 => {
            let already = subscribed.read().expect("subscribed set poisoned").contains(&channel);
            if !already {
                on_event(SubscriptionEvent::Sub(channel.clone()));
                subscribed.write().expect("subscribed set poisoned").insert(channel);
            }
        }
        0 => {
            let present = subscribed.write().expect("subscribed set poisoned").remove(&channel);
            if present {
                on_event(SubscriptionEvent::Unsub(channel));
            }
        }
        _ => {}
    }
}

fn handle_command(xpub: &zmq::Socket, cmd: &zmq::Socket) -> ControlFlow {
    let frames = match cmd.recv_multipart(0) {
        Ok(f) => f,
        Err(_) => return ControlFlow::Stop,
    };
    let Some(verb) = frames.first() else {
        return ControlFlow::Continue;
    };

    match verb.as_slice() {
        b"connect" => {
            if let Some(uri) = frames.get(1) {
                let uri = String::from_utf8_lossy(uri);
                if let Err(e) = xpub.connect(&uri) {
                    warn!(uri = %uri, error = %e, "xpub connect failed");
                }
            }
            ControlFlow::Continue
        }
        b"disconnect" => {
            if let Some(uri) = frames.get(1) {
                let uri = String::from_utf8_lossy(uri);
                if let Err(e) = xpub.disconnect(&uri) {
                    warn!(uri = %uri, error = %e, "xpub disconnect failed");
                }
            }
            ControlFlow::Continue
        }
        b"publish" => {
            if let (Some(channel), Some(payload)) = (frames.get(1), frames.get(2)) {
                if let Err(e) = xpub.send_multipart([channel.clone(), payload.clone()], 0) {
                    warn!(error = %e, "xpub publish failed");
                }
            }
            ControlFlow::Continue
        }
        b"stop" => ControlFlow::Stop,
        _ => ControlFlow::Continue,
    }
}
