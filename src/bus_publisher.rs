//! Message-bus publisher (C5).
//!
//! Grounded in `original_source/src/zmqpubcontrolclient.py`: publishes onto
//! either a PUSH socket it owns directly, or, in PUB mode, via the
//! orchestrator's shared [`SubscriptionController`] (C6) XPUB socket — the
//! PUB-mode publisher never owns a socket of its own, since ZeroMQ requires
//! exactly one owner per socket and the controller already owns the XPUB
//! handle that observes subscribers. [`Item::export`] runs in binary mode
//! and the frame is built with the configured [`BinaryFraming`]. The PUSH
//! socket's `zmq::Socket` calls block, so sends run on the blocking thread
//! pool via `tokio::task::spawn_blocking`, mirroring how `services/forwarder`
//! isolates blocking I/O from the async runtime.

use std::sync::{Arc, Mutex};

use crate::error::{EpcpError, Result};
use crate::framing::BinaryFraming;
use crate::item::{Item, Value};
use crate::subscription_controller::SubscriptionController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Push,
    Pub,
}

enum Transport {
    Push(Arc<Mutex<zmq::Socket>>),
    Pub(Arc<SubscriptionController>),
}

pub struct BusPublisher {
    transport: Transport,
    framing: Arc<dyn BinaryFraming>,
}

impl BusPublisher {
    /// Connect a standalone PUSH socket to `push_uri`.
    pub fn connect_push(push_uri: &str, framing: Arc<dyn BinaryFraming>) -> Result<Self> {
        let ctx = zmq::Context::new();
        let socket = ctx
            .socket(zmq::PUSH)
            .map_err(|e| EpcpError::Bus(format!("socket create failed: {e}")))?;
        socket.set_linger(0).map_err(|e| EpcpError::Bus(e.to_string()))?;
        socket
            .connect(push_uri)
            .map_err(|e| EpcpError::Bus(format!("connect to {push_uri} failed: {e}")))?;

        Ok(BusPublisher {
            transport: Transport::Push(Arc::new(Mutex::new(socket))),
            framing,
        })
    }

    /// Publish through the orchestrator's shared XPUB controller, already
    /// connected to `pub_uri` by the caller.
    pub fn via_controller(controller: Arc<SubscriptionController>, framing: Arc<dyn BinaryFraming>) -> Self {
        BusPublisher {
            transport: Transport::Pub(controller),
            framing,
        }
    }

    pub fn mode(&self) -> BusMode {
        match self.transport {
            Transport::Push(_) => BusMode::Push,
            Transport::Pub(_) => BusMode::Pub,
        }
    }

    pub async fn publish(&self, channel: &str, item: &Item) -> Result<()> {
        match &self.transport {
            Transport::Push(socket) => {
                // PUSH mode has no separate envelope frame, so `channel`
                // travels inside the content itself.
                let mut value = item.export(true, true)?;
                if let Value::Map(entries) = &mut value {
                    entries.push((
                        Value::Bytes(b"channel".to_vec()),
                        Value::Bytes(channel.as_bytes().to_vec()),
                    ));
                }
                let frame = self.framing.encode(&value);

                let socket = socket.clone();
                tokio::task::spawn_blocking(move || {
                    let socket = socket.lock().expect("zmq socket mutex poisoned");
                    socket.send(frame, 0)
                })
                .await
                .map_err(|e| EpcpError::Bus(format!("blocking send task panicked: {e}")))?
                .map_err(|e| EpcpError::Bus(e.to_string()))
            }
            Transport::Pub(controller) => {
                // PUB mode already carries `channel` as the multipart
                // envelope frame; the content frame must not repeat it.
                let value = item.export(true, true)?;
                let frame = self.framing.encode(&value);
                controller.publish(channel, frame).await
            }
        }
    }
}
