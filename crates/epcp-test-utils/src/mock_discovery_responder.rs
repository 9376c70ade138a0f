// mock_discovery_responder: A mock ZeroMQ REQ/REP endpoint answering the
// `get-zmq-uris` discovery handshake, for integration-testing the client's
// C5 discovery step without a real message-bus broker.
//
// Owns its REP socket on a dedicated thread, matching the reasoning in
// `subscription_controller.rs`: ZeroMQ sockets must stay on the thread that
// created them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use epcp_protocol::{DiscoveryReply, DiscoveryUris};

pub struct MockDiscoveryResponder {
    uri: String,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl MockDiscoveryResponder {
    /// Bind a REP socket on a random local port and start answering every
    /// request with a reply advertising `push_uri`/`pub_uri`.
    pub fn start(push_uri: Option<String>, pub_uri: Option<String>) -> Self {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::REP).expect("rep socket create failed");
        socket.set_rcvtimeo(200).expect("set_rcvtimeo failed");
        socket.bind("tcp://127.0.0.1:0").expect("bind failed");
        let uri = socket
            .get_last_endpoint()
            .expect("get_last_endpoint failed")
            .expect("endpoint is a valid utf8 string");

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = std::thread::spawn(move || {
            let reply = DiscoveryReply {
                success: true,
                value: Some(DiscoveryUris { publish_pull: push_uri, publish_sub: pub_uri }),
            };
            let payload = serde_json::to_vec(&reply).expect("reply encoding failed");

            while !thread_stop.load(Ordering::SeqCst) {
                match socket.recv_bytes(0) {
                    Ok(_request) => {
                        let _ = socket.send(payload.clone(), 0);
                    }
                    Err(_) => continue,
                }
            }
        });

        MockDiscoveryResponder { uri, stop, thread: Some(thread) }
    }

    /// The `tcp://127.0.0.1:<port>` endpoint clients should connect to.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Drop for MockDiscoveryResponder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_a_get_zmq_uris_request() {
        let responder = MockDiscoveryResponder::start(
            Some("tcp://127.0.0.1:6000".to_owned()),
            Some("tcp://127.0.0.1:6001".to_owned()),
        );

        let ctx = zmq::Context::new();
        let req = ctx.socket(zmq::REQ).unwrap();
        req.set_sndtimeo(1000).unwrap();
        req.set_rcvtimeo(1000).unwrap();
        req.connect(responder.uri()).unwrap();

        req.send(serde_json::to_vec(&epcp_protocol::DiscoveryRequest::get_zmq_uris()).unwrap(), 0)
            .unwrap();
        let raw = req.recv_bytes(0).unwrap();
        let reply: DiscoveryReply = serde_json::from_slice(&raw).unwrap();

        assert!(reply.success);
        assert_eq!(reply.value.unwrap().publish_pull.as_deref(), Some("tcp://127.0.0.1:6000"));
    }
}
