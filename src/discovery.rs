//! Message-bus URI discovery (C5).
//!
//! Grounded in `original_source/src/zmqpubcontrolclient.py`'s newer discovery
//! handshake: a short-lived ZeroMQ REQ socket asks a well-known endpoint for
//! the actual PUSH/PUB URIs to use, with independent send/receive deadlines
//! so a silent peer can't wedge the caller forever. Any `tcp://*:<port>`
//! wildcard in the reply is resolved against the discovery endpoint's own
//! host before being handed back.

use epcp_protocol::{DiscoveryReply, DiscoveryRequest, DiscoveryUris};

use crate::error::{EpcpError, Result};

const SEND_TIMEOUT_MS: i32 = 3000;
const RECV_TIMEOUT_MS: i32 = 3000;

/// Ask `discovery_uri` (a `tcp://host:port` ZeroMQ REQ endpoint) for the
/// real publish URIs. Blocking — callers run this via `spawn_blocking`.
pub fn discover_zmq_uris(discovery_uri: &str) -> Result<DiscoveryUris> {
    let ctx = zmq::Context::new();
    let socket = ctx
        .socket(zmq::REQ)
        .map_err(|e| EpcpError::Discovery(format!("socket create failed: {e}")))?;
    socket
        .set_sndtimeo(SEND_TIMEOUT_MS)
        .map_err(|e| EpcpError::Discovery(e.to_string()))?;
    socket
        .set_rcvtimeo(RECV_TIMEOUT_MS)
        .map_err(|e| EpcpError::Discovery(e.to_string()))?;
    socket
        .set_linger(0)
        .map_err(|e| EpcpError::Discovery(e.to_string()))?;
    socket
        .connect(discovery_uri)
        .map_err(|e| EpcpError::Discovery(format!("connect failed: {e}")))?;

    let request = DiscoveryRequest::get_zmq_uris();
    let payload = serde_json::to_vec(&request)
        .map_err(|e| EpcpError::Discovery(format!("request encoding failed: {e}")))?;
    socket
        .send(payload, 0)
        .map_err(|e| EpcpError::Discovery(format!("send timed out or failed: {e}")))?;

    let raw = socket
        .recv_bytes(0)
        .map_err(|e| EpcpError::Discovery(format!("recv timed out or failed: {e}")))?;
    let reply: DiscoveryReply = serde_json::from_slice(&raw)
        .map_err(|e| EpcpError::Discovery(format!("malformed reply: {e}")))?;

    if !reply.success {
        return Err(EpcpError::Discovery("discovery endpoint reported failure".to_owned()));
    }
    let mut uris = reply
        .value
        .ok_or_else(|| EpcpError::Discovery("discovery endpoint returned no uris".to_owned()))?;

    // `spec.md` §4.5: resolve a `*` wildcard against the command URI's host,
    // or `localhost` if the command URI isn't host-based.
    let host = extract_host(discovery_uri).unwrap_or_else(|| "localhost".to_owned());
    uris.publish_pull = uris.publish_pull.map(|u| substitute_wildcard(&u, &host));
    uris.publish_sub = uris.publish_sub.map(|u| substitute_wildcard(&u, &host));

    Ok(uris)
}

fn extract_host(uri: &str) -> Option<String> {
    let after_scheme = uri.split("://").nth(1)?;
    let host = after_scheme.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_owned())
    }
}

fn substitute_wildcard(uri: &str, host: &str) -> String {
    uri.replacen("://*:", &format!("://{host}:"), 1)
}
