//! Wire types for the EPCP HTTP subscription APIs and the message-bus
//! discovery handshake. These are deliberately thin serde structs — the
//! crate doesn't interpret the fields beyond what `spec.md` §6 describes.

use serde::{Deserialize, Serialize};

/// One entry in a `subscriptions/items/` page, or the payload of a single
/// `subscriptions/stream/` record.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionItem {
    pub state: String,
    pub channel: String,
}

/// Response body of `GET <base>/subscriptions/items/[?since=cursor:<c>]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BulkItemsResponse {
    pub items: Vec<SubscriptionItem>,
    pub last_cursor: Option<String>,
}

/// One newline-framed JSON record from `GET <base>/subscriptions/stream/`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamRecord {
    pub item: SubscriptionItem,
    pub prev_cursor: Option<String>,
    pub cursor: String,
}

/// Request body for the message-bus URI discovery handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub method: String,
}

impl DiscoveryRequest {
    pub fn get_zmq_uris() -> Self {
        DiscoveryRequest {
            method: "get-zmq-uris".to_owned(),
        }
    }
}

/// The `value` payload of a successful discovery reply.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryUris {
    #[serde(rename = "publish-pull")]
    pub publish_pull: Option<String>,
    #[serde(rename = "publish-sub")]
    pub publish_sub: Option<String>,
}

/// Reply to a discovery request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryReply {
    pub success: bool,
    #[serde(default)]
    pub value: Option<DiscoveryUris>,
}
