//! Wire types and opaque-cursor handling shared by the EPCP client and its
//! test utilities.

mod cursor;
mod wire;

pub use cursor::Cursor;
pub use wire::{BulkItemsResponse, DiscoveryReply, DiscoveryRequest, DiscoveryUris, StreamRecord, SubscriptionItem};
