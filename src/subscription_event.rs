//! Shared subscription-event vocabulary for C4 (HTTP monitor) and C6 (XPUB
//! controller), and the trait the fan-out orchestrator (C7) uses to query
//! either kind of source uniformly when aggregating sub/unsub state.
//!
//! Grounded in `original_source/src/pubcontrol.py::_client_sub_callback`: both
//! sources report the same two-variant event, and the orchestrator treats
//! them identically regardless of which transport produced them.

use std::sync::Arc;

/// A channel gained ("sub") or lost ("unsub") its last/first known
/// subscriber, as observed by one source (one HTTP monitor, or the shared
/// XPUB controller). Ordering relative to the source's own set mutation is
/// documented on [`crate::subscription_monitor::SubscriptionMonitor`] and
/// [`crate::subscription_controller::SubscriptionController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Sub(String),
    Unsub(String),
}

impl SubscriptionEvent {
    pub fn channel(&self) -> &str {
        match self {
            SubscriptionEvent::Sub(c) | SubscriptionEvent::Unsub(c) => c,
        }
    }
}

/// Invoked once per subscribe/unsubscribe transition a source observes.
pub type EventCallback = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// A source of channel-subscription truth: one HTTP [`SubscriptionMonitor`]
/// per endpoint, or the one shared [`SubscriptionController`] for all
/// message-bus PUB-mode publishers.
///
/// [`SubscriptionMonitor`]: crate::subscription_monitor::SubscriptionMonitor
/// [`SubscriptionController`]: crate::subscription_controller::SubscriptionController
pub trait SubscriptionSource: Send + Sync {
    fn is_channel_subscribed_to(&self, channel: &str) -> bool;
}
