//! A Rust client for the Extensible Pubsub Control Protocol: encodes items,
//! authenticates, and publishes them over HTTP or a ZeroMQ message bus,
//! fanning out across multiple endpoints and tracking their subscribers.
//!
//! The pieces compose from the bottom up:
//! - [`item`] builds the transport-neutral payload ([`item::Item`]).
//! - [`auth`] computes the `Authorization` header for one endpoint.
//! - [`http_publisher`] and [`bus_publisher`] each publish to one endpoint,
//!   the former batching over HTTP, the latter framing onto a ZeroMQ socket.
//! - [`subscription_monitor`] and [`subscription_controller`] track which
//!   channels have subscribers, over HTTP and ZeroMQ's XPUB respectively.
//! - [`orchestrator`] fans a single publish out across many endpoints and
//!   aggregates their results.

pub mod aggregator;
pub mod auth;
pub mod bus_publisher;
pub mod config;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod http_publisher;
pub mod item;
pub mod orchestrator;
pub mod subscription_controller;
pub mod subscription_event;
pub mod subscription_monitor;

pub use auth::AuthConfig;
pub use bus_publisher::{BusMode, BusPublisher};
pub use config::{load_config_file, ConfigEntry, JwtAuth};
pub use error::{EpcpError, Result};
pub use framing::{BinaryFraming, JsonFraming};
pub use http_publisher::{Callback, HttpPublisher};
pub use item::{Format, Item, Value};
pub use orchestrator::Orchestrator;
pub use subscription_controller::SubscriptionController;
pub use subscription_event::{EventCallback, SubscriptionEvent, SubscriptionSource};
pub use subscription_monitor::SubscriptionMonitor;
