//! Unified error type for the EPCP client.
//!
//! `spec.md` §7 names error kinds semantically, not by Rust type; this enum
//! is the single concrete representation all of them map to. Blocking calls
//! return `Result<_, EpcpError>`; non-blocking calls convert failures into
//! the `(bool, String)` callback contract via [`EpcpError::to_string`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EpcpError {
    /// Two formats in one `Item` share a `name()`. Never retried.
    #[error("invalid item: {0}")]
    InvalidItem(String),

    /// A configuration entry is inconsistent (bad URI combination, missing
    /// signing key, sub-callback without `require_subscribers`, ...).
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// An HTTP publish failed after the local retry.
    #[error("publish failed: HTTP {status}: {body}")]
    Publish { status: u16, body: String },

    /// A publish failed for a reason other than a non-2xx response (a
    /// transport-level error surviving the local retry).
    #[error("publish failed: {0}")]
    PublishTransport(String),

    /// Message-bus URI discovery failed or returned nothing usable.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// The subscription monitor gating this publisher is permanently
    /// unhealthy, so `require_subscribers` gating can't be decided.
    #[error("subscription state unknown: monitor is unhealthy")]
    SubscribersUnknown,

    /// Any operation on a closed client or orchestrator.
    #[error("use after close")]
    UseAfterClose,

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("message-bus transport error: {0}")]
    Bus(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EpcpError>;
