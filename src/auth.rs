//! Auth header builder (C2).
//!
//! Grounded in `original_source/src/pubcontrolclient.py::_gen_auth_header`.
//! Basic and bearer credentials are mutually exclusive and guarded by one
//! mutex so that `current_header()` always observes a consistent pair —
//! a reader never sees half of one scheme and half of the other.

use base64::Engine;
use serde_json::{Map, Value};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{EpcpError, Result};

#[derive(Clone)]
enum AuthScheme {
    Basic { user: String, pass: String },
    Bearer { claim: Map<String, Value>, key: String },
}

/// Holds the currently-configured auth scheme for one endpoint. Cloneable
/// handles share the same underlying state (`Arc`-free here because the
/// owner, [`crate::http_publisher::HttpPublisher`], already wraps it in an
/// `Arc`).
pub struct AuthConfig {
    state: Mutex<Option<AuthScheme>>,
}

impl AuthConfig {
    pub fn new() -> Self {
        AuthConfig {
            state: Mutex::new(None),
        }
    }

    pub fn set_basic(&self, username: impl Into<String>, password: impl Into<String>) {
        let mut guard = self.state.lock().expect("auth mutex poisoned");
        *guard = Some(AuthScheme::Basic {
            user: username.into(),
            pass: password.into(),
        });
    }

    pub fn set_bearer(&self, claim: Map<String, Value>, key: impl Into<String>) {
        let mut guard = self.state.lock().expect("auth mutex poisoned");
        *guard = Some(AuthScheme::Bearer {
            claim,
            key: key.into(),
        });
    }

    pub fn clear(&self) {
        let mut guard = self.state.lock().expect("auth mutex poisoned");
        *guard = None;
    }

    /// Compute the `Authorization` header value for the credentials present
    /// right now. Call this at enqueue time, not at dispatch time — see
    /// `spec.md` §4.3 and §9 ("Auth header snapshotting").
    pub fn current_header(&self) -> Result<Option<String>> {
        let guard = self.state.lock().expect("auth mutex poisoned");
        match guard.as_ref() {
            None => Ok(None),
            Some(AuthScheme::Basic { user, pass }) => {
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
                Ok(Some(format!("Basic {encoded}")))
            }
            Some(AuthScheme::Bearer { claim, key }) => {
                let mut claim = claim.clone();
                if !claim.contains_key("exp") {
                    let exp = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .expect("system clock before unix epoch")
                        .as_secs()
                        + 3600;
                    claim.insert("exp".to_owned(), Value::from(exp));
                }
                let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
                let encoding_key = jsonwebtoken::EncodingKey::from_secret(key.as_bytes());
                let token = jsonwebtoken::encode(&header, &claim, &encoding_key)
                    .map_err(|e| EpcpError::InvalidConfig(format!("jwt signing failed: {e}")))?;
                Ok(Some(format!("Bearer {token}")))
            }
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}
