//! Declarative client configuration (`spec.md` §6) and an additive TOML
//! loader for it, in the style of the teacher's `config.rs`: a `Raw*` shape
//! deserialized straight off the file, validated and converted into the
//! typed shape the rest of the crate consumes.
//!
//! One [`ConfigEntry`] may produce an HTTP client, a message-bus client, or
//! both (`spec.md` §6: "one entry may produce one client of each kind").

use std::path::Path;

use serde::Deserialize;

use crate::error::{EpcpError, Result};

/// One configured endpoint, as accepted by
/// [`crate::orchestrator::Orchestrator::apply_config`]. Field names match
/// `spec.md` §6's configuration-entry key table exactly.
#[derive(Debug, Clone, Default)]
pub struct ConfigEntry {
    /// Base URL of an HTTP endpoint. Enables an HTTP client.
    pub uri: Option<String>,
    /// Bearer-token issuer claim. Only meaningful alongside `key`.
    pub iss: Option<String>,
    /// Symmetric key for bearer signing. Only meaningful alongside `iss`.
    pub key: Option<String>,
    /// Command-socket URI. Enables a message-bus client and, if either data
    /// URI below is missing, triggers the discovery handshake of `spec.md`
    /// §4.5.
    pub zmq_uri: Option<String>,
    /// Data URI for PUSH mode.
    pub zmq_push_uri: Option<String>,
    /// Data URI for PUB mode.
    pub zmq_pub_uri: Option<String>,
    /// Enables subscription gating on the HTTP client and selects PUB mode
    /// (over PUSH) on the message-bus client.
    pub require_subscribers: bool,
}

impl ConfigEntry {
    pub(crate) fn wants_bus_client(&self) -> bool {
        self.zmq_uri.is_some() || self.zmq_push_uri.is_some() || self.zmq_pub_uri.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.uri.is_none() && !self.wants_bus_client() {
            return Err(EpcpError::InvalidConfig(
                "config entry needs at least one of uri, zmq_uri, zmq_push_uri, zmq_pub_uri".to_owned(),
            ));
        }
        match (&self.iss, &self.key) {
            (Some(_), None) | (None, Some(_)) => Err(EpcpError::InvalidConfig(
                "iss and key must both be set or both omitted".to_owned(),
            )),
            _ => Ok(()),
        }
    }

    /// The bearer claim this entry's `iss`/`key` describe, if any.
    pub(crate) fn jwt_auth(&self) -> Option<JwtAuth> {
        match (&self.iss, &self.key) {
            (Some(iss), Some(key)) => {
                let mut claim = serde_json::Map::new();
                claim.insert("iss".to_owned(), serde_json::Value::String(iss.clone()));
                Some(JwtAuth { claim, key: key.clone() })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtAuth {
    pub claim: serde_json::Map<String, serde_json::Value>,
    pub key: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    endpoint: Vec<RawEndpoint>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEndpoint {
    uri: Option<String>,
    iss: Option<String>,
    key: Option<String>,
    zmq_uri: Option<String>,
    zmq_push_uri: Option<String>,
    zmq_pub_uri: Option<String>,
    #[serde(default)]
    require_subscribers: bool,
}

/// Load a list of [`ConfigEntry`] from a TOML file shaped like:
///
/// ```toml
/// [[endpoint]]
/// uri = "https://api.example.com/"
/// iss = "my-issuer"
/// key = "signing-secret"
/// require_subscribers = false
///
/// [[endpoint]]
/// zmq_uri = "tcp://bus.internal:5563"
/// require_subscribers = true
/// ```
pub fn load_config_file(path: &Path) -> Result<Vec<ConfigEntry>> {
    let text = std::fs::read_to_string(path)?;
    let raw: RawConfig = toml::from_str(&text)
        .map_err(|e| EpcpError::InvalidConfig(format!("{}: {e}", path.display())))?;

    raw.endpoint
        .into_iter()
        .map(|e| {
            let entry = ConfigEntry {
                uri: e.uri,
                iss: e.iss,
                key: e.key,
                zmq_uri: e.zmq_uri,
                zmq_push_uri: e.zmq_push_uri,
                zmq_pub_uri: e.zmq_pub_uri,
                require_subscribers: e.require_subscribers,
            };
            entry.validate()?;
            Ok(entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_needs_at_least_one_transport_uri() {
        let entry = ConfigEntry::default();
        assert!(entry.validate().is_err());
        let entry = ConfigEntry { uri: Some("https://example.com".to_owned()), ..Default::default() };
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn iss_and_key_must_be_set_together() {
        let entry = ConfigEntry {
            uri: Some("https://example.com".to_owned()),
            iss: Some("issuer".to_owned()),
            ..Default::default()
        };
        assert!(entry.validate().is_err());
    }

    #[test]
    fn an_entry_can_configure_both_an_http_and_a_bus_client() {
        let entry = ConfigEntry {
            uri: Some("https://example.com".to_owned()),
            zmq_uri: Some("tcp://bus.internal:5563".to_owned()),
            ..Default::default()
        };
        assert!(entry.validate().is_ok());
        assert!(entry.wants_bus_client());
    }

    #[test]
    fn loads_http_and_zmq_endpoints_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epcp.toml");
        std::fs::write(
            &path,
            r#"
            [[endpoint]]
            uri = "https://api.example.com/"
            require_subscribers = true
            iss = "my-issuer"
            key = "signing-secret"

            [[endpoint]]
            zmq_uri = "tcp://relay.internal:5560"
            "#,
        )
        .unwrap();

        let entries = load_config_file(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].require_subscribers);
        let jwt = entries[0].jwt_auth().unwrap();
        assert_eq!(jwt.key, "signing-secret");
        assert_eq!(jwt.claim["iss"], "my-issuer");
        assert_eq!(entries[1].zmq_uri.as_deref(), Some("tcp://relay.internal:5560"));
    }

    #[test]
    fn mismatched_iss_key_fields_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epcp.toml");
        std::fs::write(
            &path,
            r#"
            [[endpoint]]
            uri = "https://api.example.com/"
            iss = "my-issuer"
            "#,
        )
        .unwrap();

        assert!(load_config_file(&path).is_err());
    }
}
