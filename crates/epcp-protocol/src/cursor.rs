//! Opaque subscription-stream cursors.
//!
//! Cursors are treated as opaque tokens everywhere except for the one
//! documented comparison rule: a cursor's wire form is `base64(prefix_suffix)`,
//! and two cursors are equal iff their decoded suffixes match. Never compare
//! raw cursor strings directly.

use base64::Engine;

/// A cursor as received from the wire, plus its decoded comparable suffix.
#[derive(Debug, Clone)]
pub struct Cursor {
    raw: String,
    suffix: Option<String>,
}

impl Cursor {
    /// Parse a raw cursor string. Parsing never fails: a cursor that isn't
    /// valid base64, or has no `_` separator once decoded, simply has no
    /// comparable suffix and compares equal only to other such cursors with
    /// an identical raw form.
    pub fn parse(raw: &str) -> Self {
        let suffix = base64::engine::general_purpose::STANDARD
            .decode(raw)
            .ok()
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|decoded| decoded.split_once('_').map(|(_, suffix)| suffix.to_owned()));
        Cursor {
            raw: raw.to_owned(),
            suffix,
        }
    }

    /// The raw wire-form string (opaque; do not use for equality).
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        match (&self.suffix, &other.suffix) {
            (Some(a), Some(b)) => a == b,
            _ => self.raw == other.raw,
        }
    }
}

impl Eq for Cursor {}
