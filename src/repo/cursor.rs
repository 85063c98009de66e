//! Opaque keyset-pagination cursors.
//!
//! A cursor carries the primary-key value of the last-seen row, base64
//! encoded over a small JSON envelope. Decoding validates the token fully
//! before it is ever used in a query.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::RepoError;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    k: JsonValue,
}

/// Opaque pointer to the last-seen row of a keyset page.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    key: JsonValue,
}

impl Cursor {
    pub(crate) fn from_key(key: JsonValue) -> Self {
        Self { key }
    }

    pub(crate) fn key(&self) -> &JsonValue {
        &self.key
    }

    /// Encodes the cursor as an opaque token.
    pub fn encode(&self) -> String {
        let bytes = serde_json::to_vec(&Envelope {
            k: self.key.clone(),
        })
        .expect("cursor envelope serializes");
        URL_SAFE_NO_PAD.encode(bytes)
    }

    /// Decodes and validates a cursor token.
    ///
    /// Fails with [`RepoError::Cursor`] on any malformed input - bad
    /// base64, bad JSON, or a missing/null key.
    pub fn decode(token: &str) -> Result<Self, RepoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|e| RepoError::Cursor(format!("invalid encoding: {e}")))?;
        let env: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| RepoError::Cursor(format!("invalid envelope: {e}")))?;
        if env.k.is_null() {
            return Err(RepoError::Cursor("cursor key is null".to_string()));
        }
        Ok(Self { key: env.k })
    }
}
