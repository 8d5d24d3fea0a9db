//! Content hashing.
//!
//! A [`ContentHash`] is the hex SHA-256 of a document's normalized text, so
//! that line-ending churn and trailing whitespace from editors or exports do
//! not register as edits. Non-UTF-8 content is hashed as raw bytes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid content hash '{0}': expected 64 lowercase hex characters")]
pub struct InvalidContentHash(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        match std::str::from_utf8(content) {
            Ok(text) => hasher.update(normalize_content(text).as_bytes()),
            Err(_) => hasher.update(content),
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn of_str(text: &str) -> Self {
        Self::of(text.as_bytes())
    }

    /// Rehydrate a hash read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, InvalidContentHash> {
        let hex = hex.into();
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(hex))
        } else {
            Err(InvalidContentHash(hex))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CRLF and lone CR become LF; surrounding whitespace is trimmed.
pub fn normalize_content(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}
