//! DTLS pre-shared key credentials.
//!
//! Peer tools read their credentials from a JSON file keyed by URI pattern:
//!
//! ```json
//! {
//!   "coaps://[fd00:bbbb::2]/*": {
//!     "dtls": {
//!       "psk": { "ascii": "secretPSK" },
//!       "client-identity": { "ascii": "Client_identity" }
//!     }
//!   }
//! }
//! ```
//!
//! The harness reads the same file so scenarios can hand the identity and
//! key to device-side commands without duplicating them in configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::CoaptError;

#[derive(Debug, Deserialize)]
struct CredentialEntry {
    dtls: DtlsEntry,
}

#[derive(Debug, Deserialize)]
struct DtlsEntry {
    psk: Secret,
    #[serde(rename = "client-identity")]
    client_identity: Secret,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Secret {
    Ascii(String),
    Hex(String),
}

impl Secret {
    fn into_bytes(self) -> Result<Vec<u8>, CoaptError> {
        match self {
            Secret::Ascii(text) => Ok(text.into_bytes()),
            Secret::Hex(text) => hex::decode(text.trim())
                .map_err(|e| CoaptError::CredentialsError(format!("invalid hex secret: {e}"))),
        }
    }
}

/// Pre-shared key and identity for the secured transport.
#[derive(Clone, PartialEq, Eq)]
pub struct DtlsCredentials {
    /// URI pattern the credentials apply to (e.g. `coaps://[fd00:bbbb::2]/*`).
    pub uri_pattern: String,
    /// Client identity presented during the handshake.
    pub identity: Vec<u8>,
    /// Pre-shared key.
    pub psk: Vec<u8>,
    /// File the credentials were loaded from, handed to peer tools.
    pub source: Option<PathBuf>,
}

impl std::fmt::Debug for DtlsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtlsCredentials")
            .field("uri_pattern", &self.uri_pattern)
            .field("identity", &String::from_utf8_lossy(&self.identity))
            .field("psk", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

impl DtlsCredentials {
    /// Load credentials from a JSON file.
    ///
    /// When the file holds several entries, the first by URI pattern order is
    /// used. Use [`parse_all`](Self::parse_all) to inspect every entry.
    pub fn load(path: &Path) -> Result<Self, CoaptError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoaptError::ConfigError(format!(
                "cannot read credentials file {}: {e}",
                path.display()
            ))
        })?;
        let mut creds = Self::parse_all(&content)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                CoaptError::CredentialsError(format!(
                    "no credentials found in {}",
                    path.display()
                ))
            })?;
        creds.source = Some(path.to_path_buf());
        Ok(creds)
    }

    /// Parse every entry of a credentials document, ordered by URI pattern.
    pub fn parse_all(content: &str) -> Result<Vec<Self>, CoaptError> {
        let entries: BTreeMap<String, CredentialEntry> = serde_json::from_str(content)
            .map_err(|e| CoaptError::CredentialsError(e.to_string()))?;
        entries
            .into_iter()
            .map(|(uri_pattern, entry)| {
                Ok(Self {
                    uri_pattern,
                    identity: entry.dtls.client_identity.into_bytes()?,
                    psk: entry.dtls.psk.into_bytes()?,
                    source: None,
                })
            })
            .collect()
    }

    /// Whether these credentials apply to `uri`.
    ///
    /// A trailing `*` in the pattern matches any suffix.
    pub fn applies_to(&self, uri: &str) -> bool {
        match self.uri_pattern.strip_suffix('*') {
            Some(prefix) => uri.starts_with(prefix),
            None => uri == self.uri_pattern,
        }
    }

    /// The identity as text, for device shell commands.
    pub fn identity_str(&self) -> String {
        String::from_utf8_lossy(&self.identity).into_owned()
    }

    /// The key as text, for device shell commands.
    pub fn psk_str(&self) -> String {
        String::from_utf8_lossy(&self.psk).into_owned()
    }
}
