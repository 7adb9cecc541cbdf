//! Transport-dependent protocol parameters.
//!
//! Every scenario runs against either the plain or the secured transport.
//! [`ProtocolProfile`] centralizes the values that differ between the two so
//! orchestrators build commands and addresses without branching on the
//! transport themselves. A profile is constructed once per run and only ever
//! read afterwards.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{CoaptError, DtlsCredentials, RunConfig};

/// Default port of the plain transport.
pub const PLAIN_PORT: u16 = 5683;

/// Default port of the secured transport.
pub const SECURED_PORT: u16 = 5684;

/// Handshake exchanges that precede the first application message on the
/// secured transport (ClientHello, then ClientHello with cookie).
pub const SECURED_SETUP_MESSAGES: u32 = 2;

/// Transport kind for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Transport {
    /// Unsecured UDP.
    #[default]
    #[serde(rename = "coap")]
    Plain,
    /// DTLS with pre-shared keys.
    #[serde(rename = "dtls")]
    Secured,
}

impl FromStr for Transport {
    type Err = CoaptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coap" | "plain" | "udp" => Ok(Transport::Plain),
            "dtls" | "coaps" | "secured" => Ok(Transport::Secured),
            other => Err(CoaptError::ConfigError(format!(
                "unknown transport {other:?} (expected \"coap\" or \"dtls\")"
            ))),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Plain => f.write_str("coap"),
            Transport::Secured => f.write_str("dtls"),
        }
    }
}

/// Immutable per-run transport parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolProfile {
    transport: Transport,
    port: u16,
    setup_messages: u32,
    credentials: Option<DtlsCredentials>,
}

impl ProtocolProfile {
    /// Profile for the plain transport.
    pub fn plain() -> Self {
        Self {
            transport: Transport::Plain,
            port: PLAIN_PORT,
            setup_messages: 0,
            credentials: None,
        }
    }

    /// Profile for the secured transport with the given credentials.
    pub fn secured(credentials: DtlsCredentials) -> Self {
        Self {
            transport: Transport::Secured,
            port: SECURED_PORT,
            setup_messages: SECURED_SETUP_MESSAGES,
            credentials: Some(credentials),
        }
    }

    /// Build the profile for a run.
    ///
    /// The secured transport requires a credentials file; a missing path or
    /// unreadable file is reported as a `ConfigError` before any process is
    /// spawned. A configured setup-message override replaces the default
    /// overhead of the secured transport and is ignored for plain runs.
    pub fn from_config(config: &RunConfig) -> Result<Self, CoaptError> {
        let profile = match config.transport {
            Transport::Plain => Self::plain(),
            Transport::Secured => {
                let path = config.require_credentials_path()?;
                let mut profile = Self::secured(DtlsCredentials::load(path)?);
                if let Some(count) = config.setup_messages {
                    profile.setup_messages = count;
                }
                profile
            }
        };

        info!(
            transport = %profile.transport,
            port = profile.port,
            setup_messages = profile.setup_messages,
            "protocol profile ready"
        );
        Ok(profile)
    }

    /// The transport this profile describes.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_secured(&self) -> bool {
        self.transport == Transport::Secured
    }

    /// URI scheme: `coap` or `coaps`.
    pub fn scheme(&self) -> &'static str {
        match self.transport {
            Transport::Plain => "coap",
            Transport::Secured => "coaps",
        }
    }

    /// Default server port for the transport.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Count of transport setup messages consumed before application traffic.
    pub fn setup_messages(&self) -> u32 {
        self.setup_messages
    }

    /// Credentials for the secured transport.
    pub fn credentials(&self) -> Option<&DtlsCredentials> {
        self.credentials.as_ref()
    }

    /// Offset an "ignore N requests" parameter by the setup-message overhead.
    ///
    /// A peer told to ignore `n` requests would otherwise count the handshake
    /// as application-level retries.
    pub fn adjusted_ignores(&self, n: u32) -> u32 {
        n.saturating_add(self.setup_messages)
    }

    /// Host part of a URI, bracketing bare IPv6 addresses.
    pub fn authority(host: &str) -> String {
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        }
    }

    /// Full URI for `path` on `host` using this profile's scheme.
    ///
    /// The port is omitted because it is implied by the scheme.
    pub fn uri(&self, host: &str, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        format!("{}://{}{}", self.scheme(), Self::authority(host), path)
    }

    /// Arguments that hand the credentials file to a peer tool.
    ///
    /// Empty for the plain transport.
    pub fn peer_credential_args(&self) -> Vec<String> {
        match self
            .credentials
            .as_ref()
            .and_then(|c| c.source.as_ref())
        {
            Some(path) => vec!["-c".to_string(), path.display().to_string()],
            None => Vec::new(),
        }
    }
}

impl Default for ProtocolProfile {
    fn default() -> Self {
        Self::plain()
    }
}
