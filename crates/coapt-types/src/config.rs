//! Run configuration for a conformance test run.
//!
//! [`RunConfig`] gathers the handful of externally supplied values the
//! harness consumes: where the device-under-test and peer trees live, which
//! board is targeted, and which transport the run exercises. It is built once
//! at the start of a run, from the environment, from a TOML file, or from an
//! explicit variable mapping, and never mutated afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::profile::Transport;
use crate::CoaptError;

/// Board identifier meaning "run the device as a local native process".
pub const DEFAULT_BOARD: &str = "native";

/// Environment variable naming the device-under-test source tree.
pub const ENV_DEVICE_BASE: &str = "RIOTBASE";
/// Environment variable naming the tree holding device test applications.
pub const ENV_APPS_BASE: &str = "RIOTAPPSBASE";
/// Environment variable naming the libcoap reference tree.
pub const ENV_LIBCOAP_BASE: &str = "LIBCOAP_BASE";
/// Environment variable naming the aiocoap reference tree.
pub const ENV_AIOCOAP_BASE: &str = "AIOCOAP_BASE";
/// Environment variable naming the target board.
pub const ENV_BOARD: &str = "BOARD";
/// Environment variable selecting the transport (`coap` or `dtls`).
pub const ENV_TRANSPORT: &str = "COAP_TRANSPORT";
/// Environment variable naming the DTLS credentials file.
pub const ENV_CREDENTIALS: &str = "DTLS_CREDENTIALS";
/// Link-local address of the device-under-test TAP interface.
pub const ENV_SUT_LLADDR: &str = "TAP_LLADDR_SUT";
/// Link-local address of the remote TAP interface.
pub const ENV_REMOTE_LLADDR: &str = "TAP_LLADDR_REMOTE";
/// Override for the secured transport's setup-message overhead.
pub const ENV_SETUP_MESSAGES: &str = "COAP_SETUP_MESSAGES";

/// Externally supplied configuration for one test run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Device-under-test build tree (`RIOTBASE`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_base: Option<PathBuf>,
    /// Tree holding the device test applications (`RIOTAPPSBASE`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps_base: Option<PathBuf>,
    /// libcoap reference tree; `None` means the tools are on `PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub libcoap_base: Option<PathBuf>,
    /// aiocoap reference tree; `None` means the tools are on `PATH`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aiocoap_base: Option<PathBuf>,
    /// Target board identifier.
    pub board: String,
    /// Transport the run exercises.
    pub transport: Transport,
    /// DTLS credentials file, required for the secured transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<PathBuf>,
    /// Link-local address of the device TAP interface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sut_lladdr: Option<String>,
    /// Link-local address of the remote TAP interface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_lladdr: Option<String>,
    /// Override for the number of transport setup messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_messages: Option<u32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            device_base: None,
            apps_base: None,
            libcoap_base: None,
            aiocoap_base: None,
            board: DEFAULT_BOARD.to_string(),
            transport: Transport::Plain,
            credentials_path: None,
            sut_lladdr: None,
            remote_lladdr: None,
            setup_messages: None,
        }
    }
}

impl RunConfig {
    /// Read the configuration from the process environment.
    ///
    /// Call this once at the start of a run and pass the result down; the
    /// harness itself never consults ambient process state.
    pub fn from_env() -> Result<Self, CoaptError> {
        Self::from_vars(std::env::vars())
    }

    /// Build a configuration from an explicit variable mapping.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, CoaptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        Self::default().merge_vars(vars)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, CoaptError> {
        toml::from_str(content).map_err(|e| CoaptError::ConfigError(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, CoaptError> {
        toml::to_string_pretty(self).map_err(|e| CoaptError::ConfigError(e.to_string()))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, CoaptError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoaptError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Overlay variables from the process environment onto this configuration.
    pub fn merge_env(self) -> Result<Self, CoaptError> {
        self.merge_vars(std::env::vars())
    }

    /// Overlay an explicit variable mapping onto this configuration.
    ///
    /// Unknown variables are ignored; empty values are treated as unset.
    pub fn merge_vars<I, K, V>(mut self, vars: I) -> Result<Self, CoaptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            match key.as_ref() {
                ENV_DEVICE_BASE => self.device_base = Some(PathBuf::from(value)),
                ENV_APPS_BASE => self.apps_base = Some(PathBuf::from(value)),
                ENV_LIBCOAP_BASE => self.libcoap_base = Some(PathBuf::from(value)),
                ENV_AIOCOAP_BASE => self.aiocoap_base = Some(PathBuf::from(value)),
                ENV_BOARD => self.board = value.to_string(),
                ENV_TRANSPORT => self.transport = value.parse()?,
                ENV_CREDENTIALS => self.credentials_path = Some(PathBuf::from(value)),
                ENV_SUT_LLADDR => self.sut_lladdr = Some(value.to_string()),
                ENV_REMOTE_LLADDR => self.remote_lladdr = Some(value.to_string()),
                ENV_SETUP_MESSAGES => {
                    let count = value.parse().map_err(|e| {
                        CoaptError::ConfigError(format!(
                            "{ENV_SETUP_MESSAGES} must be a non-negative integer: {e}"
                        ))
                    })?;
                    self.setup_messages = Some(count);
                }
                _ => {}
            }
        }
        Ok(self)
    }

    /// Whether the device runs as a local native process.
    pub fn is_native(&self) -> bool {
        self.board == DEFAULT_BOARD
    }

    /// The device-under-test tree, or a `ConfigError` naming the variable.
    pub fn require_device_base(&self) -> Result<&Path, CoaptError> {
        require(self.device_base.as_deref(), ENV_DEVICE_BASE)
    }

    /// The device test application tree, or a `ConfigError`.
    pub fn require_apps_base(&self) -> Result<&Path, CoaptError> {
        require(self.apps_base.as_deref(), ENV_APPS_BASE)
    }

    /// The credentials file, or a `ConfigError`.
    pub fn require_credentials_path(&self) -> Result<&Path, CoaptError> {
        require(self.credentials_path.as_deref(), ENV_CREDENTIALS)
    }

    /// The device TAP link-local address, or a `ConfigError`.
    pub fn require_sut_lladdr(&self) -> Result<&str, CoaptError> {
        self.sut_lladdr
            .as_deref()
            .ok_or_else(|| missing(ENV_SUT_LLADDR))
    }

    /// The remote TAP link-local address, or a `ConfigError`.
    pub fn require_remote_lladdr(&self) -> Result<&str, CoaptError> {
        self.remote_lladdr
            .as_deref()
            .ok_or_else(|| missing(ENV_REMOTE_LLADDR))
    }
}

fn require<'a>(value: Option<&'a Path>, var: &str) -> Result<&'a Path, CoaptError> {
    value.ok_or_else(|| missing(var))
}

fn missing(var: &str) -> CoaptError {
    CoaptError::ConfigError(format!("{var} is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_native_plain() {
        let config = RunConfig::default();
        assert!(config.is_native());
        assert_eq!(config.transport, Transport::Plain);
        assert!(config.device_base.is_none());
    }

    #[test]
    fn from_vars_reads_known_variables() {
        let config = RunConfig::from_vars([
            ("RIOTBASE", "/src/riot"),
            ("BOARD", "samr21-xpro"),
            ("COAP_TRANSPORT", "dtls"),
            ("DTLS_CREDENTIALS", "/etc/creds.json"),
            ("TAP_LLADDR_SUT", "fe80::1"),
            ("UNRELATED", "ignored"),
        ])
        .unwrap();

        assert_eq!(config.device_base, Some(PathBuf::from("/src/riot")));
        assert_eq!(config.board, "samr21-xpro");
        assert!(!config.is_native());
        assert_eq!(config.transport, Transport::Secured);
        assert_eq!(config.credentials_path, Some(PathBuf::from("/etc/creds.json")));
        assert_eq!(config.require_sut_lladdr().unwrap(), "fe80::1");
    }

    #[test]
    fn empty_values_are_unset() {
        let config = RunConfig::from_vars([("RIOTBASE", ""), ("BOARD", "  ")]).unwrap();
        assert!(config.device_base.is_none());
        assert_eq!(config.board, DEFAULT_BOARD);
    }

    #[test]
    fn bad_transport_is_config_error() {
        let err = RunConfig::from_vars([("COAP_TRANSPORT", "carrier-pigeon")]).unwrap_err();
        assert!(matches!(err, CoaptError::ConfigError(_)), "got {err:?}");
    }

    #[test]
    fn bad_setup_messages_is_config_error() {
        let err = RunConfig::from_vars([("COAP_SETUP_MESSAGES", "-1")]).unwrap_err();
        assert!(err.to_string().contains("COAP_SETUP_MESSAGES"));
    }

    #[test]
    fn missing_required_value_names_variable() {
        let config = RunConfig::default();
        let err = config.require_device_base().unwrap_err();
        assert_eq!(err.to_string(), "configuration error: RIOTBASE is not set");
        assert!(config.require_apps_base().is_err());
        assert!(config.require_credentials_path().is_err());
        assert!(config.require_remote_lladdr().is_err());
    }

    #[test]
    fn toml_roundtrip() {
        let config = RunConfig {
            device_base: Some(PathBuf::from("/src/riot")),
            transport: Transport::Secured,
            credentials_path: Some(PathBuf::from("creds.json")),
            setup_messages: Some(3),
            ..RunConfig::default()
        };
        let text = config.to_toml().unwrap();
        let parsed = RunConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config = RunConfig::from_toml("device_base = \"/src/riot\"\n").unwrap();
        assert_eq!(config.board, DEFAULT_BOARD);
        assert_eq!(config.transport, Transport::Plain);
    }

    #[test]
    fn env_values_override_file_values() {
        let config = RunConfig::from_toml("board = \"iotlab-m3\"\ntransport = \"coap\"\n")
            .unwrap()
            .merge_vars([("COAP_TRANSPORT", "dtls")])
            .unwrap();
        assert_eq!(config.board, "iotlab-m3");
        assert_eq!(config.transport, Transport::Secured);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coapt.toml");
        std::fs::write(&path, "apps_base = \"/apps\"\n").unwrap();
        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.require_apps_base().unwrap(), Path::new("/apps"));

        let err = RunConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, CoaptError::ConfigError(_)));
    }
}
