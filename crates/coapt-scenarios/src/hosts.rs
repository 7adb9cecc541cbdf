//! Factories for the endpoint processes scenarios drive.
//!
//! Every host is derived from the run configuration and the protocol
//! profile, so scenarios never read the environment or branch on the
//! transport themselves.

use std::path::PathBuf;
use std::time::Duration;

use coapt_harness::{HarnessError, Session, SessionOptions, DEFAULT_TIMEOUT};
use coapt_types::{ProtocolProfile, RunConfig};
use tracing::{debug, info};

/// Pause after starting a peer before it is expected to answer.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Command that builds and starts a device application.
pub const DEVICE_TERM_COMMAND: &str = "make term";

/// Which configured tree a device application lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppBase {
    /// The device OS tree (`RIOTBASE`), e.g. `examples/gcoap`.
    Device,
    /// The separate applications tree (`RIOTAPPSBASE`).
    Apps,
}

/// A device-under-test application.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Session name for logs.
    pub name: String,
    pub base: AppBase,
    /// Application directory relative to the base.
    pub app: PathBuf,
    /// Command line that builds and starts the application.
    pub command: String,
    /// Pattern printed once the shell is up.
    pub banner: String,
    /// Unicast address with prefix length, assigned after boot.
    pub address: Option<String>,
    /// Network interface id for the plain transport.
    pub netif: u32,
    /// Interface id when the secured transport is in use, if it differs.
    pub secured_netif: Option<u32>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl NodeSpec {
    pub fn new(base: AppBase, app: impl Into<PathBuf>, banner: impl Into<String>) -> Self {
        let app = app.into();
        Self {
            name: app
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "node".into()),
            base,
            app,
            command: DEVICE_TERM_COMMAND.into(),
            banner: banner.into(),
            address: None,
            netif: 6,
            secured_netif: None,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// The gcoap example, which doubles as client and server.
    pub fn gcoap_example() -> Self {
        Self::new(AppBase::Device, "examples/gcoap", "gcoap .* app")
            .address("fd00:bbbb::2/64")
            .secured_netif(5)
    }

    /// The resource-directory client example.
    pub fn cord_ep() -> Self {
        Self::new(AppBase::Device, "examples/cord_ep", "CoRE RD client example!")
            .address("fd00:bbbb::2/64")
            .netif(7)
    }

    /// The simplified registration example; no address assignment.
    pub fn cord_epsim() -> Self {
        Self::new(
            AppBase::Device,
            "examples/cord_epsim",
            "Simplified CoRE RD registration example",
        )
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace `make term`, e.g. to attach to an already flashed board.
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn netif(mut self, netif: u32) -> Self {
        self.netif = netif;
        self
    }

    pub fn secured_netif(mut self, netif: u32) -> Self {
        self.secured_netif = Some(netif);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Interface id to configure under `profile`.
    pub fn netif_for(&self, profile: &ProtocolProfile) -> u32 {
        match self.secured_netif {
            Some(netif) if profile.is_secured() => netif,
            _ => self.netif,
        }
    }
}

/// Where a peer process's executable is found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerBase {
    /// Run from the given directory (or the current one).
    Dir(Option<PathBuf>),
    /// The reference CoAP library tree (`LIBCOAP_BASE`). The command runs
    /// from `examples/` inside it when the base is set, and from `PATH`
    /// otherwise.
    Libcoap,
    /// The reference Python CoAP tree (`AIOCOAP_BASE`), added to `PYTHONPATH`.
    Aiocoap,
}

/// A peer server or client process.
#[derive(Debug, Clone)]
pub struct PeerSpec {
    pub name: String,
    /// Command line, shell-split.
    pub command: String,
    pub base: PeerBase,
    /// Append the profile's credential arguments under the secured transport.
    pub credentials: bool,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl PeerSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            base: PeerBase::Dir(None),
            credentials: false,
            env: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// The reference library's example server.
    pub fn libcoap_server() -> Self {
        Self::new("coap-server", "coap-server").base(PeerBase::Libcoap)
    }

    /// The reference library's resource directory.
    pub fn libcoap_rd() -> Self {
        Self::new("coap-rd", "coap-rd").base(PeerBase::Libcoap)
    }

    pub fn base(mut self, base: PeerBase) -> Self {
        self.base = base;
        self
    }

    pub fn in_dir(self, dir: impl Into<PathBuf>) -> Self {
        self.base(PeerBase::Dir(Some(dir.into())))
    }

    pub fn with_credentials(mut self) -> Self {
        self.credentials = true;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Builds sessions for device nodes and peer processes.
#[derive(Debug, Clone)]
pub struct HostFactory<'a> {
    config: &'a RunConfig,
    profile: &'a ProtocolProfile,
    settle: Duration,
}

impl<'a> HostFactory<'a> {
    pub fn new(config: &'a RunConfig, profile: &'a ProtocolProfile) -> Self {
        Self {
            config,
            profile,
            settle: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn profile(&self) -> &ProtocolProfile {
        self.profile
    }

    pub fn settle(&self) {
        if !self.settle.is_zero() {
            debug!(settle_ms = self.settle.as_millis() as u64, "waiting for peer to settle");
            std::thread::sleep(self.settle);
        }
    }

    /// Session options for a device application, without connecting.
    pub fn node_options(&self, spec: &NodeSpec) -> Result<SessionOptions, HarnessError> {
        let base = match spec.base {
            AppBase::Device => self.config.require_device_base()?,
            AppBase::Apps => self.config.require_apps_base()?,
        };
        Ok(SessionOptions::new(&spec.command)?
            .name(spec.name.clone())
            .working_dir(base.join(&spec.app))
            .env("BOARD", self.config.board.clone())
            .envs(spec.env.iter().cloned())
            .timeout(spec.timeout))
    }

    /// Start a device application and bring it to a usable shell.
    ///
    /// Waits for the banner and, when the node has an address, assigns it
    /// and waits for the shell to confirm.
    pub fn device_node(&self, spec: &NodeSpec) -> Result<Session, HarnessError> {
        let mut session = Session::new(self.node_options(spec)?);
        session.connect()?;
        session.expect(&spec.banner)?;

        if let Some(address) = &spec.address {
            let command = format!(
                "ifconfig {} add unicast {address}",
                spec.netif_for(self.profile)
            );
            session.send_recv(&command, "success:")?;
        }
        info!(node = %spec.name, "device node ready");
        Ok(session)
    }

    /// Session options for a peer process, without connecting.
    pub fn peer_options(&self, spec: &PeerSpec) -> Result<SessionOptions, HarnessError> {
        let (dir, command, env) = self.resolve_peer(spec)?;
        let mut options = SessionOptions::new(&command)?
            .name(spec.name.clone())
            .envs(env)
            .envs(spec.env.iter().cloned())
            .timeout(spec.timeout);
        if let Some(dir) = dir {
            options = options.working_dir(dir);
        }
        if spec.credentials {
            for arg in self.profile.peer_credential_args() {
                options = options.arg(arg);
            }
        }
        Ok(options)
    }

    fn resolve_peer(
        &self,
        spec: &PeerSpec,
    ) -> Result<(Option<PathBuf>, String, Vec<(String, String)>), HarnessError> {
        Ok(match &spec.base {
            PeerBase::Dir(dir) => (dir.clone(), spec.command.clone(), Vec::new()),
            PeerBase::Libcoap => match &self.config.libcoap_base {
                Some(base) => (
                    Some(base.clone()),
                    format!("examples/{}", spec.command),
                    Vec::new(),
                ),
                None => (None, spec.command.clone(), Vec::new()),
            },
            PeerBase::Aiocoap => {
                let mut env = Vec::new();
                if let Some(base) = &self.config.aiocoap_base {
                    env.push(("PYTHONPATH".to_string(), base.display().to_string()));
                }
                (None, spec.command.clone(), env)
            }
        })
    }

    /// Start a long-running peer (server, observer, load generator) and
    /// give it time to settle.
    pub fn peer_server(&self, spec: &PeerSpec) -> Result<Session, HarnessError> {
        let mut session = Session::new(self.peer_options(spec)?);
        session.connect()?;
        self.settle();
        info!(peer = %spec.name, "peer ready");
        Ok(session)
    }

    /// A peer tool ready for [`Session::run`] or a later `connect`.
    pub fn peer_tool(&self, spec: &PeerSpec) -> Result<Session, HarnessError> {
        Ok(Session::new(self.peer_options(spec)?))
    }
}
