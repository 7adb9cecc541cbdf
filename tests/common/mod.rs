//! Shared helpers for integration tests.
//!
//! Each integration test file compiles common/ as its own module, so not
//! every helper is used in every file.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;

use coapt::scenarios::{NodeSpec, PeerSpec};
use coapt::{HostFactory, ProtocolProfile, RunConfig};

/// Settle delay used against the fake peers, which are ready immediately.
pub const FAST_SETTLE: Duration = Duration::from_millis(100);

/// Absolute path of a script under tests/fixtures.
pub fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

/// Command line running a fixture script through `/bin/sh`.
pub fn sh(name: &str, args: &str) -> String {
    let script = fixture(name);
    if args.is_empty() {
        format!("/bin/sh {}", script.display())
    } else {
        format!("/bin/sh {} {args}", script.display())
    }
}

/// A scratch device tree plus a state directory shared by the fake
/// endpoints of one test.
pub struct Bench {
    root: TempDir,
    pub config: RunConfig,
}

impl Bench {
    pub fn new() -> Self {
        coapt::testing::init_tracing();
        let root = tempfile::tempdir().expect("should create bench directory");
        for app in ["examples/gcoap", "examples/cord_ep", "examples/cord_epsim"] {
            std::fs::create_dir_all(root.path().join("riot").join(app))
                .expect("should create app directory");
        }
        std::fs::create_dir_all(root.path().join("state")).expect("should create state directory");

        let riot = root.path().join("riot");
        let config = RunConfig::from_vars([("RIOTBASE", riot.display().to_string())])
            .expect("bench configuration should parse");
        Self { root, config }
    }

    /// Directory the fake endpoints use to talk to each other.
    pub fn state_dir(&self) -> PathBuf {
        self.root.path().join("state")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    pub fn hosts<'a>(&'a self, profile: &'a ProtocolProfile) -> HostFactory<'a> {
        HostFactory::new(&self.config, profile).with_settle_delay(FAST_SETTLE)
    }

    /// A device preset re-pointed at the fake node shell.
    pub fn node(&self, spec: NodeSpec) -> NodeSpec {
        spec.command(sh("fake_node.sh", ""))
            .env("STATE_DIR", self.state_dir().display().to_string())
            .timeout(Duration::from_secs(5))
    }

    /// A peer running a fixture script with the shared state directory.
    pub fn peer(&self, name: &str, script: &str, args: &str) -> PeerSpec {
        PeerSpec::new(name, sh(script, args))
            .env("STATE_DIR", self.state_dir().display().to_string())
            .timeout(Duration::from_secs(5))
    }
}

/// Write a credentials file and return the secured profile loaded from it.
pub fn secured_profile(bench: &Bench) -> ProtocolProfile {
    let path = bench.path("dtls-credentials.json");
    std::fs::write(
        &path,
        r#"{"coaps://[fd00:bbbb::2]/*": {"dtls": {
            "psk": {"ascii": "secretPSK"},
            "client-identity": {"ascii": "Client_identity"}}}}"#,
    )
    .expect("should write credentials");
    let config = RunConfig {
        credentials_path: Some(path),
        ..bench.config.clone()
    }
    .merge_vars([("COAP_TRANSPORT", "coaps")])
    .expect("transport should parse");
    ProtocolProfile::from_config(&config).expect("secured profile should load")
}
