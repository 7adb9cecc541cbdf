//! Multi-process CoAP conformance harness.
//!
//! Drives a device under test and its peers through interactive terminals
//! and checks protocol behaviour from the text they print: block-wise
//! transfer, confirmable retry, observe lifecycles and resource-directory
//! registration.
//!
//! This crate re-exports the workspace's public API:
//!
//! - [`types`]: run configuration, protocol profile, credentials
//! - [`pilot`]: PTY spawning and process-group teardown
//! - [`harness`]: sessions and the expectation engine
//! - [`scenarios`]: host factories and scenario orchestrators

pub use coapt_harness as harness;
pub use coapt_pilot as pilot;
pub use coapt_scenarios as scenarios;
pub use coapt_types as types;

pub use coapt_harness::{HarnessError, IoMode, Match, Pattern, Session, SessionOptions};
pub use coapt_scenarios::{run_scenario, HostFactory, Scenario, ScenarioReport};
pub use coapt_types::{CoaptError, ProtocolProfile, RunConfig, Transport};

/// Test-runner support.
pub mod testing {
    use std::sync::Once;

    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();

    /// Install a `tracing` subscriber filtered by `RUST_LOG`.
    ///
    /// Safe to call from every test; only the first call installs anything.
    /// Output goes through the test writer so it is captured per test.
    pub fn init_tracing() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_target(false)
                .with_test_writer()
                .try_init();
        });
    }
}
