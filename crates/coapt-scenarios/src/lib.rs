//! Scenario orchestrators for CoAP conformance runs.
//!
//! Each orchestrator owns the sessions it drives and follows one state
//! machine:
//!
//! - [`BlockTransfer`]: `START -> COMPLETE`, over one or more block sizes
//! - [`ConfirmableRetry`]: `SEND -> WAIT_ACK -> {RECOVERED | EXHAUSTED}`
//! - [`ObserveLifecycle`]: `REGISTER -> (NOTIFY)* -> CANCEL`
//! - [`RegistrationLifecycle`]: `DISCOVER -> REGISTER -> (RENEW)* -> (UPDATE)* -> REMOVE`
//! - [`SimpleRegistration`], [`ClientGet`], [`ClientServer`], [`ResourceQuery`]
//!
//! [`run_scenario`] executes any of them and disconnects every owned
//! session afterwards, pass or fail. [`HostFactory`] builds the sessions
//! from the run configuration and protocol profile.

pub mod block;
pub mod hosts;
pub mod observe;
pub mod registration;
pub mod report;
pub mod request;
pub mod retry;
pub mod scenario;

pub use block::{BlockExpectation, BlockTransfer, DEFAULT_BLOCK_SIZES};
pub use hosts::{AppBase, HostFactory, NodeSpec, PeerBase, PeerSpec, SETTLE_DELAY};
pub use observe::{ObserveLifecycle, ObservePatterns, Trigger};
pub use registration::{
    RegistrationLifecycle, RegistrationPatterns, Renewal, SimpleRegistration,
    SimpleRegistrationPatterns,
};
pub use report::{ScenarioReport, StepRecord, Steps};
pub use request::{ClientGet, ClientServer, GetRequest, ResourceQuery};
pub use retry::{CoapTiming, ConfirmableRetry, RetryOutcome, RetryPlan};
pub use scenario::{run_scenario, Scenario};
