//! Interactive process sessions with an incremental expectation engine.
//!
//! This crate spawns endpoint processes (a device under test, peer servers,
//! peer client tools) in pseudo-terminals, sends them command lines, and
//! waits for patterns in what they print.
//!
//! # Overview
//!
//! - [`Session`]: one process, its process group, and its buffered output
//! - [`SessionOptions`]: command line, directory, environment, timeouts
//! - [`Pattern`]: literal or regular-expression expectation target
//! - [`ExpectBuffer`] / [`Expectation`]: the matching engine
//! - [`HarnessError`]: timeout, spawn, assertion and plumbing failures
//!
//! # Example
//!
//! ```no_run
//! use coapt_harness::{Session, SessionOptions};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), coapt_harness::HarnessError> {
//! let mut node = Session::new(SessionOptions::new("make term")?.working_dir("/opt/app"));
//! node.connect()?;
//! node.expect("gcoap .* app")?;
//! node.send_recv_timeout("coap info", "CoAP server", Duration::from_secs(3))?;
//! node.disconnect();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod expect;
pub mod pattern;
pub mod session;

pub use error::HarnessError;
pub use expect::{ExpectBuffer, Expectation, Match, Outcome};
pub use pattern::Pattern;
pub use session::{IoMode, Session, SessionOptions, DEFAULT_TIMEOUT};
