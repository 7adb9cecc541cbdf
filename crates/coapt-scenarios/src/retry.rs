//! Confirmable-message retry and timeout validation.
//!
//! A peer server silently drops the first K requests it receives. The
//! endpoint under test retransmits with exponential back-off; with K below
//! its attempt budget it must eventually report the response
//! ([`RetryOutcome::Recovered`]), otherwise the client session's wait must
//! time out ([`RetryOutcome::Exhausted`]), which is the passing outcome for
//! that branch.

use std::fmt;
use std::time::Duration;

use coapt_harness::{HarnessError, Session};
use coapt_types::ProtocolProfile;
use tracing::info;

use crate::report::Steps;
use crate::request::DATE_TIME;
use crate::scenario::Scenario;

/// CoAP transmission parameters governing retransmission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoapTiming {
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    pub max_retransmit: u32,
}

impl Default for CoapTiming {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl CoapTiming {
    /// Transmissions of one request: the original plus every retransmission.
    pub fn max_attempts(&self) -> u32 {
        self.max_retransmit + 1
    }

    /// Worst-case time spent waiting on `ignored` unanswered transmissions.
    pub fn backoff_total(&self, ignored: u32) -> Duration {
        let doublings = 2f64.powi(ignored.min(30) as i32) - 1.0;
        self.ack_timeout.mul_f64(self.ack_random_factor * doublings)
    }

    /// Time from the first transmission to the last retransmission.
    pub fn max_transmit_span(&self) -> Duration {
        self.backoff_total(self.max_retransmit)
    }

    /// Time from the first transmission until the sender gives up.
    pub fn max_transmit_wait(&self) -> Duration {
        self.backoff_total(self.max_attempts())
    }
}

/// Terminal state of a retry scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Recovered,
    Exhausted,
}

impl RetryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryOutcome::Recovered => "RECOVERED",
            RetryOutcome::Exhausted => "EXHAUSTED",
        }
    }
}

impl fmt::Display for RetryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many application requests the server ignores, and the timing the
/// endpoint is expected to follow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPlan {
    pub ignores: u32,
    pub timing: CoapTiming,
    /// Extra time allowed on top of the protocol bound.
    pub slack: Duration,
}

impl RetryPlan {
    pub fn new(ignores: u32) -> Self {
        Self {
            ignores,
            timing: CoapTiming::default(),
            slack: Duration::from_secs(5),
        }
    }

    pub fn timing(mut self, timing: CoapTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    /// The outcome a conforming endpoint produces.
    pub fn expected_outcome(&self) -> RetryOutcome {
        if self.ignores >= self.timing.max_attempts() {
            RetryOutcome::Exhausted
        } else {
            RetryOutcome::Recovered
        }
    }

    /// How long the client session waits for the response.
    ///
    /// When recovery is expected this covers the back-off before the first
    /// answered transmission; when exhaustion is expected it covers the
    /// endpoint's whole retransmission period, so a late success is caught.
    pub fn wait_window(&self) -> Duration {
        let bound = match self.expected_outcome() {
            RetryOutcome::Recovered => self.timing.backoff_total(self.ignores),
            RetryOutcome::Exhausted => self.timing.max_transmit_wait(),
        };
        bound + self.slack
    }
}

/// Starts the ignoring server, given the number of messages it must drop.
pub type ServerLauncher = Box<dyn FnOnce(u32) -> Result<Session, HarnessError>>;

/// Retry scenario: `SEND -> WAIT_ACK -> {RECOVERED | EXHAUSTED}`.
pub struct ConfirmableRetry {
    plan: RetryPlan,
    server_ignores: u32,
    client: Session,
    request: String,
    response: String,
    launch_server: Option<ServerLauncher>,
    server: Option<Session>,
}

impl ConfirmableRetry {
    /// `client` is a connected endpoint shell; `request` is the confirmable
    /// request command it runs. The server is started with the ignore count
    /// offset by the profile's transport setup messages.
    pub fn new<F>(
        profile: &ProtocolProfile,
        plan: RetryPlan,
        client: Session,
        request: impl Into<String>,
        launch_server: F,
    ) -> Self
    where
        F: FnOnce(u32) -> Result<Session, HarnessError> + 'static,
    {
        Self {
            server_ignores: profile.adjusted_ignores(plan.ignores),
            plan,
            client,
            request: request.into(),
            response: DATE_TIME.to_string(),
            launch_server: Some(Box::new(launch_server)),
            server: None,
        }
    }

    pub fn response_pattern(mut self, regex: impl Into<String>) -> Self {
        self.response = regex.into();
        self
    }

    /// Ignore count handed to the server.
    pub fn server_ignores(&self) -> u32 {
        self.server_ignores
    }

    pub fn plan(&self) -> &RetryPlan {
        &self.plan
    }
}

impl Scenario for ConfirmableRetry {
    fn name(&self) -> String {
        format!("con-retry ignores={}", self.plan.ignores)
    }

    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError> {
        let ignores = self.server_ignores;
        let launch = self
            .launch_server
            .take()
            .ok_or_else(|| HarnessError::assertion("retry scenario already executed", ""))?;

        let server = &mut self.server;
        let client = &mut self.client;
        let request = &self.request;
        steps.run("SEND", || {
            *server = Some(launch(ignores)?);
            client.send(request)
        })?;

        let expected = self.plan.expected_outcome();
        let window = self.plan.wait_window();
        let response = &self.response;
        info!(
            ignores = self.plan.ignores,
            server_ignores = ignores,
            window_ms = window.as_millis() as u64,
            expected = %expected,
            "waiting for acknowledgement"
        );

        let outcome = steps.run("WAIT_ACK", || {
            match (client.expect_timeout(response, window), expected) {
                (Ok(_), RetryOutcome::Recovered) => Ok(RetryOutcome::Recovered),
                (Err(e), RetryOutcome::Exhausted) if e.is_timeout() => Ok(RetryOutcome::Exhausted),
                (Ok(found), RetryOutcome::Exhausted) => Err(HarnessError::assertion(
                    format!(
                        "endpoint answered although all {} attempts should have been ignored",
                        self.plan.timing.max_attempts()
                    ),
                    format!("{}{}", found.before, found.text),
                )),
                (Err(e), _) => Err(e),
            }
        })?;
        steps.note("server_ignores", ignores.to_string());
        Ok(outcome.as_str().into())
    }

    fn sessions(&mut self) -> Vec<&mut Session> {
        let mut sessions = vec![&mut self.client];
        if let Some(server) = self.server.as_mut() {
            sessions.push(server);
        }
        sessions
    }
}
