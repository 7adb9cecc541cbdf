//! Request/response scenarios: single GETs, repeated GETs, and a device
//! acting as client and server at once.

use std::path::PathBuf;
use std::time::Duration;

use coapt_harness::{HarnessError, Pattern, Session};
use coapt_types::ProtocolProfile;
use tracing::info;

use crate::report::Steps;
use crate::scenario::Scenario;

/// Time-of-day shape printed by the reference server's `/time` resource,
/// e.g. `Nov 04 11:21:58`.
pub const TIME_OF_DAY: &str = r"\w+ \w+ \d+:\d+:";

/// Date-and-time shape, e.g. `2018-11-04 17:20`.
pub const DATE_TIME: &str = r"\d+-\d+-\d+ \d+:\d";

/// Success response code counted in peer logs.
pub const CONTENT: &str = "2.05 Content";

/// A GET issued from a device shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub confirmable: bool,
}

impl GetRequest {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            confirmable: false,
        }
    }

    /// A request to `host` on the profile's port.
    pub fn for_profile(
        profile: &ProtocolProfile,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self::new(host, profile.port(), path)
    }

    pub fn confirmable(mut self, confirmable: bool) -> Self {
        self.confirmable = confirmable;
        self
    }

    /// The gcoap shell command, e.g. `coap get -c fd00:bbbb::1 5683 /time`.
    pub fn gcoap_command(&self) -> String {
        let mut cmd = String::from("coap get ");
        if self.confirmable {
            cmd.push_str("-c ");
        }
        cmd.push_str(&format!("{} {} {}", self.host, self.port, self.path));
        cmd
    }

    /// The nanocoap shell command, always confirmable:
    /// `client get <addr> 5683 /time`.
    pub fn nanocoap_command(&self) -> String {
        format!("client get {} {} {}", self.host, self.port, self.path)
    }
}

/// A device client fetching from a peer server, once or repeatedly.
pub struct ClientGet {
    node: Session,
    server: Session,
    request: GetRequest,
    response: String,
    modes: Vec<bool>,
    repeat: u32,
    pause: Duration,
    use_nanocoap: bool,
}

impl ClientGet {
    /// One non-confirmable and one confirmable GET, expecting a time of day.
    pub fn new(node: Session, server: Session, request: GetRequest) -> Self {
        Self {
            node,
            server,
            request,
            response: TIME_OF_DAY.to_string(),
            modes: vec![false, true],
            repeat: 1,
            pause: Duration::from_secs(1),
            use_nanocoap: false,
        }
    }

    /// `qty` sequential non-confirmable GETs with `pause` between them.
    pub fn repeated(
        node: Session,
        server: Session,
        request: GetRequest,
        qty: u32,
        pause: Duration,
    ) -> Self {
        Self {
            modes: vec![false],
            repeat: qty,
            pause,
            ..Self::new(node, server, request)
        }
    }

    /// Use the nanocoap shell syntax (confirmable only).
    pub fn nanocoap(mut self) -> Self {
        self.use_nanocoap = true;
        self.modes = vec![true];
        self
    }

    pub fn response_pattern(mut self, regex: impl Into<String>) -> Self {
        self.response = regex.into();
        self
    }

    fn command(&self, confirmable: bool) -> String {
        let request = self.request.clone().confirmable(confirmable);
        if self.use_nanocoap {
            request.nanocoap_command()
        } else {
            request.gcoap_command()
        }
    }
}

impl Scenario for ClientGet {
    fn name(&self) -> String {
        format!("client-get {}", self.request.path)
    }

    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError> {
        let mut sent = 0u32;
        for confirmable in self.modes.clone() {
            let command = self.command(confirmable);
            for i in 0..self.repeat {
                if i > 0 {
                    std::thread::sleep(self.pause);
                }
                let node = &mut self.node;
                let response = &self.response;
                steps.run(if confirmable { "GET_CON" } else { "GET_NON" }, || {
                    node.send_recv(&command, response).map(|_| ())
                })?;
                sent += 1;
            }
        }
        steps.note("responses", sent.to_string());
        Ok("RESPONDED".into())
    }

    fn sessions(&mut self) -> Vec<&mut Session> {
        vec![&mut self.node, &mut self.server]
    }
}

/// The device serves a peer's requests while issuing its own.
///
/// The peer client logs each response it receives to `log_path`; after the
/// device has finished its own requests the scenario counts lines matching
/// the success code and compares with the expected quantity.
pub struct ClientServer {
    inner: ClientGet,
    peer_client: Session,
    log_path: PathBuf,
    expected: usize,
    drain: Duration,
    counted: Pattern,
}

impl ClientServer {
    pub fn new(
        repeat: ClientGet,
        peer_client: Session,
        log_path: impl Into<PathBuf>,
        expected: usize,
    ) -> Self {
        Self {
            inner: repeat,
            peer_client,
            log_path: log_path.into(),
            expected,
            drain: Duration::from_secs(2),
            counted: Pattern::literal(CONTENT),
        }
    }

    /// How long to wait for the peer to finish after the device is done.
    pub fn drain(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    pub fn counted(mut self, pattern: Pattern) -> Self {
        self.counted = pattern;
        self
    }
}

/// Count the lines of `log` that contain `pattern`.
pub fn count_log_lines(log: &str, pattern: &Pattern) -> usize {
    log.lines().filter(|line| pattern.is_match(line)).count()
}

impl Scenario for ClientServer {
    fn name(&self) -> String {
        "client-server".into()
    }

    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError> {
        self.inner.execute(steps)?;

        std::thread::sleep(self.drain);
        let log_path = &self.log_path;
        let counted = &self.counted;
        let expected = self.expected;
        let count = steps.run("COUNT", || {
            let log = std::fs::read_to_string(log_path)?;
            let count = count_log_lines(&log, counted);
            if count != expected {
                return Err(HarnessError::assertion(
                    format!(
                        "expected {expected} responses matching {counted} in {}, found {count}",
                        log_path.display()
                    ),
                    log,
                ));
            }
            Ok(count)
        })?;
        info!(count, "peer client responses counted");
        steps.note("peer_responses", count.to_string());
        Ok("SERVED".into())
    }

    fn sessions(&mut self) -> Vec<&mut Session> {
        let mut sessions = self.inner.sessions();
        sessions.push(&mut self.peer_client);
        sessions
    }
}

/// A one-shot peer client querying a device resource.
pub struct ResourceQuery {
    client: Session,
    device: Option<Session>,
    expected: Pattern,
    timeout: Duration,
}

impl ResourceQuery {
    pub fn new(client: Session, expected: Pattern, timeout: Duration) -> Self {
        Self {
            client,
            device: None,
            expected,
            timeout,
        }
    }

    /// Keep the queried device alive for the duration of the scenario.
    pub fn against(mut self, device: Session) -> Self {
        self.device = Some(device);
        self
    }
}

impl Scenario for ResourceQuery {
    fn name(&self) -> String {
        format!("resource-query {}", self.client.name())
    }

    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError> {
        let client = &mut self.client;
        let timeout = self.timeout;
        let output = steps.run("QUERY", || client.run(timeout))?;
        let expected = &self.expected;
        steps.run("VERIFY", || {
            if expected.is_match(&output) {
                Ok(())
            } else {
                Err(HarnessError::assertion(
                    format!("response did not contain {expected}"),
                    output.clone(),
                ))
            }
        })?;
        Ok("ANSWERED".into())
    }

    fn sessions(&mut self) -> Vec<&mut Session> {
        let mut sessions = vec![&mut self.client];
        if let Some(device) = self.device.as_mut() {
            sessions.push(device);
        }
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn gcoap_command_formats() {
        let req = GetRequest::new("fd00:bbbb::1", 5683, "/time");
        assert_eq!(req.gcoap_command(), "coap get fd00:bbbb::1 5683 /time");
        assert_eq!(
            req.clone().confirmable(true).gcoap_command(),
            "coap get -c fd00:bbbb::1 5683 /time"
        );
        assert_eq!(req.nanocoap_command(), "client get fd00:bbbb::1 5683 /time");
    }

    #[test]
    fn request_port_follows_profile() {
        let req = GetRequest::for_profile(&ProtocolProfile::plain(), "fd00:bbbb::1", "/time");
        assert_eq!(req.port, 5683);
    }

    #[test]
    fn counts_matching_log_lines() {
        let log = "2.05 Content\n4.04 Not Found\n2.05 Content\n\n2.05 Content (retry)\n";
        assert_eq!(count_log_lines(log, &Pattern::literal(CONTENT)), 3);
        let re = Pattern::regex(r"^2\.05 Content$").unwrap();
        assert_eq!(count_log_lines(log, &re), 2);
    }

    #[test]
    fn response_shapes() {
        assert!(Regex::new(TIME_OF_DAY).unwrap().is_match("Nov 04 11:21:58"));
        assert!(Regex::new(DATE_TIME).unwrap().is_match("2018-11-04 17:20"));
    }
}
