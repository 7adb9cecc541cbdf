//! Resource-directory registration lifecycles.
//!
//! [`RegistrationLifecycle`] drives the full client through
//! `DISCOVER -> REGISTER -> (RENEW)* -> (UPDATE)* -> REMOVE`. Renewal is
//! not commanded: the endpoint's own timer re-registers, and the scenario
//! only watches for it at increasing deadlines. [`SimpleRegistration`]
//! covers the simplified endpoint, which registers on its own at boot.

use std::time::{Duration, Instant};

use coapt_harness::{HarnessError, Session};
use tracing::info;

use crate::report::Steps;
use crate::scenario::Scenario;

/// Shell output of the registration client.
#[derive(Debug, Clone)]
pub struct RegistrationPatterns {
    pub discovered: String,
    pub registered: String,
    pub renewed: String,
    pub updated: String,
    pub removed: String,
}

impl Default for RegistrationPatterns {
    fn default() -> Self {
        Self {
            discovered: "registration interface is".into(),
            registered: "registration successful".into(),
            renewed: "successfully updated client registration".into(),
            updated: "RD update successful".into(),
            removed: "dropped client registration".into(),
        }
    }
}

/// Automatic re-registrations to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Renewal {
    /// Upper bound between consecutive renewals.
    pub within: Duration,
    pub count: u32,
}

/// Full registration lifecycle against a directory server.
pub struct RegistrationLifecycle {
    node: Session,
    directory: Session,
    directory_address: String,
    discover: bool,
    renewal: Option<Renewal>,
    updates: u32,
    update_pause: Duration,
    patterns: RegistrationPatterns,
}

impl RegistrationLifecycle {
    /// `directory_address` is written as the shell expects it, e.g.
    /// `[fd00:bbbb::1]`.
    pub fn new(node: Session, directory: Session, directory_address: impl Into<String>) -> Self {
        Self {
            node,
            directory,
            directory_address: directory_address.into(),
            discover: true,
            renewal: None,
            updates: 0,
            update_pause: Duration::from_secs(10),
            patterns: RegistrationPatterns::default(),
        }
    }

    pub fn skip_discovery(mut self) -> Self {
        self.discover = false;
        self
    }

    pub fn renewals(mut self, renewal: Renewal) -> Self {
        self.renewal = Some(renewal);
        self
    }

    /// Explicit updates, each preceded by `pause`.
    pub fn updates(mut self, count: u32, pause: Duration) -> Self {
        self.updates = count;
        self.update_pause = pause;
        self
    }

    pub fn patterns(mut self, patterns: RegistrationPatterns) -> Self {
        self.patterns = patterns;
        self
    }
}

impl Scenario for RegistrationLifecycle {
    fn name(&self) -> String {
        format!("registration {}", self.directory_address)
    }

    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError> {
        let node = &mut self.node;
        let patterns = &self.patterns;
        let rd = &self.directory_address;

        if self.discover {
            steps.run("DISCOVER", || {
                node.send_recv(&format!("cord_ep discover {rd}"), &patterns.discovered)
                    .map(|_| ())
            })?;
        }

        steps.run("REGISTER", || {
            node.send_recv(&format!("cord_ep register {rd}"), &patterns.registered)
                .map(|_| ())
        })?;
        let registered_at = Instant::now();

        if let Some(renewal) = self.renewal {
            for i in 1..=renewal.count {
                let deadline = registered_at + renewal.within * i;
                steps.run("RENEW", || {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    node.expect_timeout(&patterns.renewed, remaining).map(|_| ())
                })?;
                info!(renewal = i, "automatic re-registration observed");
            }
        }

        for _ in 0..self.updates {
            std::thread::sleep(self.update_pause);
            steps.run("UPDATE", || {
                node.send_recv("cord_ep update", &patterns.updated).map(|_| ())
            })?;
        }

        steps.run("REMOVE", || {
            node.send_recv("cord_ep remove", &patterns.removed).map(|_| ())
        })?;
        Ok("REMOVED".into())
    }

    fn sessions(&mut self) -> Vec<&mut Session> {
        vec![&mut self.node, &mut self.directory]
    }
}

/// Output of the simplified registration endpoint.
#[derive(Debug, Clone)]
pub struct SimpleRegistrationPatterns {
    /// Must never appear: the endpoint was built against loopback.
    pub wrong_directory: String,
    /// Initial registration response with its lifetime.
    pub lifetime: String,
    /// A registration update sent to the directory.
    pub update: String,
    /// Must not appear while the endpoint runs.
    pub fault: String,
}

impl Default for SimpleRegistrationPatterns {
    fn default() -> Self {
        Self {
            wrong_directory: r"\[::1\]".into(),
            lifetime: r"lt:.*s\r\n".into(),
            update: r"updating registration with RD \[fe80::.*5683\r\n".into(),
            fault: "(error|warning)".into(),
        }
    }
}

/// Simplified registration: the endpoint registers at boot and keeps
/// renewing on its own.
pub struct SimpleRegistration {
    node: Session,
    directory: Session,
    patterns: SimpleRegistrationPatterns,
    address_window: Duration,
    renewal_window: Duration,
    fault_window: Duration,
}

impl SimpleRegistration {
    pub fn new(node: Session, directory: Session) -> Self {
        Self {
            node,
            directory,
            patterns: SimpleRegistrationPatterns::default(),
            address_window: Duration::from_secs(10),
            renewal_window: Duration::from_secs(60),
            fault_window: Duration::from_secs(120),
        }
    }

    pub fn patterns(mut self, patterns: SimpleRegistrationPatterns) -> Self {
        self.patterns = patterns;
        self
    }

    /// Windows for the address check, one renewal, and the fault watch.
    pub fn windows(mut self, address: Duration, renewal: Duration, fault: Duration) -> Self {
        self.address_window = address;
        self.renewal_window = renewal;
        self.fault_window = fault;
        self
    }
}

impl Scenario for SimpleRegistration {
    fn name(&self) -> String {
        format!("simple-registration {}", self.node.name())
    }

    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError> {
        let node = &mut self.node;
        let p = &self.patterns;
        let (address_window, renewal_window, fault_window) =
            (self.address_window, self.renewal_window, self.fault_window);

        steps.run("DIRECTORY", || node.expect_absent(&p.wrong_directory, address_window))?;
        steps.run("REGISTER", || {
            node.expect(&p.lifetime)?;
            node.expect(&p.update).map(|_| ())
        })?;
        steps.run("RENEW", || {
            node.expect_timeout(&p.update, renewal_window).map(|_| ())
        })?;
        steps.run("QUIET", || node.expect_absent(&p.fault, fault_window))?;
        Ok("RENEWING".into())
    }

    fn sessions(&mut self) -> Vec<&mut Session> {
        vec![&mut self.node, &mut self.directory]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coapt_harness::Pattern;

    #[test]
    fn simple_patterns_match_endpoint_output() {
        let p = SimpleRegistrationPatterns::default();
        let update = Pattern::regex(&p.update).unwrap();
        assert!(update.is_match("updating registration with RD [fe80::1%6]:5683\r\n"));
        assert!(Pattern::regex(&p.lifetime).unwrap().is_match("lt: 60s\r\n"));
        assert!(Pattern::regex(&p.wrong_directory).unwrap().is_match("RD address: [::1]"));
        let fault = Pattern::regex(&p.fault).unwrap();
        assert!(fault.is_match("warning: resend buffer full"));
        assert!(!fault.is_match("registration updated"));
    }
}
