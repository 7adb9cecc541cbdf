//! Observe (subscription) lifecycle validation:
//! `REGISTER -> (NOTIFY)* -> CANCEL`.
//!
//! The observer registers interest in a resource on the device. A second,
//! independent session then changes the resource's state; every trigger
//! must produce exactly one notification on the observer. After the
//! observer cancels, a further trigger must produce none.

use std::time::Duration;

use coapt_harness::{HarnessError, Session};
use tracing::debug;

use crate::report::Steps;
use crate::scenario::Scenario;

/// Patterns printed by the observing client.
#[derive(Debug, Clone)]
pub struct ObservePatterns {
    /// Initial response to the registration.
    pub registered: String,
    /// A notification caused by a trigger.
    pub notification: String,
    /// Response to the cancelling request.
    pub cancelled: String,
}

impl Default for ObservePatterns {
    fn default() -> Self {
        // Two options (Observe, Content-Format) while registered, one after
        Self {
            registered: r"First response:.*2\.05.*2 option".into(),
            notification: r"Next result:.*2\.05.*2 option".into(),
            cancelled: r"Final result:.*2\.05.*1 option".into(),
        }
    }
}

/// A command run on the trigger session and its acknowledgement.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub command: String,
    pub ack: String,
}

impl Trigger {
    pub fn new(command: impl Into<String>, ack: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ack: ack.into(),
        }
    }
}

/// Observe lifecycle scenario.
pub struct ObserveLifecycle {
    observer: Session,
    trigger_host: Session,
    server: Option<Session>,
    trigger: Trigger,
    patterns: ObservePatterns,
    notifications: u32,
    quiet_window: Duration,
    check_after_cancel: bool,
}

impl ObserveLifecycle {
    /// `observer` is the registering client; `trigger_host` runs the
    /// trigger command. Both must already be connected.
    pub fn new(observer: Session, trigger_host: Session, trigger: Trigger) -> Self {
        Self {
            observer,
            trigger_host,
            server: None,
            trigger,
            patterns: ObservePatterns::default(),
            notifications: 1,
            quiet_window: Duration::from_secs(3),
            check_after_cancel: true,
        }
    }

    pub fn patterns(mut self, patterns: ObservePatterns) -> Self {
        self.patterns = patterns;
        self
    }

    /// Triggers (and therefore notifications) before cancellation.
    pub fn notifications(mut self, count: u32) -> Self {
        self.notifications = count;
        self
    }

    /// How long to watch for a duplicate or post-cancel notification.
    pub fn quiet_window(mut self, window: Duration) -> Self {
        self.quiet_window = window;
        self
    }

    /// Skip the post-cancellation trigger.
    pub fn skip_check_after_cancel(mut self) -> Self {
        self.check_after_cancel = false;
        self
    }

    /// A helper peer (e.g. the server the trigger queries), torn down with
    /// the scenario.
    pub fn with_server(mut self, server: Session) -> Self {
        self.server = Some(server);
        self
    }
}

impl Scenario for ObserveLifecycle {
    fn name(&self) -> String {
        format!("observe {}", self.observer.name())
    }

    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError> {
        let observer = &mut self.observer;
        let trigger_host = &mut self.trigger_host;
        let trigger = &self.trigger;
        let patterns = &self.patterns;
        let window = self.quiet_window;

        steps.run("REGISTER", || observer.expect(&patterns.registered).map(|_| ()))?;

        for i in 0..self.notifications {
            steps.run("NOTIFY", || {
                trigger_host.send_recv(&trigger.command, &trigger.ack)?;
                observer.expect(&patterns.notification)?;
                // Exactly one per trigger
                observer.expect_absent(&patterns.notification, window)
            })?;
            debug!(notification = i + 1, "notification observed");
        }
        steps.note("notifications", self.notifications.to_string());

        steps.run("CANCEL", || observer.expect(&patterns.cancelled).map(|_| ()))?;

        if self.check_after_cancel {
            steps.run("SILENT", || {
                trigger_host.send_recv(&trigger.command, &trigger.ack)?;
                observer.expect_absent(&patterns.notification, window)
            })?;
        }
        Ok("CANCELLED".into())
    }

    fn sessions(&mut self) -> Vec<&mut Session> {
        let mut sessions = vec![&mut self.observer, &mut self.trigger_host];
        if let Some(server) = self.server.as_mut() {
            sessions.push(server);
        }
        sessions
    }
}
