//! Block-wise transfer validation.
//!
//! A single logical request is issued; the scenario checks the final
//! response code and a content signature known in advance. The block size
//! only parameterizes how the client is started, so a sweep over several
//! sizes must produce the same signature every time.

use std::time::Duration;

use coapt_harness::{HarnessError, Pattern, Session};
use tracing::info;

use crate::report::Steps;
use crate::scenario::Scenario;

/// Block sizes exercised by a default sweep.
pub const DEFAULT_BLOCK_SIZES: [u16; 3] = [16, 32, 64];

/// Starts a one-shot client for a block size.
pub type ClientLauncher = Box<dyn FnMut(u16) -> Result<Session, HarnessError>>;

/// What a completed transfer must show.
#[derive(Debug, Clone)]
pub struct BlockExpectation {
    /// Final response code, e.g. `2.04 Changed`. `None` when the client
    /// reports completion without one.
    pub response_code: Option<Pattern>,
    /// Content signature, e.g. a digest of the transferred payload.
    pub signature: Pattern,
}

impl BlockExpectation {
    pub fn new(response_code: Option<Pattern>, signature: Pattern) -> Self {
        Self {
            response_code,
            signature,
        }
    }

    /// Upload (block1) to a server that answers with a payload digest.
    pub fn changed(signature: &str) -> Self {
        Self::new(Some(Pattern::literal("2.04 Changed")), Pattern::literal(signature))
    }

    /// Download (block2) whose payload starts with a known text.
    pub fn content(signature: Pattern) -> Self {
        Self::new(Some(Pattern::literal("2.05 Content")), signature)
    }

    /// Check one-shot output, returning the matched signature text.
    fn verify(&self, output: &str) -> Result<String, HarnessError> {
        if let Some(code) = &self.response_code {
            if !code.is_match(output) {
                return Err(HarnessError::assertion(
                    format!("response code {code} missing"),
                    output,
                ));
            }
        }
        self.signature
            .find(output)
            .map(str::to_string)
            .ok_or_else(|| {
                HarnessError::assertion(format!("signature {} missing", self.signature), output)
            })
    }
}

enum Client {
    /// A device shell that issues the request itself.
    Interactive { session: Session, command: String },
    /// A peer tool started once per block size.
    OneShot {
        launch: ClientLauncher,
        sizes: Vec<u16>,
        current: Option<Session>,
    },
}

/// Block-wise transfer scenario.
pub struct BlockTransfer {
    name: String,
    client: Client,
    server: Option<Session>,
    expectation: BlockExpectation,
    timeout: Duration,
}

impl BlockTransfer {
    /// Send `command` on a device shell and wait for the completed transfer.
    pub fn interactive(
        session: Session,
        command: impl Into<String>,
        expectation: BlockExpectation,
    ) -> Self {
        Self {
            name: format!("block {}", session.name()),
            client: Client::Interactive {
                session,
                command: command.into(),
            },
            server: None,
            expectation,
            timeout: Duration::from_secs(10),
        }
    }

    /// Run a one-shot client for every size in `sizes`.
    pub fn sweep<F>(sizes: &[u16], launch: F, expectation: BlockExpectation) -> Self
    where
        F: FnMut(u16) -> Result<Session, HarnessError> + 'static,
    {
        Self {
            name: "block sweep".into(),
            client: Client::OneShot {
                launch: Box::new(launch),
                sizes: sizes.to_vec(),
                current: None,
            },
            server: None,
            expectation,
            timeout: Duration::from_secs(10),
        }
    }

    /// The server side, kept alive until teardown.
    pub fn with_server(mut self, server: Session) -> Self {
        self.server = Some(server);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Scenario for BlockTransfer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn execute(&mut self, steps: &mut Steps) -> Result<String, HarnessError> {
        let expectation = &self.expectation;
        let timeout = self.timeout;

        match &mut self.client {
            Client::Interactive { session, command } => {
                steps.run("START", || session.send(command))?;
                let signature = steps.run("COMPLETE", || {
                    if let Some(code) = &expectation.response_code {
                        session.expect_pattern(code, timeout)?;
                    }
                    Ok(session.expect_pattern(&expectation.signature, timeout)?.text)
                })?;
                steps.note("signature", signature);
            }
            Client::OneShot {
                launch,
                sizes,
                current,
            } => {
                let mut reference: Option<(u16, String)> = None;
                for &size in sizes.iter() {
                    let step = format!("COMPLETE_{size}");
                    let signature = steps.run(&step, || {
                        let client = current.insert(launch(size)?);
                        let output = client.run(timeout)?;
                        expectation.verify(&output)
                    })?;
                    info!(block_size = size, signature = %signature, "block transfer complete");
                    steps.note(format!("signature_{size}"), signature.clone());

                    match &reference {
                        Some((first, expected)) if *expected != signature => {
                            return Err(HarnessError::assertion(
                                format!(
                                    "signature for block size {size} differs from block size {first}: {signature} != {expected}"
                                ),
                                String::new(),
                            ));
                        }
                        Some(_) => {}
                        None => reference = Some((size, signature)),
                    }
                }
                if let Some((_, signature)) = reference {
                    steps.note("signature", signature);
                }
            }
        }
        Ok("COMPLETE".into())
    }

    fn sessions(&mut self) -> Vec<&mut Session> {
        let mut sessions = Vec::new();
        match &mut self.client {
            Client::Interactive { session, .. } => sessions.push(session),
            Client::OneShot { current, .. } => {
                if let Some(session) = current.as_mut() {
                    sessions.push(session);
                }
            }
        }
        if let Some(server) = self.server.as_mut() {
            sessions.push(server);
        }
        sessions
    }
}
